//! Layered writer streaming images onto devices.
//!
//! Bytes pass through three layers before they reach the device:
//!
//! 1. [`LimitedWriter`] refuses to write more than the declared image size.
//! 2. [`FrameWriter`] buffers bytes and passes them on in whole frames.
//! 3. [`SyncingWriter`] writes to the device and syncs it periodically.

use std::fs::File;
use std::io::{self, Write};

/// Frames are at least this large.
pub const MIN_FRAME_SIZE: u64 = 1024 * 1024;

/// Compute the frame size for the given sector size.
///
/// Starting at the sector size, the size is doubled until it reaches
/// [`MIN_FRAME_SIZE`], so frames stay sector aligned.
pub fn frame_size(sector_size: u64) -> u64 {
    let mut size = sector_size.max(1);
    while size < MIN_FRAME_SIZE {
        size *= 2;
    }
    size
}

/// Error reported when writing past the limit.
pub fn no_space_error() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOSPC)
}

/// Writer that can be synced to stable storage.
pub trait SyncWrite: Write {
    fn sync(&mut self) -> io::Result<()>;
}

impl SyncWrite for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Writer refusing to write more than a fixed number of bytes.
///
/// Once the limit is reached, every non-empty write fails with `ENOSPC`.
#[derive(Debug)]
pub struct LimitedWriter<W> {
    inner: W,
    remaining: u64,
}

impl<W: Write> LimitedWriter<W> {
    pub fn new(inner: W, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
        }
    }

    /// Number of bytes which may still be written.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for LimitedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.remaining == 0 {
            return Err(no_space_error());
        }
        let allowed = usize::try_from(self.remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let written = self.inner.write(&buf[..allowed])?;
        self.remaining -= written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Writer passing bytes on in multiples of a frame size.
///
/// Bytes not filling a whole frame are retained until more bytes arrive or the
/// writer is flushed.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
    frame_size: usize,
    buffer: Vec<u8>,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W, frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            inner,
            frame_size,
            buffer: Vec::with_capacity(frame_size),
        }
    }

    /// Number of buffered bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> FrameWriter<W> {
    fn write_frames(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        if !self.buffer.is_empty() {
            let missing = self.frame_size - self.buffer.len();
            let (head, tail) = rest.split_at(missing.min(rest.len()));
            self.buffer.extend_from_slice(head);
            rest = tail;
            if self.buffer.len() < self.frame_size {
                return Ok(buf.len());
            }
            self.inner.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        let aligned = rest.len() - rest.len() % self.frame_size;
        if aligned > 0 {
            self.inner.write_all(&rest[..aligned])?;
        }
        self.buffer.extend_from_slice(&rest[aligned..]);
        Ok(buf.len())
    }
}

/// Buffered bytes are discarded if the underlying writer fails.
impl<W: Write> Write for FrameWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_frames(buf).inspect_err(|_| self.buffer.clear())
    }

    /// Write out buffered bytes, even if they do not fill a frame.
    fn flush(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            let written = self.inner.write_all(&self.buffer);
            self.buffer.clear();
            written?;
        }
        self.inner.flush()
    }
}

/// Writer syncing the underlying writer after every `interval` bytes.
///
/// An interval of zero syncs after every write. Flushing always syncs.
#[derive(Debug)]
pub struct SyncingWriter<W> {
    inner: W,
    interval: u64,
    unsynced: u64,
}

impl<W: SyncWrite> SyncingWriter<W> {
    pub fn new(inner: W, interval: u64) -> Self {
        Self {
            inner,
            interval,
            unsynced: 0,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: SyncWrite> Write for SyncingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.unsynced += written as u64;
        if self.unsynced >= self.interval {
            self.inner.sync()?;
            self.unsynced = 0;
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()?;
        self.inner.sync()?;
        self.unsynced = 0;
        Ok(())
    }
}

/// Complete writer stack used for devices.
pub type DeviceWriter<W> = LimitedWriter<FrameWriter<SyncingWriter<W>>>;

/// Build the writer stack on top of `inner`.
pub fn device_writer<W: SyncWrite>(
    inner: W,
    limit: u64,
    frame_size: usize,
    sync_interval: u64,
) -> DeviceWriter<W> {
    LimitedWriter::new(
        FrameWriter::new(SyncingWriter::new(inner, sync_interval), frame_size),
        limit,
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// In-memory device recording writes and syncs.
    #[derive(Debug, Default)]
    pub(crate) struct MemoryDevice {
        pub data: Vec<u8>,
        pub writes: Vec<usize>,
        pub syncs: usize,
        /// Length of data at the last sync.
        pub synced: usize,
    }

    impl Write for MemoryDevice {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.extend_from_slice(buf);
            self.writes.push(buf.len());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SyncWrite for MemoryDevice {
        fn sync(&mut self) -> io::Result<()> {
            self.syncs += 1;
            self.synced = self.data.len();
            Ok(())
        }
    }

    /// Writer failing the first write.
    #[derive(Debug, Default)]
    struct FailOnce {
        failed: bool,
        data: Vec<u8>,
    }

    impl Write for FailOnce {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if !self.failed {
                self.failed = true;
                return Err(io::Error::other("device gone"));
            }
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_frame_dropped_after_error() {
        let mut writer = FrameWriter::new(FailOnce::default(), 4);
        writer.write_all(b"abc").unwrap();
        assert!(writer.write_all(b"def").is_err());
        assert_eq!(writer.buffered(), 0);
        writer.write_all(b"ghij").unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.into_inner().data, b"ghij");
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|idx| (idx * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_frame_size() {
        assert_eq!(frame_size(512), 1024 * 1024);
        assert_eq!(frame_size(4096), 1024 * 1024);
        assert_eq!(frame_size(3000), 3000 * 512);
        assert_eq!(frame_size(4 * 1024 * 1024), 4 * 1024 * 1024);
    }

    #[test]
    fn test_limit_is_enforced() {
        for (limit, len) in [(0, 1), (10, 11), (100, 1000), (4096, 4097)] {
            let mut writer = LimitedWriter::new(Vec::new(), limit);
            let error = writer.write_all(&pattern(len)).unwrap_err();
            assert_eq!(error.raw_os_error(), Some(libc::ENOSPC));
            assert_eq!(writer.get_ref().len() as u64, limit);
            assert_eq!(writer.remaining(), 0);
        }
    }

    #[test]
    fn test_limit_allows_exact_size() {
        let mut writer = LimitedWriter::new(Vec::new(), 100);
        writer.write_all(&pattern(60)).unwrap();
        writer.write_all(&pattern(40)).unwrap();
        writer.write_all(&[]).unwrap();
        assert_eq!(writer.into_inner().len(), 100);
    }

    #[test]
    fn test_frames_preserve_bytes() {
        let data = pattern(10_000);
        for chunk in [1, 7, 64, 100, 999, 4096, 10_000] {
            let mut writer = FrameWriter::new(MemoryDevice::default(), 256);
            for part in data.chunks(chunk) {
                writer.write_all(part).unwrap();
                assert!(writer.buffered() < 256);
            }
            writer.flush().unwrap();
            let device = writer.into_inner();
            assert_eq!(device.data, data);
            let (last, full) = device.writes.split_last().unwrap();
            assert!(full.iter().all(|len| len % 256 == 0));
            assert_eq!(*last, 10_000 % 256);
        }
    }

    #[test]
    fn test_sync_interval() {
        let mut writer = SyncingWriter::new(MemoryDevice::default(), 512);
        writer.write_all(&pattern(256)).unwrap();
        assert_eq!(writer.get_ref().syncs, 0);
        writer.write_all(&pattern(256)).unwrap();
        assert_eq!(writer.get_ref().syncs, 1);
        writer.write_all(&pattern(100)).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.get_ref().syncs, 2);
        assert_eq!(writer.get_ref().synced, 612);
    }

    #[test]
    fn test_zero_interval_syncs_every_write() {
        let mut writer = SyncingWriter::new(MemoryDevice::default(), 0);
        for _ in 0..5 {
            writer.write_all(&pattern(3)).unwrap();
        }
        assert_eq!(writer.get_ref().syncs, 5);
    }

    #[test]
    fn test_stack_flush_syncs_remainder() {
        let data = pattern(5000);
        let mut writer = device_writer(MemoryDevice::default(), 5000, 1024, 512);
        for part in data.chunks(333) {
            writer.write_all(part).unwrap();
        }
        writer.flush().unwrap();
        let device = writer.into_inner().into_inner().into_inner();
        assert_eq!(device.data, data);
        assert_eq!(device.synced, 5000);
    }
}
