//! Forward-only reader of the outer artifact archive.
//!
//! Unlike [`tar::Archive`], the reader does not borrow itself while iterating, so
//! reading of the archive can be suspended between entries.

use std::io::{self, Read};

use tar::{EntryType, Header};

const BLOCK_SIZE: u64 = 512;

/// Limit for names stored in extension entries.
const MAX_NAME_LENGTH: u64 = 4096;

/// Streaming reader of a tar archive.
pub(crate) struct TarStream<R> {
    reader: R,
    /// Unread bytes of the current entry.
    remaining: u64,
    /// Padding following the current entry.
    padding: u64,
    finished: bool,
}

impl<R: Read> TarStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            remaining: 0,
            padding: 0,
            finished: false,
        }
    }

    /// Advance to the next regular entry, skipping the rest of the current one.
    pub fn next_entry(&mut self) -> io::Result<Option<TarEntry<'_, R>>> {
        if self.finished {
            return Ok(None);
        }
        self.skip(self.remaining + self.padding)?;
        self.remaining = 0;
        self.padding = 0;
        let mut long_name = None;
        loop {
            let mut block = [0; BLOCK_SIZE as usize];
            self.reader.read_exact(&mut block)?;
            if block.iter().all(|byte| *byte == 0) {
                self.finished = true;
                return Ok(None);
            }
            let header = Header::from_byte_slice(&block);
            verify_checksum(&block, header)?;
            let size = header.entry_size()?;
            let padding = (BLOCK_SIZE - size % BLOCK_SIZE) % BLOCK_SIZE;
            match header.entry_type() {
                EntryType::Regular | EntryType::Continuous => {
                    let name = match long_name.take() {
                        Some(name) => name,
                        None => header.path()?.to_string_lossy().into_owned(),
                    };
                    self.remaining = size;
                    self.padding = padding;
                    return Ok(Some(TarEntry {
                        name,
                        size,
                        stream: self,
                    }));
                }
                EntryType::GNULongName => {
                    let data = self.read_extension(size, padding)?;
                    let name = String::from_utf8_lossy(&data);
                    long_name = Some(name.trim_end_matches('\0').to_owned());
                }
                EntryType::XHeader => {
                    let data = self.read_extension(size, padding)?;
                    if let Some(path) = pax_path(&data) {
                        long_name = Some(path);
                    }
                }
                _ => {
                    self.skip(size + padding)?;
                }
            }
        }
    }

    fn read_extension(&mut self, size: u64, padding: u64) -> io::Result<Vec<u8>> {
        if size > MAX_NAME_LENGTH {
            return Err(invalid_data("tar extension entry too large"));
        }
        let mut data = Vec::with_capacity(size as usize);
        (&mut self.reader).take(size).read_to_end(&mut data)?;
        if data.len() as u64 != size {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        self.skip(padding)?;
        Ok(data)
    }

    fn skip(&mut self, bytes: u64) -> io::Result<()> {
        let skipped = io::copy(&mut (&mut self.reader).take(bytes), &mut io::sink())?;
        if skipped != bytes {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(())
    }
}

/// Regular entry of a [`TarStream`].
pub(crate) struct TarEntry<'s, R> {
    name: String,
    size: u64,
    stream: &'s mut TarStream<R>,
}

impl<R> TarEntry<'_, R> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl<R: Read> Read for TarEntry<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.stream.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let limit = usize::try_from(self.stream.remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let read = self.stream.reader.read(&mut buf[..limit])?;
        if read == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        self.stream.remaining -= read as u64;
        Ok(read)
    }
}

fn verify_checksum(block: &[u8; BLOCK_SIZE as usize], header: &Header) -> io::Result<()> {
    let stored = header.cksum()?;
    let computed = block[..148]
        .iter()
        .chain(&[b' '; 8])
        .chain(&block[156..])
        .map(|byte| u32::from(*byte))
        .sum::<u32>();
    if stored != computed {
        return Err(invalid_data("invalid tar header checksum"));
    }
    Ok(())
}

/// Extract the `path` record of a PAX extended header.
fn pax_path(data: &[u8]) -> Option<String> {
    let mut rest = data;
    while !rest.is_empty() {
        let space = rest.iter().position(|byte| *byte == b' ')?;
        let length: usize = std::str::from_utf8(&rest[..space]).ok()?.parse().ok()?;
        if length <= space || length > rest.len() {
            return None;
        }
        let record = &rest[space + 1..length];
        let record = record.strip_suffix(b"\n").unwrap_or(record);
        if let Some(value) = record.strip_prefix(b"path=") {
            return Some(String::from_utf8_lossy(value).into_owned());
        }
        rest = &rest[length..];
    }
    None
}

fn invalid_data(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_partially_read_entries() {
        let long_name = format!("data/{}", "x".repeat(150));
        let data = archive(&[
            ("version", b"{}"),
            (&long_name, &[7; 1000]),
            ("manifest", b"abc"),
        ]);
        let mut stream = TarStream::new(&data[..]);
        let mut entry = stream.next_entry().unwrap().unwrap();
        assert_eq!(entry.name(), "version");
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "{}");

        let mut entry = stream.next_entry().unwrap().unwrap();
        assert_eq!(entry.name(), long_name);
        assert_eq!(entry.size(), 1000);
        let mut partial = [0; 10];
        entry.read_exact(&mut partial).unwrap();

        let mut entry = stream.next_entry().unwrap().unwrap();
        assert_eq!(entry.name(), "manifest");
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"abc");
        assert!(stream.next_entry().unwrap().is_none());
        assert!(stream.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_pax_path() {
        assert_eq!(
            pax_path(b"20 path=data/0000.tar\n").as_deref(),
            Some("data/0000.tar")
        );
        assert_eq!(pax_path(b"12 uid=1000\n"), None);
    }

    #[test]
    fn test_truncated_archive() {
        let data = archive(&[("version", &[1; 600])]);
        let mut stream = TarStream::new(&data[..700]);
        let mut entry = stream.next_entry().unwrap().unwrap();
        assert!(io::copy(&mut entry, &mut io::sink()).is_err());
    }
}
