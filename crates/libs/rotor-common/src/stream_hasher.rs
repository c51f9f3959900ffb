//! Hashing of data while it is being read.

use std::io::{self, Read};

use digest::{Digest, Output};

/// Reader computing a digest of all bytes passing through it.
#[derive(Debug)]
pub struct StreamHasher<R, H> {
    reader: R,
    hasher: H,
    consumed: u64,
}

impl<R, H: Digest> StreamHasher<R, H> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            hasher: H::new(),
            consumed: 0,
        }
    }

    /// Number of bytes hashed so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Digest of the bytes read so far.
    pub fn finalize(self) -> Output<H> {
        self.hasher.finalize()
    }

    /// Digest of the bytes read so far, restarting the hasher.
    pub fn take_digest(&mut self) -> Output<H>
    where
        H: Default,
    {
        self.consumed = 0;
        std::mem::take(&mut self.hasher).finalize()
    }
}

impl<R: Read, H: Digest> Read for StreamHasher<R, H> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.reader.read(buf)?;
        self.hasher.update(&buf[..read]);
        self.consumed += read as u64;
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use sha2::Sha256;

    use super::*;

    #[test]
    fn test_hashes_consumed_bytes() {
        let mut hasher = StreamHasher::<_, Sha256>::new(&b"hello world"[..]);
        let mut output = Vec::new();
        hasher.read_to_end(&mut output).unwrap();
        assert_eq!(hasher.consumed(), 11);
        assert_eq!(
            hex_string(&hasher.finalize()),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    fn hex_string(bytes: &[u8]) -> String {
        bytes.iter().map(|byte| format!("{byte:02x}")).collect()
    }
}
