//! Sequential access to the files of a payload.

use std::collections::VecDeque;
use std::io::{Cursor, Read};

use crate::ArtifactError;

/// File of a payload being streamed.
pub struct PayloadStream<'s> {
    /// File name within the payload.
    pub name: String,
    /// Declared size in bytes.
    pub size: u64,
    pub reader: &'s mut dyn Read,
}

/// Source of the files of a payload, in the order they appear in the artifact.
///
/// Advancing to the next file discards whatever has not been read of the
/// previous one.
pub trait PayloadStreams {
    fn next_stream(&mut self) -> Result<Option<PayloadStream<'_>>, ArtifactError>;
}

/// Payload files held in memory.
#[derive(Debug, Default)]
pub struct MemoryStreams {
    files: VecDeque<(String, Vec<u8>)>,
    current: Option<Cursor<Vec<u8>>>,
}

impl MemoryStreams {
    pub fn new<N: Into<String>>(files: impl IntoIterator<Item = (N, Vec<u8>)>) -> Self {
        Self {
            files: files
                .into_iter()
                .map(|(name, data)| (name.into(), data))
                .collect(),
            current: None,
        }
    }
}

impl PayloadStreams for MemoryStreams {
    fn next_stream(&mut self) -> Result<Option<PayloadStream<'_>>, ArtifactError> {
        let Some((name, data)) = self.files.pop_front() else {
            self.current = None;
            return Ok(None);
        };
        let size = data.len() as u64;
        let reader = self.current.insert(Cursor::new(data));
        Ok(Some(PayloadStream { name, size, reader }))
    }
}
