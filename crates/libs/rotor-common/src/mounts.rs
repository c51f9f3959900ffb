//! Parsing of the kernel mount table.

use std::fs;
use std::io;
use std::path::Path;

/// Mount table of the current process.
pub const PROC_MOUNTS: &str = "/proc/self/mounts";

/// Entry of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mounted device or pseudo filesystem name.
    pub source: String,
    /// Mount point.
    pub target: String,
    /// Filesystem type.
    pub fs_type: String,
}

/// Mount table.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    /// Read the mount table of the current process.
    pub fn read() -> io::Result<Self> {
        Ok(Self::parse(&fs::read_to_string(PROC_MOUNTS)?))
    }

    /// Parse a mount table in the format of `/proc/self/mounts`.
    ///
    /// Lines with less than three fields are ignored.
    pub fn parse(table: &str) -> Self {
        let entries = table
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                Some(MountEntry {
                    source: unescape(fields.next()?),
                    target: unescape(fields.next()?),
                    fs_type: fields.next()?.to_owned(),
                })
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// Find the entry mounted at the given path.
    ///
    /// If several filesystems are stacked on the path, the topmost one is returned.
    pub fn find_by_target(&self, target: impl AsRef<Path>) -> Option<&MountEntry> {
        let target = target.as_ref();
        self.entries
            .iter()
            .rev()
            .find(|entry| Path::new(&entry.target) == target)
    }

    /// Find an entry for the given source device.
    pub fn find_by_source(&self, source: impl AsRef<Path>) -> Option<&MountEntry> {
        let source = source.as_ref();
        self.entries
            .iter()
            .find(|entry| Path::new(&entry.source) == source)
    }
}

/// Undo the octal escaping of whitespace and backslashes in mount table fields.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'\\' && idx + 3 < bytes.len() && is_octal(&bytes[idx + 1..idx + 4]) {
            let value =
                (bytes[idx + 1] - b'0') * 64 + (bytes[idx + 2] - b'0') * 8 + (bytes[idx + 3] - b'0');
            output.push(value);
            idx += 4;
        } else {
            output.push(bytes[idx]);
            idx += 1;
        }
    }
    String::from_utf8_lossy(&output).into_owned()
}

fn is_octal(digits: &[u8]) -> bool {
    digits.len() == 3 && digits[0] <= b'3' && digits.iter().all(|d| (b'0'..=b'7').contains(d))
}
