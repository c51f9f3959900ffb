//! Storage of the state scripts carried by an artifact.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::debug;

/// Name of the file recording the artifact format version of the scripts.
pub const VERSION_FILE: &str = "version";

/// Directory holding the state scripts of the artifact being installed.
#[derive(Debug, Clone)]
pub struct ScriptsStore {
    path: PathBuf,
}

impl ScriptsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the scripts of a previous artifact.
    pub fn clear(&self) -> io::Result<()> {
        fs::create_dir_all(&self.path)?;
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Store an executable script.
    pub fn store(&self, name: &str, reader: &mut dyn Read) -> io::Result<()> {
        let path = self.path.join(name);
        debug!(script = %path.display(), "storing state script");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o755)
            .open(&path)?;
        // The mode of `open` is subject to the umask.
        file.set_permissions(fs::Permissions::from_mode(0o755))?;
        io::copy(reader, &mut file)?;
        file.sync_all()
    }

    /// Record the artifact format version once all scripts are stored.
    pub fn finish(&self, version: u32) -> io::Result<()> {
        let mut file = fs::File::create(self.path.join(VERSION_FILE))?;
        writeln!(file, "{version}")?;
        file.sync_all()
    }

    /// Format version of the stored scripts, if any.
    pub fn version(&self) -> io::Result<Option<u32>> {
        match fs::read_to_string(self.path.join(VERSION_FILE)) {
            Ok(version) => version
                .trim()
                .parse()
                .map(Some)
                .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Names of the stored scripts in execution order.
    pub fn scripts(&self) -> io::Result<Vec<String>> {
        let mut scripts = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name != VERSION_FILE {
                scripts.push(name);
            }
        }
        scripts.sort();
        Ok(scripts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScriptsStore::new(dir.path().join("scripts"));
        store.clear().unwrap();
        assert_eq!(store.version().unwrap(), None);
        store
            .store("ArtifactInstall_Leave_10", &mut &b"#!/bin/sh\n"[..])
            .unwrap();
        store
            .store("ArtifactInstall_Enter_00", &mut &b"#!/bin/sh\n"[..])
            .unwrap();
        store.finish(3).unwrap();
        assert_eq!(store.version().unwrap(), Some(3));
        assert_eq!(
            store.scripts().unwrap(),
            ["ArtifactInstall_Enter_00", "ArtifactInstall_Leave_10"]
        );
        let mode = fs::metadata(store.path().join("ArtifactInstall_Enter_00"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_clear_removes_previous_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScriptsStore::new(dir.path());
        store
            .store("ArtifactCommit_Enter_00", &mut &b"exit 0\n"[..])
            .unwrap();
        store.finish(3).unwrap();
        store.clear().unwrap();
        assert!(store.scripts().unwrap().is_empty());
        assert_eq!(store.version().unwrap(), None);
    }
}
