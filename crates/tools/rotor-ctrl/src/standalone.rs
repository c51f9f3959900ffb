//! State of an installation driven from the command line.
//!
//! The state is recorded after the payloads have been installed, so that a
//! later invocation can commit or roll back the update, possibly after a reboot.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Name of the state file within the data directory.
pub const STATE_FILE: &str = "standalone.json";

/// Version of the state format.
const STATE_VERSION: u32 = 1;

/// Installation waiting to be committed or rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StandaloneState {
    pub version: u32,
    pub artifact_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_group: Option<String>,
    /// Payload types in the order of the artifact.
    pub payload_types: Vec<String>,
}

impl StandaloneState {
    pub fn new(
        artifact_name: impl Into<String>,
        artifact_group: Option<String>,
        payload_types: Vec<String>,
    ) -> Self {
        Self {
            version: STATE_VERSION,
            artifact_name: artifact_name.into(),
            artifact_group,
            payload_types,
        }
    }
}

/// Persistent storage of the [`StandaloneState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(data_path: &Path) -> Self {
        Self {
            path: data_path.join(STATE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> io::Result<Option<StandaloneState>> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error),
        };
        let state: StandaloneState = serde_json::from_slice(&contents)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
        if state.version != STATE_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported state version {}", state.version),
            ));
        }
        Ok(Some(state))
    }

    pub fn store(&self, state: &StandaloneState) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp_path)?;
        serde_json::to_writer_pretty(&mut file, state)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)
    }

    pub fn remove(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => Err(error),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert_eq!(store.load().unwrap(), None);
        let state = StandaloneState::new(
            "release-2",
            Some("stable".to_owned()),
            vec!["rootfs-image".to_owned()],
        );
        store.store(&state).unwrap();
        assert_eq!(store.load().unwrap(), Some(state));
        store.remove().unwrap();
        assert_eq!(store.load().unwrap(), None);
        store.remove().unwrap();
    }

    #[test]
    fn test_invalid_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        fs::write(store.path(), "{\"version\": 7}").unwrap();
        assert_eq!(
            store.load().unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
    }
}
