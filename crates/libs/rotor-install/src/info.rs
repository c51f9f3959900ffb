//! Information about the installed artifact and the device.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Information about the currently installed artifact.
pub trait ArtifactInfo: Send + Sync + fmt::Debug {
    fn artifact_name(&self) -> io::Result<String>;

    /// Group of the artifact, empty if the artifact has no group.
    fn artifact_group(&self) -> io::Result<String>;
}

/// Information about the device.
pub trait DeviceInfo: Send + Sync + fmt::Debug {
    fn device_type(&self) -> io::Result<String>;
}

/// Artifact information stored as `key=value` lines.
#[derive(Debug, Clone)]
pub struct ArtifactInfoFile {
    path: PathBuf,
}

impl ArtifactInfoFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the stored information.
    pub fn write(&self, name: &str, group: Option<&str>) -> io::Result<()> {
        let mut contents = format!("artifact_name={name}\n");
        if let Some(group) = group.filter(|group| !group.is_empty()) {
            contents.push_str(&format!("artifact_group={group}\n"));
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)
    }
}

impl ArtifactInfoFile {
    fn value(&self, key: &str) -> io::Result<String> {
        match read_value(&self.path, key) {
            Ok(value) => Ok(value.unwrap_or_default()),
            // Nothing has been installed yet.
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(error) => Err(error),
        }
    }
}

impl ArtifactInfo for ArtifactInfoFile {
    fn artifact_name(&self) -> io::Result<String> {
        self.value("artifact_name")
    }

    fn artifact_group(&self) -> io::Result<String> {
        self.value("artifact_group")
    }
}

/// Device type stored as `device_type=<name>` line.
#[derive(Debug, Clone)]
pub struct DeviceTypeFile {
    path: PathBuf,
}

impl DeviceTypeFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DeviceInfo for DeviceTypeFile {
    fn device_type(&self) -> io::Result<String> {
        read_value(&self.path, "device_type")?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("no `device_type` in {}", self.path.display()),
            )
        })
    }
}

/// Fixed information, e.g., for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticInfo {
    pub artifact_name: String,
    pub artifact_group: String,
    pub device_type: String,
}

impl ArtifactInfo for StaticInfo {
    fn artifact_name(&self) -> io::Result<String> {
        Ok(self.artifact_name.clone())
    }

    fn artifact_group(&self) -> io::Result<String> {
        Ok(self.artifact_group.clone())
    }
}

impl DeviceInfo for StaticInfo {
    fn device_type(&self) -> io::Result<String> {
        Ok(self.device_type.clone())
    }
}

/// Read the value of `key` from a file with `key=value` lines.
///
/// Later lines take precedence.
pub fn read_value(path: &Path, key: &str) -> io::Result<Option<String>> {
    let contents = fs::read_to_string(path)?;
    Ok(parse_value(&contents, key))
}

fn parse_value(contents: &str, key: &str) -> Option<String> {
    contents
        .lines()
        .filter_map(|line| line.split_once('='))
        .filter(|(name, _)| name.trim() == key)
        .map(|(_, value)| value.trim().to_owned())
        .last()
}
