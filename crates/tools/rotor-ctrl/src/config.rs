//! Configuration of the update agent.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use rotor_common::bootenv::EnvTools;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/rotor/rotor.toml";

/// Error loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read configuration file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unable to parse configuration file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Configuration file contents.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Config {
    /// Device of the first root partition.
    pub rootfs_part_a: Option<PathBuf>,
    /// Device of the second root partition.
    pub rootfs_part_b: Option<PathBuf>,
    /// File with a `device_type=<name>` line.
    pub device_type_file: PathBuf,
    /// PEM encoded public key artifacts must be signed with.
    pub artifact_verify_key: Option<PathBuf>,
    pub modules_path: PathBuf,
    pub modules_work_path: PathBuf,
    /// Timeout of update module invocations, zero or negative for the default.
    pub module_timeout_seconds: i64,
    pub scripts_path: PathBuf,
    /// Directory for the state of the agent.
    pub data_path: PathBuf,
    /// Bytes written between syncs of the root partition.
    pub flush_interval: Option<u64>,
    /// Pairs of tools printing and setting the boot environment.
    pub boot_env_tools: Option<Vec<[String; 2]>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rootfs_part_a: None,
            rootfs_part_b: None,
            device_type_file: PathBuf::from("/var/lib/rotor/device_type"),
            artifact_verify_key: None,
            modules_path: PathBuf::from("/usr/share/rotor/modules/v3"),
            modules_work_path: PathBuf::from("/var/lib/rotor/modules/v3"),
            module_timeout_seconds: 14400,
            scripts_path: PathBuf::from("/var/lib/rotor/scripts"),
            data_path: PathBuf::from("/var/lib/rotor"),
            flush_interval: None,
            boot_env_tools: None,
        }
    }
}

impl Config {
    /// Tools to access the boot environment with, in order of preference.
    pub fn env_tools(&self) -> Vec<EnvTools> {
        match &self.boot_env_tools {
            Some(tools) => tools
                .iter()
                .map(|[print, set]| EnvTools::new(print, set))
                .collect(),
            None => EnvTools::defaults(),
        }
    }
}

/// Load the configuration, falling back to the defaults if the file is missing.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_from_toml() {
        let config = toml::from_str::<Config>(indoc! {r#"
            rootfs-part-a = "/dev/mmcblk0p2"
            rootfs-part-b = "/dev/mmcblk0p3"
            module-timeout-seconds = 600
            flush-interval = 0
            boot-env-tools = [["fw_printenv", "fw_setenv"]]
        "#})
        .unwrap();
        assert_eq!(config.rootfs_part_a, Some(PathBuf::from("/dev/mmcblk0p2")));
        assert_eq!(config.rootfs_part_b, Some(PathBuf::from("/dev/mmcblk0p3")));
        assert_eq!(config.module_timeout_seconds, 600);
        assert_eq!(config.flush_interval, Some(0));
        assert_eq!(
            config.env_tools(),
            [EnvTools::new("fw_printenv", "fw_setenv")]
        );
        assert_eq!(config.data_path, Config::default().data_path);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("rootfs-part-c = \"/dev/sda4\"").is_err());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("rotor.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.env_tools(), EnvTools::defaults());
    }
}
