//! Resolution of the active and inactive root partitions.

use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tracing::{debug, error, warn};

use rotor_common::bootenv::{BootEnv, BootEnvError, BOOT_PART, UPGRADE_AVAILABLE};
use rotor_common::mounts::MountTable;

/// Directory scanned for the device of the root filesystem.
const DEV_DIR: &str = "/dev";

/// Error resolving the root partitions.
#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("rootfs-part-a and rootfs-part-b settings are not both set")]
    NotConfigured,
    #[error("rootfs-part-a and rootfs-part-b cannot be set to the same value")]
    IdenticalPartitions,
    #[error("no match between boot and root partitions (mender_boot_part = {boot_part:?})")]
    NoMatch { boot_part: String },
    #[error("active root partition {} matches neither rootfs-part-a nor rootfs-part-b", .0.display())]
    UnknownActive(PathBuf),
    #[error("unable to determine partition number of {}", .0.display())]
    InvalidPartition(PathBuf),
    #[error("unable to read active partition from boot environment")]
    BootEnv(#[source] BootEnvError),
    #[error("unable to inspect {what}")]
    Probe {
        what: String,
        #[source]
        source: io::Error,
    },
}

/// Status of a file relevant for identifying the root device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStat {
    /// Device containing the file.
    pub dev: u64,
    /// Device the file represents, if it is a device file.
    pub rdev: u64,
    /// Whether the file is a block or character device.
    pub is_device: bool,
}

/// Access to the system state needed to find the root device.
pub trait DeviceProbe: Send + Sync + fmt::Debug {
    fn mount_table(&self) -> io::Result<MountTable>;

    /// Status of the given path, following symbolic links.
    fn stat(&self, path: &Path) -> io::Result<DeviceStat>;

    /// Entries of the given device directory.
    fn list_devices(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    /// Fully resolve symbolic links.
    fn resolve_link(&self, path: &Path) -> io::Result<PathBuf>;
}

/// Probe of the running system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl DeviceProbe for SystemProbe {
    fn mount_table(&self) -> io::Result<MountTable> {
        MountTable::read()
    }

    fn stat(&self, path: &Path) -> io::Result<DeviceStat> {
        let metadata = fs::metadata(path)?;
        let file_type = metadata.file_type();
        Ok(DeviceStat {
            dev: metadata.dev(),
            rdev: metadata.rdev(),
            is_device: file_type.is_block_device() || file_type.is_char_device(),
        })
    }

    fn list_devices(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        fs::read_dir(dir)?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect()
    }

    fn resolve_link(&self, path: &Path) -> io::Result<PathBuf> {
        fs::canonicalize(path)
    }
}

/// Resolver for the two configured root partitions.
///
/// Results are cached for the lifetime of the resolver.
#[derive(Debug)]
pub struct Partitions {
    part_a: PathBuf,
    part_b: PathBuf,
    env: Arc<dyn BootEnv>,
    probe: Arc<dyn DeviceProbe>,
    active: OnceLock<PathBuf>,
    inactive: OnceLock<PathBuf>,
}

impl Partitions {
    pub fn new(
        part_a: impl Into<PathBuf>,
        part_b: impl Into<PathBuf>,
        env: Arc<dyn BootEnv>,
        probe: Arc<dyn DeviceProbe>,
    ) -> Result<Self, PartitionError> {
        let part_a = part_a.into();
        let part_b = part_b.into();
        if part_a.as_os_str().is_empty() || part_b.as_os_str().is_empty() {
            return Err(PartitionError::NotConfigured);
        }
        if part_a == part_b {
            return Err(PartitionError::IdenticalPartitions);
        }
        Ok(Self {
            part_a,
            part_b,
            env,
            probe,
            active: OnceLock::new(),
            inactive: OnceLock::new(),
        })
    }

    pub fn part_a(&self) -> &Path {
        &self.part_a
    }

    pub fn part_b(&self) -> &Path {
        &self.part_b
    }

    /// Partition the system is running from.
    pub fn active(&self) -> Result<PathBuf, PartitionError> {
        if let Some(active) = self.active.get() {
            debug!(partition = %active.display(), "active partition");
            return Ok(active.clone());
        }
        let active = self.resolve_active()?;
        Ok(self.active.get_or_init(|| active).clone())
    }

    /// Partition updates are written to.
    pub fn inactive(&self) -> Result<PathBuf, PartitionError> {
        if let Some(inactive) = self.inactive.get() {
            debug!(partition = %inactive.display(), "inactive partition");
            return Ok(inactive.clone());
        }
        let active = self.active()?;
        let resolved = self.maybe_resolve_link(&active);
        let inactive = if resolved == self.part_a {
            self.part_b.clone()
        } else if resolved == self.part_b {
            self.part_a.clone()
        } else {
            return Err(PartitionError::UnknownActive(active));
        };
        debug!(
            inactive = %inactive.display(),
            active = %active.display(),
            "detected inactive partition"
        );
        Ok(self.inactive.get_or_init(|| inactive).clone())
    }

    fn resolve_active(&self) -> Result<PathBuf, PartitionError> {
        let mounts = self.probe.mount_table().map_err(|source| PartitionError::Probe {
            what: "mount table".to_owned(),
            source,
        })?;
        let root = self
            .probe
            .stat(Path::new("/"))
            .map_err(|source| PartitionError::Probe {
                what: "root filesystem".to_owned(),
                source,
            })?;
        let mut vars = self
            .env
            .read_env(&[BOOT_PART, UPGRADE_AVAILABLE])
            .map_err(PartitionError::BootEnv)?;
        let boot_part = vars.remove(BOOT_PART).unwrap_or_default();
        // Before the reboot into an installed update, the boot candidate is the
        // inactive partition.
        let pending = vars.get(UPGRADE_AVAILABLE).map(|value| value.trim()) == Some("1");
        let no_match = || PartitionError::NoMatch {
            boot_part: boot_part.clone(),
        };

        if let Some(entry) = mounts.find_by_target("/") {
            let candidate = self.maybe_resolve_link(Path::new(&entry.source));
            let is_root = self.is_mounted_root(&candidate, &root);
            if matches_boot_part(&candidate, &boot_part) || (is_root && pending) {
                debug!(
                    partition = %candidate.display(),
                    is_root,
                    pending,
                    "setting active partition from mount candidate"
                );
                return Ok(candidate);
            }
            if is_root {
                error!(
                    "mounted root {} does not match boot environment mender_boot_part {boot_part:?}",
                    candidate.display()
                );
                return Err(no_match());
            }
        }

        let devices =
            self.probe
                .list_devices(Path::new(DEV_DIR))
                .map_err(|source| PartitionError::Probe {
                    what: DEV_DIR.to_owned(),
                    source,
                })?;
        match devices
            .into_iter()
            .find(|device| self.is_mounted_root(device, &root))
        {
            Some(device) if matches_boot_part(&device, &boot_part) || pending => {
                debug!(partition = %device.display(), "setting active partition");
                Ok(device)
            }
            Some(device) => {
                error!(
                    "mounted root {} does not match boot environment mender_boot_part {boot_part:?}",
                    device.display()
                );
                Err(no_match())
            }
            None => {
                for part in [&self.part_a, &self.part_b] {
                    if matches_boot_part(part, &boot_part) {
                        debug!(
                            partition = %part.display(),
                            "setting active partition from configuration and environment"
                        );
                        return Ok(part.clone());
                    }
                }
                Err(no_match())
            }
        }
    }

    fn is_mounted_root(&self, device: &Path, root: &DeviceStat) -> bool {
        self.probe
            .stat(device)
            .is_ok_and(|stat| stat.is_device && stat.rdev == root.dev)
    }

    /// Resolve `/dev/root` and `/dev/disk/by-partuuid/*` links.
    fn maybe_resolve_link(&self, path: &Path) -> PathBuf {
        let resolvable = path == Path::new("/dev/root")
            || path.parent() == Some(Path::new("/dev/disk/by-partuuid"));
        if !resolvable {
            return path.to_path_buf();
        }
        match self.probe.resolve_link(path) {
            Ok(resolved) => resolved,
            Err(error) => {
                warn!(
                    "unable to resolve link {}, attempting to continue: {error}",
                    path.display()
                );
                path.to_path_buf()
            }
        }
    }
}

/// Number of a partition given by the trailing digits of its path.
pub fn partition_number(path: &Path) -> Option<u32> {
    let path = path.to_str()?;
    let digits = path.len() - path.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    path[path.len() - digits..].parse().ok()
}

fn matches_boot_part(path: &Path, boot_part: &str) -> bool {
    match (partition_number(path), boot_part.trim().parse::<u32>()) {
        (Some(number), Ok(boot_part)) => number == boot_part,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rotor_common::bootenv::MemoryBootEnv;

    use super::*;

    const ROOT_DEV: u64 = 0xb302;

    #[derive(Debug, Default)]
    struct FakeProbe {
        mounts: String,
        stats: HashMap<PathBuf, DeviceStat>,
        links: HashMap<PathBuf, PathBuf>,
        mount_reads: AtomicUsize,
    }

    impl FakeProbe {
        fn new(mounts: &str) -> Self {
            let mut probe = Self {
                mounts: mounts.to_owned(),
                ..Self::default()
            };
            probe.stats.insert(
                PathBuf::from("/"),
                DeviceStat {
                    dev: ROOT_DEV,
                    rdev: 0,
                    is_device: false,
                },
            );
            probe
        }

        fn device(mut self, path: &str, rdev: u64) -> Self {
            self.stats.insert(
                PathBuf::from(path),
                DeviceStat {
                    dev: 5,
                    rdev,
                    is_device: true,
                },
            );
            self
        }

        fn link(mut self, path: &str, target: &str) -> Self {
            self.links.insert(PathBuf::from(path), PathBuf::from(target));
            self
        }
    }

    impl DeviceProbe for FakeProbe {
        fn mount_table(&self) -> io::Result<MountTable> {
            self.mount_reads.fetch_add(1, Ordering::SeqCst);
            Ok(MountTable::parse(&self.mounts))
        }

        fn stat(&self, path: &Path) -> io::Result<DeviceStat> {
            self.stats
                .get(path)
                .copied()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }

        fn list_devices(&self, _: &Path) -> io::Result<Vec<PathBuf>> {
            let mut devices = self
                .stats
                .keys()
                .filter(|path| path.starts_with(DEV_DIR))
                .cloned()
                .collect::<Vec<_>>();
            devices.sort();
            Ok(devices)
        }

        fn resolve_link(&self, path: &Path) -> io::Result<PathBuf> {
            self.links
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }
    }

    fn partitions(probe: &Arc<FakeProbe>, boot_part: &str) -> Partitions {
        Partitions::new(
            "/dev/mmcblk0p2",
            "/dev/mmcblk0p3",
            Arc::new(MemoryBootEnv::new([(BOOT_PART, boot_part)])),
            probe.clone(),
        )
        .unwrap()
    }

    #[test]
    fn test_partition_number() {
        assert_eq!(partition_number(Path::new("/dev/mmcblk0p2")), Some(2));
        assert_eq!(partition_number(Path::new("/dev/sda12")), Some(12));
        assert_eq!(partition_number(Path::new("ubi0_1")), Some(1));
        assert_eq!(partition_number(Path::new("/dev/root")), None);
        assert!(matches_boot_part(Path::new("/dev/sda12"), "12"));
        assert!(!matches_boot_part(Path::new("/dev/sda12"), "2"));
        assert!(!matches_boot_part(Path::new("/dev/sda12"), ""));
    }

    #[test]
    fn test_configuration_errors() {
        let env: Arc<dyn BootEnv> = Arc::new(MemoryBootEnv::new([(BOOT_PART, "2")]));
        let probe: Arc<dyn DeviceProbe> = Arc::new(FakeProbe::default());
        assert!(matches!(
            Partitions::new("/dev/sda2", "", env.clone(), probe.clone()),
            Err(PartitionError::NotConfigured)
        ));
        assert!(matches!(
            Partitions::new("/dev/sda2", "/dev/sda2", env, probe),
            Err(PartitionError::IdenticalPartitions)
        ));
    }

    #[test]
    fn test_active_from_mount_table() {
        let probe = Arc::new(
            FakeProbe::new("/dev/mmcblk0p2 / ext4 ro 0 0\n").device("/dev/mmcblk0p2", ROOT_DEV),
        );
        let partitions = partitions(&probe, "2");
        assert_eq!(partitions.active().unwrap(), Path::new("/dev/mmcblk0p2"));
        assert_eq!(partitions.inactive().unwrap(), Path::new("/dev/mmcblk0p3"));
        assert_eq!(partitions.active().unwrap(), Path::new("/dev/mmcblk0p2"));
        assert_eq!(partitions.inactive().unwrap(), Path::new("/dev/mmcblk0p3"));
        assert_eq!(probe.mount_reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mount_table_contradicting_environment() {
        let probe = Arc::new(
            FakeProbe::new("/dev/mmcblk0p2 / ext4 ro 0 0\n").device("/dev/mmcblk0p2", ROOT_DEV),
        );
        assert!(matches!(
            partitions(&probe, "3").active(),
            Err(PartitionError::NoMatch { boot_part }) if boot_part == "3"
        ));
    }

    #[test]
    fn test_pending_update_keeps_mounted_root() {
        let probe = Arc::new(
            FakeProbe::new("/dev/mmcblk0p2 / ext4 ro 0 0\n").device("/dev/mmcblk0p2", ROOT_DEV),
        );
        let partitions = Partitions::new(
            "/dev/mmcblk0p2",
            "/dev/mmcblk0p3",
            Arc::new(MemoryBootEnv::new([(BOOT_PART, "3"), (UPGRADE_AVAILABLE, "1")])),
            probe,
        )
        .unwrap();
        assert_eq!(partitions.active().unwrap(), Path::new("/dev/mmcblk0p2"));
        assert_eq!(partitions.inactive().unwrap(), Path::new("/dev/mmcblk0p3"));
    }

    #[test]
    fn test_resolves_dev_root() {
        let probe = Arc::new(
            FakeProbe::new("/dev/root / ext4 ro 0 0\n")
                .device("/dev/mmcblk0p3", ROOT_DEV)
                .link("/dev/root", "/dev/mmcblk0p3"),
        );
        let partitions = partitions(&probe, "3");
        assert_eq!(partitions.active().unwrap(), Path::new("/dev/mmcblk0p3"));
        assert_eq!(partitions.inactive().unwrap(), Path::new("/dev/mmcblk0p2"));
    }

    #[test]
    fn test_active_from_device_scan() {
        let probe = Arc::new(
            FakeProbe::new("overlay / overlay rw 0 0\n")
                .device("/dev/mmcblk0p1", 0xb301)
                .device("/dev/mmcblk0p3", ROOT_DEV),
        );
        assert_eq!(
            partitions(&probe, "3").active().unwrap(),
            Path::new("/dev/mmcblk0p3")
        );
    }

    #[test]
    fn test_active_from_environment() {
        let probe = Arc::new(FakeProbe::new("overlay / overlay rw 0 0\n"));
        let partitions = partitions(&probe, "3");
        assert_eq!(partitions.active().unwrap(), Path::new("/dev/mmcblk0p3"));
        assert_eq!(partitions.inactive().unwrap(), Path::new("/dev/mmcblk0p2"));
    }

    #[test]
    fn test_no_match() {
        let probe = Arc::new(FakeProbe::new("overlay / overlay rw 0 0\n"));
        assert!(matches!(
            partitions(&probe, "").active(),
            Err(PartitionError::NoMatch { .. })
        ));
        let probe = Arc::new(FakeProbe::new("").device("/dev/sda1", ROOT_DEV));
        assert!(matches!(
            partitions(&probe, "1").inactive(),
            Err(PartitionError::UnknownActive(path)) if path == Path::new("/dev/sda1")
        ));
    }
}
