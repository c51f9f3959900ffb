//! Installation of root filesystem images onto A/B partitions.
//!
//! The image is written to the inactive partition which is then marked as the
//! boot candidate in the bootloader environment. The bootloader boots the
//! candidate once with `upgrade_available=1` and falls back to the previous
//! partition unless the update is committed.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info};

use rotor_artifact::streams::PayloadStream;
use rotor_common::bootenv::{
    BootEnv, BootVars, BOOT_COUNT, BOOT_PART, BOOT_PART_HEX, UPGRADE_AVAILABLE,
};
use rotor_common::command::CommandRunner;
use rotor_common::disk::device::{BlockDevice, BlockDeviceError, BlockDeviceOptions};

use crate::partitions::{partition_number, PartitionError, Partitions};
use crate::{InstallError, PayloadInstaller, RebootAction};

/// Payload type of root filesystem images.
pub const ROOTFS_IMAGE: &str = "rootfs-image";

/// Command used to reboot the system.
pub const REBOOT_COMMAND: &str = "reboot";

/// Installer writing root filesystem images to the inactive partition.
#[derive(Debug, Clone)]
pub struct DualRootfsInstaller {
    partitions: Arc<Partitions>,
    env: Arc<dyn BootEnv>,
    runner: Arc<dyn CommandRunner>,
    device_options: BlockDeviceOptions,
}

impl DualRootfsInstaller {
    pub fn new(
        partitions: Arc<Partitions>,
        env: Arc<dyn BootEnv>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            partitions,
            env,
            runner,
            device_options: BlockDeviceOptions::default(),
        }
    }

    /// Options used when opening the inactive partition.
    pub fn with_device_options(mut self, options: BlockDeviceOptions) -> Self {
        self.device_options = options;
        self
    }

    pub fn partitions(&self) -> &Partitions {
        &self.partitions
    }

    /// Check whether an update has been installed but not committed yet.
    pub fn has_update(&self) -> Result<bool, InstallError> {
        let vars = self.env.read_env(&[UPGRADE_AVAILABLE])?;
        Ok(upgrade_available(&vars))
    }

    fn set_boot_part(&self, partition: &Path, extra: &[(&str, &str)]) -> Result<(), InstallError> {
        let number = partition_number(partition)
            .ok_or_else(|| PartitionError::InvalidPartition(partition.to_path_buf()))?;
        let mut vars = BootVars::new();
        vars.insert(BOOT_PART.to_owned(), number.to_string());
        vars.insert(BOOT_PART_HEX.to_owned(), format!("{number:X}"));
        for (name, value) in extra {
            vars.insert((*name).to_owned(), (*value).to_owned());
        }
        self.env.write_env(&vars)?;
        Ok(())
    }

    fn verify_upgrade_flag(&self, target: &'static str, expected: bool) -> Result<(), InstallError> {
        let actual = self.has_update()?;
        if actual != expected {
            return Err(InstallError::UnexpectedUpgradeFlag {
                target,
                expected,
                actual,
            });
        }
        Ok(())
    }

    fn reboot_system(&self) -> Result<(), InstallError> {
        reboot_system(self.runner.as_ref())
    }
}

impl PayloadInstaller for DualRootfsInstaller {
    fn payload_type(&self) -> &str {
        ROOTFS_IMAGE
    }

    fn store_update(&mut self, stream: PayloadStream<'_>) -> Result<(), InstallError> {
        let size = i64::try_from(stream.size)
            .map_err(|_| BlockDeviceError::InvalidSize(i64::MAX))?;
        debug!(size, file = %stream.name, "trying to install update");
        let inactive = self.partitions.inactive()?;
        let mut device = BlockDevice::open(&inactive, size, &self.device_options)?;
        let result = copy_image(stream.reader, &mut device);
        match &result {
            Ok(written) => info!(
                "wrote {written}/{size} bytes of update to device {}",
                device.path().display()
            ),
            Err(error) => error!(
                "failed to write image data to device {}: {error}",
                device.path().display()
            ),
        }
        let closed = device.close().map_err(|source| {
            error!("closing device {} failed: {source}", device.path().display());
            write_error(&inactive, source)
        });
        let written = result.map_err(|source| write_error(&inactive, source))?;
        closed?;
        if written != stream.size {
            return Err(write_error(
                &inactive,
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("update ended after {written} of {} bytes", stream.size),
                ),
            ));
        }
        Ok(())
    }

    fn install_update(&mut self) -> Result<(), InstallError> {
        let inactive = self.partitions.inactive()?;
        info!(
            partition = %inactive.display(),
            "enabling partition with new image installed to be a boot candidate"
        );
        self.set_boot_part(&inactive, &[(UPGRADE_AVAILABLE, "1"), (BOOT_COUNT, "0")])?;
        debug!("marking inactive partition as a boot candidate successful");
        Ok(())
    }

    fn needs_reboot(&mut self) -> Result<RebootAction, InstallError> {
        Ok(RebootAction::Required)
    }

    fn reboot(&mut self) -> Result<(), InstallError> {
        let active = self.partitions.active()?;
        info!(partition = %active.display(), "rebooting from active partition");
        self.reboot_system()
    }

    fn supports_rollback(&mut self) -> Result<bool, InstallError> {
        Ok(true)
    }

    fn verify_reboot(&mut self) -> Result<(), InstallError> {
        self.verify_upgrade_flag("new", true)
    }

    fn commit_update(&mut self) -> Result<(), InstallError> {
        if !self.has_update()? {
            return Err(InstallError::NothingToCommit);
        }
        info!("committing update");
        let mut vars = BootVars::new();
        vars.insert(UPGRADE_AVAILABLE.to_owned(), "0".to_owned());
        self.env.write_env(&vars)?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), InstallError> {
        if !self.has_update()? {
            debug!("no update in progress, nothing to roll back");
            return Ok(());
        }
        let boot_part = self
            .env
            .read_env(&[BOOT_PART])?
            .remove(BOOT_PART)
            .and_then(|part| part.trim().parse::<u32>().ok());
        let active = self.partitions.active()?;
        let inactive = self.partitions.inactive()?;
        // Without a reboot, the boot candidate is still the inactive partition.
        let (target, description) = if boot_part.is_some() && boot_part == partition_number(&inactive)
        {
            (active, "active")
        } else {
            (inactive, "inactive")
        };
        info!(
            partition = %target.display(),
            "rolling back to the {description} partition"
        );
        self.set_boot_part(&target, &[(UPGRADE_AVAILABLE, "0")])?;
        debug!("marking partition as a boot candidate successful");
        Ok(())
    }

    fn rollback_reboot(&mut self) -> Result<(), InstallError> {
        let active = self.partitions.active()?;
        info!(partition = %active.display(), "rebooting to roll back update");
        self.reboot_system()
    }

    fn verify_rollback_reboot(&mut self) -> Result<(), InstallError> {
        self.verify_upgrade_flag("old", false)
    }
}

/// Sync the filesystems and reboot the system.
pub fn reboot_system(runner: &dyn CommandRunner) -> Result<(), InstallError> {
    nix::unistd::sync();
    let output = runner
        .run(REBOOT_COMMAND, &[], None)
        .map_err(|source| InstallError::Command {
            program: REBOOT_COMMAND.to_owned(),
            source,
        })?;
    if !output.success() {
        return Err(InstallError::CommandFailed {
            program: REBOOT_COMMAND.to_owned(),
            code: output.code,
        });
    }
    Ok(())
}

fn upgrade_available(vars: &BootVars) -> bool {
    vars.get(UPGRADE_AVAILABLE).map(|value| value.trim()) == Some("1")
}

fn copy_image(image: &mut dyn Read, device: &mut BlockDevice) -> io::Result<u64> {
    let written = io::copy(image, device)?;
    device.flush()?;
    Ok(written)
}

fn write_error(path: &Path, source: io::Error) -> InstallError {
    InstallError::WriteUpdate {
        path: PathBuf::from(path),
        source,
    }
}
