//! Installation of update artifacts onto devices.
//!
//! Every payload of an artifact is handled by an [`Installer`] backend which is
//! driven through the update lifecycle:
//!
//! ```plain
//! initialize → prepare_store_update → store_update* → finish_store_update
//!     → install_update → reboot → verify_reboot → commit_update
//!                      ↘ rollback → rollback_reboot → verify_rollback_reboot
//! ```
//!
//! `failure` and `cleanup` may be called at any point after `initialize`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use rotor_artifact::header::{ArtifactHeaders, PayloadHeader};
use rotor_artifact::streams::PayloadStream;
use rotor_artifact::ArtifactError;
use rotor_common::bootenv::BootEnvError;
use rotor_common::disk::device::BlockDeviceError;

pub mod dual_rootfs;
pub mod info;
pub mod install;
pub mod modules;
pub mod partitions;
pub mod scripts;
pub mod stub;

use dual_rootfs::DualRootfsInstaller;
use modules::{ModuleError, ModuleInstaller};
use partitions::PartitionError;
use stub::StubInstaller;

/// Error of an installer backend.
#[derive(Debug, Error)]
pub enum InstallError {
    /// There is no update in progress which could be committed.
    #[error("there is nothing to commit")]
    NothingToCommit,
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    BootEnv(#[from] BootEnvError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    BlockDevice(#[from] BlockDeviceError),
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error("stub module: cannot execute {operation}")]
    Stub { operation: &'static str },
    #[error(
        "reboot to {target} update failed, expected \"upgrade_available\" flag to be \
        {expected} but it was {actual}"
    )]
    UnexpectedUpgradeFlag {
        target: &'static str,
        expected: bool,
        actual: bool,
    },
    #[error("unable to write update to {}", path.display())]
    WriteUpdate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unable to run `{program}`")]
    Command {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{program}` failed with exit code {code:?}")]
    CommandFailed { program: String, code: Option<i32> },
    #[error("internal error: {0}")]
    Internal(String),
}

/// Reboot required to activate an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootAction {
    /// The update is active without a reboot.
    NoReboot,
    /// The installer must be asked to reboot.
    Required,
    /// The device must be rebooted, but not by the installer.
    Automatic,
}

/// Backend installing a single payload.
///
/// Lifecycle methods return errors up to the caller which decides whether to
/// continue with `failure` and `rollback`.
pub trait PayloadInstaller {
    /// Type of the payloads handled by the installer.
    fn payload_type(&self) -> &str;

    /// Prepare the installation of the given payload.
    #[allow(unused_variables)]
    fn initialize(
        &mut self,
        headers: &ArtifactHeaders,
        payload: &PayloadHeader,
    ) -> Result<(), InstallError> {
        Ok(())
    }

    fn prepare_store_update(&mut self) -> Result<(), InstallError> {
        Ok(())
    }

    /// Store a single file of the payload.
    ///
    /// Called once for every file in the order of the artifact.
    fn store_update(&mut self, stream: PayloadStream<'_>) -> Result<(), InstallError>;

    /// Complete storing the payload.
    ///
    /// Must also be called if storing a file has failed.
    fn finish_store_update(&mut self) -> Result<(), InstallError> {
        Ok(())
    }

    fn install_update(&mut self) -> Result<(), InstallError>;

    fn needs_reboot(&mut self) -> Result<RebootAction, InstallError>;

    fn reboot(&mut self) -> Result<(), InstallError>;

    fn supports_rollback(&mut self) -> Result<bool, InstallError>;

    /// Verify that the reboot into the update succeeded.
    fn verify_reboot(&mut self) -> Result<(), InstallError>;

    fn commit_update(&mut self) -> Result<(), InstallError>;

    fn rollback(&mut self) -> Result<(), InstallError>;

    fn rollback_reboot(&mut self) -> Result<(), InstallError>;

    /// Verify that the reboot back into the old version succeeded.
    fn verify_rollback_reboot(&mut self) -> Result<(), InstallError>;

    fn failure(&mut self) -> Result<(), InstallError> {
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), InstallError> {
        Ok(())
    }
}

/// Installer backend for a payload.
#[derive(Debug)]
pub enum Installer {
    DualRootfs(DualRootfsInstaller),
    Module(ModuleInstaller),
    Stub(StubInstaller),
}

macro_rules! dispatch {
    ($self:ident, $installer:ident => $call:expr) => {
        match $self {
            Installer::DualRootfs($installer) => $call,
            Installer::Module($installer) => $call,
            Installer::Stub($installer) => $call,
        }
    };
}

impl PayloadInstaller for Installer {
    fn payload_type(&self) -> &str {
        dispatch!(self, installer => installer.payload_type())
    }

    fn initialize(
        &mut self,
        headers: &ArtifactHeaders,
        payload: &PayloadHeader,
    ) -> Result<(), InstallError> {
        dispatch!(self, installer => installer.initialize(headers, payload))
    }

    fn prepare_store_update(&mut self) -> Result<(), InstallError> {
        dispatch!(self, installer => installer.prepare_store_update())
    }

    fn store_update(&mut self, stream: PayloadStream<'_>) -> Result<(), InstallError> {
        dispatch!(self, installer => installer.store_update(stream))
    }

    fn finish_store_update(&mut self) -> Result<(), InstallError> {
        dispatch!(self, installer => installer.finish_store_update())
    }

    fn install_update(&mut self) -> Result<(), InstallError> {
        dispatch!(self, installer => installer.install_update())
    }

    fn needs_reboot(&mut self) -> Result<RebootAction, InstallError> {
        dispatch!(self, installer => installer.needs_reboot())
    }

    fn reboot(&mut self) -> Result<(), InstallError> {
        dispatch!(self, installer => installer.reboot())
    }

    fn supports_rollback(&mut self) -> Result<bool, InstallError> {
        dispatch!(self, installer => installer.supports_rollback())
    }

    fn verify_reboot(&mut self) -> Result<(), InstallError> {
        dispatch!(self, installer => installer.verify_reboot())
    }

    fn commit_update(&mut self) -> Result<(), InstallError> {
        dispatch!(self, installer => installer.commit_update())
    }

    fn rollback(&mut self) -> Result<(), InstallError> {
        dispatch!(self, installer => installer.rollback())
    }

    fn rollback_reboot(&mut self) -> Result<(), InstallError> {
        dispatch!(self, installer => installer.rollback_reboot())
    }

    fn verify_rollback_reboot(&mut self) -> Result<(), InstallError> {
        dispatch!(self, installer => installer.verify_rollback_reboot())
    }

    fn failure(&mut self) -> Result<(), InstallError> {
        dispatch!(self, installer => installer.failure())
    }

    fn cleanup(&mut self) -> Result<(), InstallError> {
        dispatch!(self, installer => installer.cleanup())
    }
}
