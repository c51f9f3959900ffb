//! Installer used when no backend for a payload type exists.
//!
//! This happens when recovering from an interrupted update whose update module
//! is no longer available, e.g., because it was part of the update. The stub
//! refuses every operation but lets the device reboot into a known-good state.

use tracing::error;

use rotor_artifact::header::{ArtifactHeaders, PayloadHeader};
use rotor_artifact::streams::PayloadStream;

use crate::{InstallError, PayloadInstaller, RebootAction};

/// Installer refusing to do anything.
#[derive(Debug, Clone)]
pub struct StubInstaller {
    payload_type: String,
}

impl StubInstaller {
    pub fn new(payload_type: impl Into<String>) -> Self {
        Self {
            payload_type: payload_type.into(),
        }
    }
}

fn refuse<T>(operation: &'static str) -> Result<T, InstallError> {
    Err(InstallError::Stub { operation })
}

impl PayloadInstaller for StubInstaller {
    fn payload_type(&self) -> &str {
        &self.payload_type
    }

    fn initialize(
        &mut self,
        _: &ArtifactHeaders,
        _: &PayloadHeader,
    ) -> Result<(), InstallError> {
        refuse("Download")
    }

    fn prepare_store_update(&mut self) -> Result<(), InstallError> {
        refuse("Download")
    }

    fn store_update(&mut self, _: PayloadStream<'_>) -> Result<(), InstallError> {
        refuse("Download")
    }

    fn finish_store_update(&mut self) -> Result<(), InstallError> {
        refuse("Download")
    }

    fn install_update(&mut self) -> Result<(), InstallError> {
        refuse("ArtifactInstall")
    }

    fn needs_reboot(&mut self) -> Result<RebootAction, InstallError> {
        Ok(RebootAction::Required)
    }

    fn reboot(&mut self) -> Result<(), InstallError> {
        refuse("ArtifactReboot")
    }

    fn supports_rollback(&mut self) -> Result<bool, InstallError> {
        error!(
            payload_type = %self.payload_type,
            "update module is missing, pretending to support rollback so the device can \
            reboot and try to restore its state"
        );
        Ok(true)
    }

    fn verify_reboot(&mut self) -> Result<(), InstallError> {
        refuse("ArtifactVerifyReboot")
    }

    fn commit_update(&mut self) -> Result<(), InstallError> {
        refuse("ArtifactCommit")
    }

    /// Refused like every other state change.
    ///
    /// The stub never pretends that a rollback happened. Callers reboot based
    /// on [`needs_reboot`](Self::needs_reboot), which lets the bootloader fall
    /// back to the known-good partition.
    fn rollback(&mut self) -> Result<(), InstallError> {
        refuse("ArtifactRollback")
    }

    /// Refused, see [`rollback`](Self::rollback).
    fn rollback_reboot(&mut self) -> Result<(), InstallError> {
        refuse("ArtifactRollbackReboot")
    }

    fn verify_rollback_reboot(&mut self) -> Result<(), InstallError> {
        refuse("ArtifactVerifyRollbackReboot")
    }

    fn failure(&mut self) -> Result<(), InstallError> {
        refuse("ArtifactFailure")
    }

    fn cleanup(&mut self) -> Result<(), InstallError> {
        refuse("Cleanup")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_refuses_lifecycle() {
        let mut stub = StubInstaller::new("missing-module");
        let mut reader: &[u8] = b"data";
        assert!(matches!(
            stub.store_update(PayloadStream {
                name: "file".to_owned(),
                size: 4,
                reader: &mut reader,
            }),
            Err(InstallError::Stub {
                operation: "Download"
            })
        ));
        let results = [
            stub.prepare_store_update(),
            stub.finish_store_update(),
            stub.install_update(),
            stub.reboot(),
            stub.verify_reboot(),
            stub.commit_update(),
            stub.rollback(),
            stub.rollback_reboot(),
            stub.verify_rollback_reboot(),
            stub.failure(),
            stub.cleanup(),
        ];
        assert!(results
            .iter()
            .all(|result| matches!(result, Err(InstallError::Stub { .. }))));
        assert_eq!(
            stub.commit_update().unwrap_err().to_string(),
            "stub module: cannot execute ArtifactCommit"
        );
    }

    #[test]
    fn test_stub_allows_reboot() {
        let mut stub = StubInstaller::new("missing-module");
        assert_eq!(stub.needs_reboot().unwrap(), RebootAction::Required);
        assert!(stub.supports_rollback().unwrap());
        assert_eq!(stub.payload_type(), "missing-module");
    }

    #[test]
    fn test_stub_refuses_rollback() {
        let mut stub = StubInstaller::new("missing-module");
        assert!(matches!(
            stub.rollback(),
            Err(InstallError::Stub {
                operation: "ArtifactRollback"
            })
        ));
        assert!(matches!(
            stub.rollback_reboot(),
            Err(InstallError::Stub {
                operation: "ArtifactRollbackReboot"
            })
        ));
    }
}
