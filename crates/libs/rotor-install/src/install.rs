//! Reading an artifact and storing its payloads with the matching backends.

use std::io::Read;

use tracing::{debug, error, info};

use rotor_artifact::header::{ArtifactHeaders, PayloadHeader};
use rotor_artifact::reader::{ArtifactReader, HeaderHooks};
use rotor_artifact::streams::PayloadStreams;
use rotor_artifact::{ArtifactError, VerificationKey};

use crate::dual_rootfs::{DualRootfsInstaller, ROOTFS_IMAGE};
use crate::modules::ModuleInstallerFactory;
use crate::scripts::ScriptsStore;
use crate::stub::StubInstaller;
use crate::{InstallError, Installer, PayloadInstaller};

/// Options for reading an artifact.
#[derive(Debug, Default)]
pub struct InstallOptions {
    /// Device type the artifact must be compatible with.
    ///
    /// An unknown device type accepts every artifact.
    pub device_type: Option<String>,
    /// Key the artifact must be signed with.
    pub verification_key: Option<VerificationKey>,
    /// Where to store the state scripts of the artifact.
    pub scripts: Option<ScriptsStore>,
}

/// Installer backends available on the device.
#[derive(Debug, Default)]
pub struct Backends {
    dual_rootfs: Option<DualRootfsInstaller>,
    modules: Option<ModuleInstallerFactory>,
    module_types: Vec<String>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dual_rootfs(mut self, installer: DualRootfsInstaller) -> Self {
        self.dual_rootfs = Some(installer);
        self
    }

    /// Add the update modules, discovering the available modules once.
    pub fn with_modules(mut self, factory: ModuleInstallerFactory) -> Self {
        self.module_types = factory.module_types();
        self.modules = Some(factory);
        self
    }

    pub fn dual_rootfs(&self) -> Option<&DualRootfsInstaller> {
        self.dual_rootfs.as_ref()
    }

    /// Payload types for which a backend exists.
    pub fn payload_types(&self) -> Vec<String> {
        let mut types = Vec::new();
        if self.dual_rootfs.is_some() {
            types.push(ROOTFS_IMAGE.to_owned());
        }
        for module_type in &self.module_types {
            if !types.contains(module_type) {
                types.push(module_type.clone());
            }
        }
        types
    }

    pub fn supports(&self, payload_type: &str) -> bool {
        (payload_type == ROOTFS_IMAGE && self.dual_rootfs.is_some())
            || self.module_types.iter().any(|name| name == payload_type)
    }

    /// Create the installer for a payload.
    pub fn installer(&self, payload_type: &str, index: usize) -> Result<Installer, InstallError> {
        if payload_type == ROOTFS_IMAGE {
            if let Some(dual_rootfs) = &self.dual_rootfs {
                return Ok(Installer::DualRootfs(dual_rootfs.clone()));
            }
        }
        match &self.modules {
            Some(factory) if self.module_types.iter().any(|name| name == payload_type) => Ok(
                Installer::Module(factory.installer(payload_type, index)?),
            ),
            _ => Err(ArtifactError::UnsupportedPayloadType(payload_type.to_owned()).into()),
        }
    }

    /// Create the installer for a payload of an interrupted update.
    ///
    /// Falls back to a [`StubInstaller`] if the backend is gone.
    pub fn restore_installer(&self, payload_type: &str, index: usize) -> Installer {
        match self.installer(payload_type, index) {
            Ok(installer) => installer,
            Err(error) => {
                error!(payload_type, "unable to restore installer: {error}");
                Installer::Stub(StubInstaller::new(payload_type))
            }
        }
    }
}

/// Checks applied while the artifact headers are read.
struct InstallHooks<'i> {
    device_type: Option<&'i str>,
    backends: &'i Backends,
    scripts: Option<&'i ScriptsStore>,
}

impl HeaderHooks for InstallHooks<'_> {
    fn compatible_devices(&mut self, devices: &[String]) -> Result<(), ArtifactError> {
        match self.device_type.filter(|device_type| !device_type.is_empty()) {
            None => {
                error!("unknown device type, continuing at your own risk");
                Ok(())
            }
            Some(device_type) if devices.iter().any(|device| device == device_type) => Ok(()),
            Some(device_type) => Err(ArtifactError::Incompatible {
                device_type: device_type.to_owned(),
                compatible: devices.to_vec(),
            }),
        }
    }

    fn payload_type(&mut self, index: usize, payload_type: &str) -> Result<(), ArtifactError> {
        if !self.backends.supports(payload_type) {
            return Err(ArtifactError::UnsupportedPayloadType(payload_type.to_owned()));
        }
        debug!(payload = index, payload_type, "found installer for payload");
        Ok(())
    }

    fn scripts_start(&mut self) -> Result<(), ArtifactError> {
        if let Some(scripts) = self.scripts {
            scripts.clear().map_err(ArtifactError::ScriptsDirectory)?;
        }
        Ok(())
    }

    fn script(&mut self, name: &str, script: &mut dyn Read) -> Result<(), ArtifactError> {
        let Some(scripts) = self.scripts else {
            debug!(script = name, "no scripts directory, skipping state script");
            return Ok(());
        };
        scripts
            .store(name, script)
            .map_err(|source| ArtifactError::Script {
                name: name.to_owned(),
                source,
            })
    }

    fn scripts_finish(&mut self, version: u32) -> Result<(), ArtifactError> {
        if let Some(scripts) = self.scripts {
            scripts
                .finish(version)
                .map_err(ArtifactError::ScriptsDirectory)?;
        }
        Ok(())
    }
}

/// Artifact being installed.
pub struct Installation<R> {
    reader: ArtifactReader<R>,
    headers: ArtifactHeaders,
    installers: Vec<Installer>,
}

impl<R: Read> Installation<R> {
    /// Read the headers of the artifact and initialize an installer per payload.
    ///
    /// Artifacts with payloads no backend supports are rejected before anything
    /// is written.
    pub fn read_headers(
        input: R,
        backends: &Backends,
        options: InstallOptions,
    ) -> Result<Self, InstallError> {
        let mut reader = ArtifactReader::new(input).with_verification_key(options.verification_key);
        let mut hooks = InstallHooks {
            device_type: options.device_type.as_deref(),
            backends,
            scripts: options.scripts.as_ref(),
        };
        let headers = reader.read_headers(&mut hooks)?.clone();
        let mut installers = Vec::with_capacity(headers.payloads.len());
        for payload in &headers.payloads {
            let mut installer = backends.installer(&payload.payload_type, payload.index)?;
            installer.initialize(&headers, payload)?;
            installers.push(installer);
        }
        info!(
            artifact = headers.artifact_name(),
            signed = headers.signed,
            "artifact headers read"
        );
        Ok(Self {
            reader,
            headers,
            installers,
        })
    }

    pub fn headers(&self) -> &ArtifactHeaders {
        &self.headers
    }

    pub fn installers(&self) -> &[Installer] {
        &self.installers
    }

    pub fn installers_mut(&mut self) -> &mut [Installer] {
        &mut self.installers
    }

    /// Stream the payloads of the artifact to their installers.
    pub fn store_payloads(&mut self) -> Result<(), InstallError> {
        loop {
            let installers = &mut self.installers;
            let stored = self
                .reader
                .read_payload(|payload, streams| store_payload(installers, payload, streams))?;
            if stored.is_none() {
                return Ok(());
            }
        }
    }

    pub fn into_installers(self) -> Vec<Installer> {
        self.installers
    }
}

fn store_payload(
    installers: &mut [Installer],
    payload: &PayloadHeader,
    streams: &mut dyn PayloadStreams,
) -> Result<(), InstallError> {
    let installer = installers.get_mut(payload.index).ok_or_else(|| {
        InstallError::Internal(format!("no installer for payload {}", payload.index))
    })?;
    store_streams(installer, streams)
}

/// Store the files of a payload with the given installer.
///
/// The store is finished even if storing one of the files fails.
pub fn store_streams(
    installer: &mut Installer,
    streams: &mut dyn PayloadStreams,
) -> Result<(), InstallError> {
    installer.prepare_store_update()?;
    let stored = store_each(installer, streams);
    let finished = installer.finish_store_update();
    stored.and(finished)
}

fn store_each(
    installer: &mut Installer,
    streams: &mut dyn PayloadStreams,
) -> Result<(), InstallError> {
    while let Some(stream) = streams.next_stream()? {
        installer.store_update(stream)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::Arc;

    use rotor_artifact::writer::{ArtifactWriter, PayloadWriter};

    use super::*;
    use crate::info::StaticInfo;

    fn artifact(writer: ArtifactWriter) -> Vec<u8> {
        writer.write(Vec::new()).unwrap()
    }

    fn modules(dir: &Path) -> ModuleInstallerFactory {
        let modules = dir.join("modules");
        fs::create_dir_all(&modules).unwrap();
        let module = modules.join("noop");
        fs::write(&module, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&module, fs::Permissions::from_mode(0o755)).unwrap();
        let info = Arc::new(StaticInfo {
            artifact_name: "release-1".to_owned(),
            artifact_group: String::new(),
            device_type: "test-device".to_owned(),
        });
        ModuleInstallerFactory::new(modules, dir.join("work"), info.clone(), info)
    }

    #[test]
    fn test_unknown_payload_type() {
        let data = artifact(
            ArtifactWriter::new("release-2")
                .device_type("test-device")
                .payload(PayloadWriter::new("unknown").file("update", b"data".to_vec())),
        );
        let result = Installation::read_headers(&data[..], &Backends::new(), InstallOptions::default());
        assert!(matches!(
            result,
            Err(InstallError::Artifact(ArtifactError::UnsupportedPayloadType(name))) if name == "unknown"
        ));
    }

    #[test]
    fn test_incompatible_device() {
        let dir = tempfile::tempdir().unwrap();
        let backends = Backends::new().with_modules(modules(dir.path()));
        let data = artifact(
            ArtifactWriter::new("release-2")
                .device_type("other-device")
                .payload(PayloadWriter::new("noop")),
        );
        let options = InstallOptions {
            device_type: Some("test-device".to_owned()),
            ..Default::default()
        };
        let Err(error) = Installation::read_headers(&data[..], &backends, options) else {
            panic!("incompatible artifact has been accepted");
        };
        assert!(matches!(
            error,
            InstallError::Artifact(ArtifactError::Incompatible { .. })
        ));
        assert!(error.to_string().contains("\"test-device\""));
        assert!(error.to_string().contains("other-device"));
    }

    #[test]
    fn test_unknown_device_type_continues() {
        let dir = tempfile::tempdir().unwrap();
        let backends = Backends::new().with_modules(modules(dir.path()));
        let data = artifact(
            ArtifactWriter::new("release-2")
                .device_type("other-device")
                .payload(PayloadWriter::new("noop")),
        );
        let installation =
            Installation::read_headers(&data[..], &backends, InstallOptions::default()).unwrap();
        assert_eq!(installation.headers().artifact_name(), "release-2");
        assert_eq!(installation.installers().len(), 1);
        assert_eq!(installation.installers()[0].payload_type(), "noop");
        assert!(dir.path().join("work/payloads/0000/tree/stream-next").exists());
    }

    #[test]
    fn test_scripts_replace_previous_ones() {
        let dir = tempfile::tempdir().unwrap();
        let backends = Backends::new().with_modules(modules(dir.path()));
        let scripts = ScriptsStore::new(dir.path().join("scripts"));
        scripts.clear().unwrap();
        scripts
            .store("ArtifactCommit_Enter_00", &mut &b"old"[..])
            .unwrap();
        let data = artifact(
            ArtifactWriter::new("release-2")
                .device_type("test-device")
                .script("ArtifactInstall_Enter_00", b"#!/bin/sh\n".to_vec())
                .payload(PayloadWriter::new("noop")),
        );
        let options = InstallOptions {
            device_type: Some("test-device".to_owned()),
            scripts: Some(scripts.clone()),
            ..Default::default()
        };
        Installation::read_headers(&data[..], &backends, options).unwrap();
        assert_eq!(scripts.scripts().unwrap(), ["ArtifactInstall_Enter_00"]);
        assert_eq!(scripts.version().unwrap(), Some(3));
    }

    #[test]
    fn test_restore_falls_back_to_stub() {
        let backends = Backends::new();
        assert!(matches!(
            backends.restore_installer("gone", 0),
            Installer::Stub(_)
        ));
        assert!(!backends.supports(ROOTFS_IMAGE));
        assert!(backends.payload_types().is_empty());
    }
}
