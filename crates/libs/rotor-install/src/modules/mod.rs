//! Installation of payloads through update modules.
//!
//! An update module is an executable named after the payload type it handles.
//! It is invoked as `<module> <state> <tree>` for every state of the update, with
//! `<tree>` being a per-payload working directory containing the artifact
//! metadata:
//!
//! ```plain
//! <tree>/
//!     version
//!     current_artifact_name
//!     current_artifact_group
//!     current_device_type
//!     header/{artifact_group, artifact_name, payload_type, header-info, type-info, meta-data}
//!     stream-next
//!     streams/
//!     files/
//!     tmp/
//! ```

use std::fmt;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::stat::Mode;
use thiserror::Error;
use tracing::{debug, error, info};

use rotor_artifact::header::{ArtifactHeaders, PayloadHeader};
use rotor_artifact::streams::PayloadStream;

use crate::info::{ArtifactInfo, DeviceInfo};
use crate::{InstallError, PayloadInstaller, RebootAction};

pub mod download;
mod killer;

use download::ModuleDownload;
pub use killer::KILL_GRACE_PERIOD;

/// Timeout of module invocations if none is configured.
pub const DEFAULT_MODULE_TIMEOUT: Duration = Duration::from_secs(14400);

/// Highest supported payload index.
pub const MAX_PAYLOAD_INDEX: usize = 9999;

/// Error running an update module.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("payload index out of range 0-{MAX_PAYLOAD_INDEX}: {0}")]
    IndexOutOfRange(usize),
    #[error("unable to execute update module {}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("update module terminated abnormally in state {state} ({status})")]
    Abnormal {
        state: ModuleState,
        status: ExitStatus,
    },
    #[error("unable to wait for update module")]
    Wait(#[source] io::Error),
    #[error("update module terminated in the middle of the download")]
    TerminatedMidDownload,
    #[error("unexpected reply from update module {query} query: {reply}")]
    UnexpectedReply { query: ModuleState, reply: String },
    #[error("unable to prepare update module working tree {}", path.display())]
    WorkTree {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unable to create {}", path.display())]
    CreateFifo {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("unable to stream into {}", path.display())]
    Stream {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unable to read payload file")]
    ReadPayload(#[source] io::Error),
    #[error("unable to read update module output")]
    Output(#[source] io::Error),
    #[error("unable to determine {what}")]
    Info {
        what: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

/// State passed to an update module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Download,
    ArtifactInstall,
    NeedsArtifactReboot,
    ArtifactReboot,
    ArtifactCommit,
    SupportsRollback,
    ArtifactRollback,
    ArtifactRollbackReboot,
    ArtifactVerifyReboot,
    ArtifactVerifyRollbackReboot,
    ArtifactFailure,
    Cleanup,
}

impl ModuleState {
    pub fn as_str(self) -> &'static str {
        match self {
            ModuleState::Download => "Download",
            ModuleState::ArtifactInstall => "ArtifactInstall",
            ModuleState::NeedsArtifactReboot => "NeedsArtifactReboot",
            ModuleState::ArtifactReboot => "ArtifactReboot",
            ModuleState::ArtifactCommit => "ArtifactCommit",
            ModuleState::SupportsRollback => "SupportsRollback",
            ModuleState::ArtifactRollback => "ArtifactRollback",
            ModuleState::ArtifactRollbackReboot => "ArtifactRollbackReboot",
            ModuleState::ArtifactVerifyReboot => "ArtifactVerifyReboot",
            ModuleState::ArtifactVerifyRollbackReboot => "ArtifactVerifyRollbackReboot",
            ModuleState::ArtifactFailure => "ArtifactFailure",
            ModuleState::Cleanup => "Cleanup",
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Creates installers for the available update modules.
#[derive(Debug, Clone)]
pub struct ModuleInstallerFactory {
    modules_path: PathBuf,
    work_path: PathBuf,
    artifact_info: Arc<dyn ArtifactInfo>,
    device_info: Arc<dyn DeviceInfo>,
    timeout: Duration,
}

impl ModuleInstallerFactory {
    pub fn new(
        modules_path: impl Into<PathBuf>,
        work_path: impl Into<PathBuf>,
        artifact_info: Arc<dyn ArtifactInfo>,
        device_info: Arc<dyn DeviceInfo>,
    ) -> Self {
        Self {
            modules_path: modules_path.into(),
            work_path: work_path.into(),
            artifact_info,
            device_info,
            timeout: DEFAULT_MODULE_TIMEOUT,
        }
    }

    /// Timeout of a single module invocation in seconds.
    ///
    /// Zero or negative values select [`DEFAULT_MODULE_TIMEOUT`].
    pub fn with_timeout_secs(mut self, seconds: i64) -> Self {
        self.timeout = match u64::try_from(seconds) {
            Ok(seconds) if seconds > 0 => Duration::from_secs(seconds),
            _ => {
                debug!(
                    "module timeout not set, defaulting to {} seconds",
                    DEFAULT_MODULE_TIMEOUT.as_secs()
                );
                DEFAULT_MODULE_TIMEOUT
            }
        };
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn modules_path(&self) -> &Path {
        &self.modules_path
    }

    /// Payload types for which an executable module exists.
    pub fn module_types(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.modules_path) {
            Ok(entries) => entries,
            Err(error) => {
                info!(
                    "update module path {} could not be opened ({error}), update modules \
                    will not be available",
                    self.modules_path.display()
                );
                return Vec::new();
            }
        };
        let mut types = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    error!("unable to read update module directory entry: {error}");
                    continue;
                }
            };
            let path = entry.path();
            let metadata = match fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(error) => {
                    error!("unable to inspect update module {}: {error}", path.display());
                    continue;
                }
            };
            if metadata.is_dir() {
                error!("update module {} is a directory", path.display());
                continue;
            }
            if metadata.permissions().mode() & 0o111 == 0 {
                error!("update module {} is not executable", path.display());
                continue;
            }
            types.push(entry.file_name().to_string_lossy().into_owned());
        }
        types.sort();
        types
    }

    /// Create an installer for the payload with the given index.
    pub fn installer(
        &self,
        payload_type: &str,
        index: usize,
    ) -> Result<ModuleInstaller, ModuleError> {
        if index > MAX_PAYLOAD_INDEX {
            return Err(ModuleError::IndexOutOfRange(index));
        }
        Ok(ModuleInstaller {
            payload_type: payload_type.to_owned(),
            program: self.modules_path.join(payload_type),
            tree: self
                .work_path
                .join("payloads")
                .join(format!("{index:04}"))
                .join("tree"),
            timeout: self.timeout,
            artifact_info: self.artifact_info.clone(),
            device_info: self.device_info.clone(),
            download: None,
        })
    }
}

/// Installer delegating to an update module.
#[derive(Debug)]
pub struct ModuleInstaller {
    payload_type: String,
    program: PathBuf,
    tree: PathBuf,
    timeout: Duration,
    artifact_info: Arc<dyn ArtifactInfo>,
    device_info: Arc<dyn DeviceInfo>,
    download: Option<ModuleDownload>,
}

impl ModuleInstaller {
    /// Working tree of the payload.
    pub fn tree(&self) -> &Path {
        &self.tree
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self, state: ModuleState) -> Command {
        debug!(
            "calling module: {} {state} {}",
            self.program.display(),
            self.tree.display()
        );
        let mut command = Command::new(&self.program);
        command
            .arg(state.as_str())
            .arg(&self.tree)
            .current_dir(&self.tree)
            .stdin(Stdio::null())
            // Allows killing the module together with its children.
            .process_group(0);
        command
    }

    fn spawn_error(&self, source: io::Error) -> ModuleError {
        error!("could not execute update module: {source}");
        ModuleError::Spawn {
            path: self.program.clone(),
            source,
        }
    }

    /// Run the module in the given state, optionally capturing its output.
    fn call(&self, state: ModuleState, capture: bool) -> Result<String, ModuleError> {
        let mut command = self.command(state);
        if capture {
            command.stdout(Stdio::piped());
        }
        let mut child = command.spawn().map_err(|error| self.spawn_error(error))?;
        let mut killer = killer::ProcessKiller::start(child.id(), self.timeout, KILL_GRACE_PERIOD);
        let mut output = String::new();
        let read = match child.stdout.take() {
            Some(mut stdout) => stdout.read_to_string(&mut output).map(drop),
            None => Ok(()),
        };
        let status = child.wait().map_err(ModuleError::Wait);
        killer.stop();
        let status = status?;
        if !status.success() {
            let error = ModuleError::Abnormal { state, status };
            error!("{error}");
            return Err(error);
        }
        read.map_err(ModuleError::Output)?;
        if let Some(stripped) = output.strip_suffix('\n') {
            output.truncate(stripped.len());
        }
        Ok(output)
    }

    fn call_state(&self, state: ModuleState) -> Result<(), InstallError> {
        self.call(state, false)?;
        Ok(())
    }

    fn build_tree(
        &self,
        headers: &ArtifactHeaders,
        payload: &PayloadHeader,
    ) -> Result<(), ModuleError> {
        let tree_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source: io::Error| ModuleError::WorkTree { path, source }
        };
        match fs::remove_dir_all(&self.tree) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => {
                return Err(tree_error(self.tree.as_path())(error));
            }
            _ => {}
        }
        for dir in ["header", "tmp", "streams"] {
            let path = self.tree.join(dir);
            DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&path)
                .map_err(tree_error(path.as_path()))?;
        }
        let info_error =
            |what: &'static str| move |source: io::Error| ModuleError::Info { what, source };
        let current_name = self
            .artifact_info
            .artifact_name()
            .map_err(info_error("current artifact name"))?;
        let current_group = self
            .artifact_info
            .artifact_group()
            .map_err(info_error("current artifact group"))?;
        let device_type = self
            .device_info
            .device_type()
            .map_err(info_error("device type"))?;
        let pretty = |value: &serde_json::Value| {
            serde_json::to_string_pretty(value)
                .map_err(|error| ModuleError::Internal(format!("unable to encode JSON: {error}")))
        };
        let files = [
            ("version", headers.version.to_string()),
            ("current_artifact_name", current_name),
            ("current_artifact_group", current_group),
            ("current_device_type", device_type),
            (
                "header/artifact_group",
                headers.artifact_group().unwrap_or_default().to_owned(),
            ),
            ("header/artifact_name", headers.artifact_name().to_owned()),
            ("header/payload_type", self.payload_type.clone()),
            ("header/header-info", pretty(&headers.info_json)?),
            ("header/type-info", pretty(&payload.type_info_json)?),
            ("header/meta-data", pretty(&payload.meta_data)?),
        ];
        for (name, contents) in files {
            let path = self.tree.join(name);
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&path)
                .and_then(|mut file| file.write_all(contents.as_bytes()))
                .map_err(tree_error(path.as_path()))?;
        }
        let stream_next = self.tree.join("stream-next");
        nix::unistd::mkfifo(&stream_next, Mode::from_bits_truncate(0o600)).map_err(|source| {
            ModuleError::CreateFifo {
                path: stream_next.clone(),
                source,
            }
        })?;
        // The tree must survive a spontaneous reboot.
        nix::unistd::sync();
        Ok(())
    }

    fn query(&self, state: ModuleState) -> Result<String, ModuleError> {
        self.call(state, true)
    }
}

impl PayloadInstaller for ModuleInstaller {
    fn payload_type(&self) -> &str {
        &self.payload_type
    }

    fn initialize(
        &mut self,
        headers: &ArtifactHeaders,
        payload: &PayloadHeader,
    ) -> Result<(), InstallError> {
        debug!(payload_type = %self.payload_type, "initializing update module payload");
        if self.download.is_some() {
            return Err(ModuleError::Internal(
                "initialize called while a download is active".to_owned(),
            )
            .into());
        }
        self.build_tree(headers, payload)?;
        Ok(())
    }

    fn prepare_store_update(&mut self) -> Result<(), InstallError> {
        if self.download.is_some() {
            return Err(ModuleError::Internal("download is already active".to_owned()).into());
        }
        let child = self
            .command(ModuleState::Download)
            .spawn()
            .map_err(|error| self.spawn_error(error))?;
        self.download = Some(ModuleDownload::start(
            self.tree.clone(),
            child,
            self.timeout,
            KILL_GRACE_PERIOD,
        )?);
        Ok(())
    }

    fn store_update(&mut self, stream: PayloadStream<'_>) -> Result<(), InstallError> {
        let Some(download) = &mut self.download else {
            return Err(ModuleError::Internal(
                "store_update called while no download is active".to_owned(),
            )
            .into());
        };
        debug!(file = %stream.name, size = stream.size, "streaming payload file to update module");
        download.store(&stream.name, stream.reader)?;
        Ok(())
    }

    fn finish_store_update(&mut self) -> Result<(), InstallError> {
        let Some(mut download) = self.download.take() else {
            debug!("no download active, nothing to finish");
            return Ok(());
        };
        download.finish()?;
        Ok(())
    }

    fn install_update(&mut self) -> Result<(), InstallError> {
        self.call_state(ModuleState::ArtifactInstall)
    }

    fn needs_reboot(&mut self) -> Result<RebootAction, InstallError> {
        let query = ModuleState::NeedsArtifactReboot;
        match self.query(query)?.as_str() {
            "" | "No" => {
                debug!("module does not need reboot");
                Ok(RebootAction::NoReboot)
            }
            "Yes" => {
                debug!("module needs custom reboot");
                Ok(RebootAction::Required)
            }
            "Automatic" => {
                debug!("module needs host reboot");
                Ok(RebootAction::Automatic)
            }
            reply => Err(ModuleError::UnexpectedReply {
                query,
                reply: reply.to_owned(),
            }
            .into()),
        }
    }

    fn reboot(&mut self) -> Result<(), InstallError> {
        self.call_state(ModuleState::ArtifactReboot)
    }

    fn supports_rollback(&mut self) -> Result<bool, InstallError> {
        let query = ModuleState::SupportsRollback;
        match self.query(query)?.as_str() {
            "" | "No" => Ok(false),
            "Yes" => Ok(true),
            reply => Err(ModuleError::UnexpectedReply {
                query,
                reply: reply.to_owned(),
            }
            .into()),
        }
    }

    fn verify_reboot(&mut self) -> Result<(), InstallError> {
        self.call_state(ModuleState::ArtifactVerifyReboot)
    }

    fn commit_update(&mut self) -> Result<(), InstallError> {
        self.call_state(ModuleState::ArtifactCommit)
    }

    fn rollback(&mut self) -> Result<(), InstallError> {
        self.call_state(ModuleState::ArtifactRollback)
    }

    fn rollback_reboot(&mut self) -> Result<(), InstallError> {
        self.call_state(ModuleState::ArtifactRollbackReboot)
    }

    fn verify_rollback_reboot(&mut self) -> Result<(), InstallError> {
        self.call_state(ModuleState::ArtifactVerifyRollbackReboot)
    }

    fn failure(&mut self) -> Result<(), InstallError> {
        self.call_state(ModuleState::ArtifactFailure)
    }

    fn cleanup(&mut self) -> Result<(), InstallError> {
        if let Err(error) = fs::metadata(&self.tree) {
            info!(
                "could not access {}, assuming cleanup already done: {error}",
                self.tree.display()
            );
            return Ok(());
        }
        let result = self.call_state(ModuleState::Cleanup);
        if let Err(error) = fs::remove_dir_all(&self.tree) {
            error!("error during cleanup of module working directory: {error}");
        }
        result
    }
}
