//! Definition of the command line interface (CLI).

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tracing::{error, info, warn};

use rotor_artifact::{SignatureError, VerificationKey};
use rotor_common::bootenv::{BootEnv, ToolBootEnv};
use rotor_common::command::{CommandRunner, SystemCommandRunner};
use rotor_common::disk::device::BlockDeviceOptions;
use rotor_install::dual_rootfs::{self, DualRootfsInstaller};
use rotor_install::info::{ArtifactInfo, ArtifactInfoFile, DeviceInfo, DeviceTypeFile};
use rotor_install::install::{Backends, InstallOptions, Installation};
use rotor_install::modules::ModuleInstallerFactory;
use rotor_install::partitions::{PartitionError, Partitions, SystemProbe};
use rotor_install::scripts::ScriptsStore;
use rotor_install::{InstallError, Installer, PayloadInstaller, RebootAction};

use crate::config::{load_config, Config, ConfigError, DEFAULT_CONFIG_PATH};
use crate::standalone::{StandaloneState, StateStore};

/// Error of a command.
#[derive(Debug, Error)]
pub enum CtrlError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error("invalid root partition configuration")]
    Partitions(#[source] PartitionError),
    #[error("unable to read verification key {}", path.display())]
    ReadKey {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid verification key {}", path.display())]
    InvalidKey {
        path: PathBuf,
        #[source]
        source: SignatureError,
    },
    #[error("unable to open artifact {}", path.display())]
    OpenArtifact {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unable to access installation state")]
    State(#[source] io::Error),
    #[error("unable to update artifact information")]
    ArtifactInfo(#[source] io::Error),
    #[error("an update is already in progress, commit or roll it back first")]
    InProgress,
    #[error("no update in progress")]
    NoUpdate,
    #[error("payload type `{0}` does not support rollback")]
    NoRollback(String),
}

/// Command line arguments.
#[derive(Debug, Parser)]
#[clap(author, version, about)]
pub struct Args {
    /// Path of the configuration file.
    #[clap(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
    /// The command.
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Install an artifact.
    Install {
        /// Path of the artifact, `-` reads it from standard input.
        artifact: String,
        /// Reboot the device if the update requires it.
        #[clap(long)]
        reboot: bool,
    },
    /// Commit the installed update.
    Commit,
    /// Roll back the installed update.
    Rollback,
    /// Show the name of the installed artifact.
    ShowArtifact,
    /// List the payload types supported by update modules.
    ModuleTypes,
}

pub fn main() -> Result<(), CtrlError> {
    let args = Args::parse();
    let config = load_config(&args.config)?;
    let device = Device::new(config)?;
    match args.command {
        Command::Install { artifact, reboot } => device.install(&artifact, reboot),
        Command::Commit => device.commit(),
        Command::Rollback => device.rollback(),
        Command::ShowArtifact => {
            let name = device
                .artifact_info
                .artifact_name()
                .map_err(CtrlError::ArtifactInfo)?;
            println!("{}", if name.is_empty() { "unknown" } else { &name });
            Ok(())
        }
        Command::ModuleTypes => {
            for module_type in device.modules.module_types() {
                println!("{module_type}");
            }
            Ok(())
        }
    }
}

/// The device being updated.
struct Device {
    config: Config,
    runner: Arc<dyn CommandRunner>,
    backends: Backends,
    modules: ModuleInstallerFactory,
    artifact_info: Arc<ArtifactInfoFile>,
    device_info: Arc<DeviceTypeFile>,
    state: StateStore,
}

impl Device {
    fn new(config: Config) -> Result<Self, CtrlError> {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
        let artifact_info = Arc::new(ArtifactInfoFile::new(
            config.data_path.join("artifact_info"),
        ));
        let device_info = Arc::new(DeviceTypeFile::new(&config.device_type_file));
        let modules = ModuleInstallerFactory::new(
            &config.modules_path,
            &config.modules_work_path,
            artifact_info.clone(),
            device_info.clone(),
        )
        .with_timeout_secs(config.module_timeout_seconds);
        let mut backends = Backends::new().with_modules(modules.clone());
        match (&config.rootfs_part_a, &config.rootfs_part_b) {
            (Some(part_a), Some(part_b)) => {
                let env: Arc<dyn BootEnv> = Arc::new(
                    ToolBootEnv::with_runner(runner.clone(), config.env_tools())
                        .with_privileged(nix::unistd::geteuid().is_root()),
                );
                let partitions = Partitions::new(part_a, part_b, env.clone(), Arc::new(SystemProbe))
                    .map_err(CtrlError::Partitions)?;
                let installer = DualRootfsInstaller::new(Arc::new(partitions), env, runner.clone())
                    .with_device_options(
                        BlockDeviceOptions::default().with_sync_interval(config.flush_interval),
                    );
                backends = backends.with_dual_rootfs(installer);
            }
            _ => info!("root partitions not configured, root filesystem updates are disabled"),
        }
        let state = StateStore::new(&config.data_path);
        Ok(Self {
            config,
            runner,
            backends,
            modules,
            artifact_info,
            device_info,
            state,
        })
    }

    fn verification_key(&self) -> Result<Option<VerificationKey>, CtrlError> {
        let Some(path) = &self.config.artifact_verify_key else {
            return Ok(None);
        };
        let pem = fs::read_to_string(path).map_err(|source| CtrlError::ReadKey {
            path: path.clone(),
            source,
        })?;
        VerificationKey::from_pem(&pem)
            .map(Some)
            .map_err(|source| CtrlError::InvalidKey {
                path: path.clone(),
                source,
            })
    }

    fn install(&self, artifact: &str, reboot: bool) -> Result<(), CtrlError> {
        if self.state.load().map_err(CtrlError::State)?.is_some() {
            return Err(CtrlError::InProgress);
        }
        let input: Box<dyn Read> = if artifact == "-" {
            Box::new(io::stdin().lock())
        } else {
            let file = File::open(artifact).map_err(|source| CtrlError::OpenArtifact {
                path: PathBuf::from(artifact),
                source,
            })?;
            Box::new(io::BufReader::new(file))
        };
        let device_type = match self.device_info.device_type() {
            Ok(device_type) => Some(device_type),
            Err(error) => {
                warn!("unable to determine device type: {error}");
                None
            }
        };
        let options = InstallOptions {
            device_type,
            verification_key: self.verification_key()?,
            scripts: Some(ScriptsStore::new(&self.config.scripts_path)),
        };
        let mut installation = Installation::read_headers(input, &self.backends, options)?;
        info!(
            artifact = installation.headers().artifact_name(),
            "installing artifact"
        );
        if let Err(error) = installation.store_payloads() {
            abort(installation.installers_mut(), false);
            return Err(error.into());
        }
        for index in 0..installation.installers().len() {
            if let Err(error) = installation.installers_mut()[index].install_update() {
                abort(installation.installers_mut(), true);
                return Err(error.into());
            }
        }
        let headers = installation.headers();
        let state = StandaloneState::new(
            headers.artifact_name(),
            headers.artifact_group().map(str::to_owned),
            installation
                .installers()
                .iter()
                .map(|installer| installer.payload_type().to_owned())
                .collect(),
        );
        self.state.store(&state).map_err(CtrlError::State)?;

        let mut installers = installation.into_installers();
        let mut actions = Vec::with_capacity(installers.len());
        for installer in &mut installers {
            actions.push(installer.needs_reboot()?);
        }
        if actions.iter().all(|action| *action == RebootAction::NoReboot) {
            println!("Installed the update, use `commit` to make it permanent or `rollback`.");
            return Ok(());
        }
        if !reboot {
            println!("Installed the update, reboot the device to activate it.");
            return Ok(());
        }
        for (installer, action) in installers.iter_mut().zip(&actions) {
            if *action == RebootAction::Required {
                installer.reboot()?;
            }
        }
        if actions.contains(&RebootAction::Automatic) {
            self.reboot_system()?;
        }
        Ok(())
    }

    fn restore(&self, state: &StandaloneState) -> Vec<Installer> {
        state
            .payload_types
            .iter()
            .enumerate()
            .map(|(index, payload_type)| self.backends.restore_installer(payload_type, index))
            .collect()
    }

    fn commit(&self) -> Result<(), CtrlError> {
        let state = self
            .state
            .load()
            .map_err(CtrlError::State)?
            .ok_or(CtrlError::NoUpdate)?;
        let mut installers = self.restore(&state);
        for installer in &mut installers {
            installer.commit_update()?;
        }
        self.artifact_info
            .write(&state.artifact_name, state.artifact_group.as_deref())
            .map_err(CtrlError::ArtifactInfo)?;
        cleanup(&mut installers);
        self.state.remove().map_err(CtrlError::State)?;
        info!(artifact = %state.artifact_name, "committed update");
        Ok(())
    }

    fn rollback(&self) -> Result<(), CtrlError> {
        let state = self
            .state
            .load()
            .map_err(CtrlError::State)?
            .ok_or(CtrlError::NoUpdate)?;
        let mut installers = self.restore(&state);
        for installer in &mut installers {
            if !installer.supports_rollback()? {
                return Err(CtrlError::NoRollback(installer.payload_type().to_owned()));
            }
        }
        for installer in &mut installers {
            installer.rollback()?;
        }
        cleanup(&mut installers);
        self.state.remove().map_err(CtrlError::State)?;
        info!(artifact = %state.artifact_name, "rolled back update");
        Ok(())
    }

    fn reboot_system(&self) -> Result<(), CtrlError> {
        Ok(dual_rootfs::reboot_system(self.runner.as_ref())?)
    }
}

/// Undo a failed installation as far as possible.
fn abort(installers: &mut [Installer], installed: bool) {
    for installer in installers.iter_mut() {
        if installed && matches!(installer.supports_rollback(), Ok(true)) {
            if let Err(error) = installer.rollback() {
                error!("rollback failed: {error}");
            }
        }
        if let Err(error) = installer.failure() {
            error!("failure handling failed: {error}");
        }
    }
    cleanup(installers);
}

fn cleanup(installers: &mut [Installer]) {
    for installer in installers {
        if let Err(error) = installer.cleanup() {
            error!(payload_type = installer.payload_type(), "cleanup failed: {error}");
        }
    }
}
