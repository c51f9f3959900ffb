//! Access to the bootloader environment.
//!
//! The environment is read and written through external tools following the
//! `fw_printenv`/`fw_setenv` conventions. Writes are passed as a script on stdin
//! (`-s -`) so that the tool applies all variables in a single update.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::command::{CommandOutput, CommandRunner, SystemCommandRunner};

/// Number of the partition the bootloader boots.
pub const BOOT_PART: &str = "mender_boot_part";
/// Number of the partition the bootloader boots, in upper-case hexadecimal.
pub const BOOT_PART_HEX: &str = "mender_boot_part_hex";
/// Flag indicating that an update awaits verification (`"1"`) or not (`"0"`).
pub const UPGRADE_AVAILABLE: &str = "upgrade_available";
/// Boot attempt counter maintained by the bootloader.
pub const BOOT_COUNT: &str = "bootcount";
/// If set to `"1"`, [`SAVEENV_CANARY`] must be set to `"1"` as well.
pub const CHECK_SAVEENV_CANARY: &str = "mender_check_saveenv_canary";
/// Written by the bootloader to prove that its environment is writable.
pub const SAVEENV_CANARY: &str = "mender_saveenv_canary";

/// Variable used for probing the separator understood by the set tool.
const SEPARATOR_PROBE: &str = "mender_env_separator_probe";

/// Bootloader variables.
pub type BootVars = BTreeMap<String, String>;

/// Error accessing the bootloader environment.
#[derive(Debug, Error)]
pub enum BootEnvError {
    #[error("no boot environment tool found (tried {tried})")]
    CommandNotFound { tried: String },
    #[error("access to the boot environment requires root privileges")]
    Privilege(#[source] Box<BootEnvError>),
    #[error(
        "failed `mender_saveenv_canary` check ({reason}), the bootloader environment is \
        misconfigured: either the environment location used by the bootloader does not \
        match the tool configuration or the bootloader does not save its environment"
    )]
    Canary { reason: String },
    #[error("invalid boot environment variable or error: {line:?}")]
    Malformed { line: String },
    #[error("`{program}` failed with exit code {code:?}: {stderr}")]
    ToolFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("unable to run `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Reads and writes bootloader variables.
pub trait BootEnv: Send + Sync + fmt::Debug {
    /// Read the given variables.
    ///
    /// Variables which are not set are absent from the result.
    fn read_env(&self, names: &[&str]) -> Result<BootVars, BootEnvError>;

    /// Write the given variables in a single update.
    fn write_env(&self, vars: &BootVars) -> Result<(), BootEnvError>;
}

impl<T: BootEnv + ?Sized> BootEnv for Arc<T> {
    fn read_env(&self, names: &[&str]) -> Result<BootVars, BootEnvError> {
        (**self).read_env(names)
    }

    fn write_env(&self, vars: &BootVars) -> Result<(), BootEnvError> {
        (**self).write_env(vars)
    }
}

/// Pair of tools for printing and setting variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvTools {
    pub print: String,
    pub set: String,
}

impl EnvTools {
    pub fn new(print: impl Into<String>, set: impl Into<String>) -> Self {
        Self {
            print: print.into(),
            set: set.into(),
        }
    }

    /// Tools tried by default, in order.
    pub fn defaults() -> Vec<EnvTools> {
        vec![
            EnvTools::new("grub-mender-grubenv-print", "grub-mender-grubenv-set"),
            EnvTools::new("fw_printenv", "fw_setenv"),
        ]
    }
}

/// Separator between name and value in set scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Separator {
    Space,
    Equals,
}

impl Separator {
    fn as_str(self) -> &'static str {
        match self {
            Separator::Space => " ",
            Separator::Equals => "=",
        }
    }
}

/// Boot environment accessed through external tools.
pub struct ToolBootEnv {
    runner: Arc<dyn CommandRunner>,
    candidates: Vec<EnvTools>,
    privileged: bool,
    /// Index of the first candidate which could be started.
    resolved: OnceLock<usize>,
    separator: OnceLock<Separator>,
}

impl ToolBootEnv {
    /// Boot environment using the default tools and the effective user of the process.
    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemCommandRunner), EnvTools::defaults())
            .with_privileged(nix::unistd::geteuid().is_root())
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>, candidates: Vec<EnvTools>) -> Self {
        Self {
            runner,
            candidates,
            privileged: true,
            resolved: OnceLock::new(),
            separator: OnceLock::new(),
        }
    }

    /// Set whether the caller has the privileges required to access the environment.
    ///
    /// Errors of unprivileged callers are reported as [`BootEnvError::Privilege`].
    pub fn with_privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    fn run_tool(
        &self,
        select: fn(&EnvTools) -> &str,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<(String, CommandOutput), BootEnvError> {
        if let Some(idx) = self.resolved.get() {
            let program = select(&self.candidates[*idx]);
            return self
                .runner
                .run(program, args, stdin)
                .map(|output| (program.to_owned(), output))
                .map_err(|source| BootEnvError::Spawn {
                    program: program.to_owned(),
                    source,
                });
        }
        for (idx, tools) in self.candidates.iter().enumerate() {
            let program = select(tools);
            match self.runner.run(program, args, stdin) {
                Ok(output) => {
                    debug!(program, "using boot environment tools");
                    let _ = self.resolved.set(idx);
                    return Ok((program.to_owned(), output));
                }
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    debug!(program, "boot environment tool not found");
                }
                Err(source) => {
                    return Err(BootEnvError::Spawn {
                        program: program.to_owned(),
                        source,
                    })
                }
            }
        }
        Err(BootEnvError::CommandNotFound {
            tried: self
                .candidates
                .iter()
                .map(|tools| format!("`{}`", select(tools)))
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    /// Read variables without checking the canary.
    fn read_raw(&self, names: &[&str]) -> Result<BootVars, BootEnvError> {
        let (program, output) = self.run_tool(|tools| tools.print.as_str(), names, None)?;
        if !output.success() {
            return Err(BootEnvError::ToolFailed {
                program,
                code: output.code,
                stderr: output.stderr.trim().to_owned(),
            });
        }
        parse_env_output(&output.stdout)
    }

    fn write_raw(&self, script: &str) -> Result<(), BootEnvError> {
        let (program, output) =
            self.run_tool(|tools| tools.set.as_str(), &["-s", "-"], Some(script))?;
        if !output.success() {
            error!(program, "boot environment tool returned failure");
            return Err(BootEnvError::ToolFailed {
                program,
                code: output.code,
                stderr: output.stderr.trim().to_owned(),
            });
        }
        Ok(())
    }

    fn check_canary(&self) -> Result<(), BootEnvError> {
        let vars = match self.read_raw(&[CHECK_SAVEENV_CANARY]) {
            Ok(vars) => vars,
            Err(error @ BootEnvError::CommandNotFound { .. }) => return Err(error),
            // The variable is not set, nothing to check.
            Err(_) => return Ok(()),
        };
        if vars.get(CHECK_SAVEENV_CANARY).map(String::as_str) != Some("1") {
            return Ok(());
        }
        match self.read_raw(&[SAVEENV_CANARY]) {
            Ok(vars) if vars.get(SAVEENV_CANARY).map(String::as_str) == Some("1") => Ok(()),
            Ok(_) => Err(BootEnvError::Canary {
                reason: format!("`{SAVEENV_CANARY}` is not set to 1"),
            }),
            Err(error) => Err(BootEnvError::Canary {
                reason: error.to_string(),
            }),
        }
    }

    /// Determine the separator understood by the set tool.
    ///
    /// Returns whether the probe variable was written and must be removed.
    fn separator(&self) -> Result<(Separator, bool), BootEnvError> {
        if let Some(separator) = self.separator.get() {
            return Ok((*separator, false));
        }
        let probed = match self.write_raw(&format!("{SEPARATOR_PROBE} 1\n")) {
            Ok(()) => matches!(
                self.read_raw(&[SEPARATOR_PROBE]),
                Ok(vars) if vars.get(SEPARATOR_PROBE).map(String::as_str) == Some("1")
            ),
            Err(error @ BootEnvError::CommandNotFound { .. }) => return Err(error),
            Err(_) => false,
        };
        let separator = if probed {
            Separator::Space
        } else {
            Separator::Equals
        };
        debug!(?separator, "probed boot environment separator");
        let _ = self.separator.set(separator);
        Ok((separator, true))
    }

    fn write_checked(&self, vars: &BootVars) -> Result<(), BootEnvError> {
        self.check_canary()?;
        let (separator, remove_probe) = self.separator()?;
        let separator = separator.as_str();
        let mut script = String::new();
        for (name, value) in vars {
            script.push_str(name);
            script.push_str(separator);
            script.push_str(value);
            script.push('\n');
        }
        if remove_probe {
            // An empty value deletes the variable.
            script.push_str(SEPARATOR_PROBE);
            script.push_str(separator);
            script.push('\n');
        }
        let written = self.write_raw(&script);
        if remove_probe && written.is_err() {
            let removal = format!("{SEPARATOR_PROBE}{separator}\n");
            if let Err(error) = self.write_raw(&removal) {
                warn!("unable to remove separator probe variable: {error}");
            }
        }
        written
    }

    fn map_privilege(&self, error: BootEnvError) -> BootEnvError {
        match error {
            BootEnvError::CommandNotFound { .. } => error,
            _ if !self.privileged => BootEnvError::Privilege(Box::new(error)),
            _ => error,
        }
    }
}

impl fmt::Debug for ToolBootEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolBootEnv")
            .field("candidates", &self.candidates)
            .field("privileged", &self.privileged)
            .finish_non_exhaustive()
    }
}

impl BootEnv for ToolBootEnv {
    fn read_env(&self, names: &[&str]) -> Result<BootVars, BootEnvError> {
        self.check_canary()
            .and_then(|()| self.read_raw(names))
            .map_err(|error| self.map_privilege(error))
    }

    fn write_env(&self, vars: &BootVars) -> Result<(), BootEnvError> {
        self.write_checked(vars)
            .map_err(|error| self.map_privilege(error))
    }
}

/// Boot environment held in memory.
#[derive(Debug, Default)]
pub struct MemoryBootEnv {
    vars: Mutex<BootVars>,
}

impl MemoryBootEnv {
    pub fn new<K: Into<String>, V: Into<String>>(vars: impl IntoIterator<Item = (K, V)>) -> Self {
        Self {
            vars: Mutex::new(
                vars.into_iter()
                    .map(|(name, value)| (name.into(), value.into()))
                    .collect(),
            ),
        }
    }

    /// Copy of all variables.
    pub fn vars(&self) -> BootVars {
        self.lock().clone()
    }

    /// Value of a single variable.
    pub fn get(&self, name: &str) -> Option<String> {
        self.lock().get(name).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, BootVars> {
        self.vars.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BootEnv for MemoryBootEnv {
    fn read_env(&self, names: &[&str]) -> Result<BootVars, BootEnvError> {
        let vars = self.lock();
        Ok(names
            .iter()
            .filter_map(|name| Some((name.to_string(), vars.get(*name)?.clone())))
            .collect())
    }

    /// Empty values remove variables, like `fw_setenv` does.
    fn write_env(&self, vars: &BootVars) -> Result<(), BootEnvError> {
        let mut current = self.lock();
        for (name, value) in vars {
            if value.is_empty() {
                current.remove(name);
            } else {
                current.insert(name.clone(), value.clone());
            }
        }
        Ok(())
    }
}

/// Parse the `name=value` lines printed by the print tool.
pub fn parse_env_output(output: &str) -> Result<BootVars, BootEnvError> {
    let mut vars = BootVars::new();
    for line in output.lines() {
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split('=');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), Some(value), None) => {
                vars.insert(name.to_owned(), value.to_owned());
            }
            _ => {
                error!("boot environment variable malformed or error occurred");
                return Err(BootEnvError::Malformed {
                    line: line.to_owned(),
                });
            }
        }
    }
    Ok(vars)
}
