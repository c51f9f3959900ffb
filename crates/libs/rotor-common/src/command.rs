//! Running external programs.

use std::error::Error;
use std::fmt;
use std::io;

use tracing::debug;
use xscript::{cmd, Out, ParentEnv, Run};

/// Output of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code of the command, `None` if it was terminated by a signal.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given standard output.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and standard error.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Check whether the command exited with status zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs external programs and collects their output.
pub trait CommandRunner: Send + Sync + fmt::Debug {
    /// Run `program` with `args` and wait for it to exit.
    ///
    /// If `stdin` is given, it is piped into the program. Fails with
    /// [`io::ErrorKind::NotFound`] if the program does not exist.
    fn run(&self, program: &str, args: &[&str], stdin: Option<&str>) -> io::Result<CommandOutput>;
}

/// [`CommandRunner`] spawning actual processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&str], stdin: Option<&str>) -> io::Result<CommandOutput> {
        debug!(program, ?args, "running command");
        let mut cmd = cmd!(program);
        cmd.extend_args(args);
        let mut cmd = cmd
            .with_stdout(Out::Capture)
            .with_stderr(Out::Capture)
            .allow_failures();
        if let Some(input) = stdin {
            cmd = cmd.with_stdin(input.to_owned());
        }
        let output = ParentEnv.run(cmd).map_err(|error| {
            // Keep the kind so that callers can tell missing programs apart.
            let kind = error
                .source()
                .and_then(|source| source.downcast_ref::<io::Error>())
                .map(io::Error::kind)
                .unwrap_or(io::ErrorKind::Other);
            io::Error::new(kind, error.to_string())
        })?;
        Ok(CommandOutput {
            code: output.code,
            stdout: lossy(output.stdout),
            stderr: lossy(output.stderr),
        })
    }
}

fn lossy(bytes: Option<Vec<u8>>) -> String {
    bytes
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_with_stdin() {
        let output = SystemCommandRunner
            .run("cat", &[], Some("hello\n"))
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "hello\n");
    }

    #[test]
    fn test_missing_program() {
        let error = SystemCommandRunner
            .run("rotor-this-program-does-not-exist", &[], None)
            .unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_exit_code() {
        let output = SystemCommandRunner
            .run("sh", &["-c", "echo oops >&2; exit 3"], None)
            .unwrap();
        assert!(!output.success());
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stderr, "oops\n");
    }
}
