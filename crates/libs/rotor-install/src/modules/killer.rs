//! Timeout enforcement for update module processes.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{RecvTimeoutError, Sender};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tracing::{debug, error};

/// Grace period between `SIGTERM` and `SIGKILL`.
pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Terminates a process group once a timeout expires.
///
/// The process must have been started in its own process group, otherwise the
/// group of the caller is killed.
#[derive(Debug)]
pub(crate) struct ProcessKiller {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ProcessKiller {
    /// Send `SIGTERM` after `timeout` and `SIGKILL` after another `grace_period`.
    pub fn start(pid: u32, timeout: Duration, grace_period: Duration) -> Self {
        let Ok(raw_pid) = i32::try_from(pid) else {
            error!(pid, "invalid process id, timeout is not enforced");
            return Self {
                stop: None,
                thread: None,
            };
        };
        let group = Pid::from_raw(raw_pid);
        let (stop, stopped) = flume::bounded::<()>(1);
        let thread = thread::Builder::new()
            .name("module-killer".to_owned())
            .spawn(move || {
                if !matches!(stopped.recv_timeout(timeout), Err(RecvTimeoutError::Timeout)) {
                    return;
                }
                error!(pid, "update module timed out, sending SIGTERM");
                // The group may already be gone.
                let _ = killpg(group, Signal::SIGTERM);
                if !matches!(
                    stopped.recv_timeout(grace_period),
                    Err(RecvTimeoutError::Timeout)
                ) {
                    return;
                }
                error!(pid, "update module timed out, sending SIGKILL");
                let _ = killpg(group, Signal::SIGKILL);
            });
        let thread = match thread {
            Ok(thread) => Some(thread),
            Err(error) => {
                error!(pid, "unable to start timeout thread: {error}");
                None
            }
        };
        Self {
            stop: Some(stop),
            thread,
        }
    }

    /// Cancel the timeout.
    pub fn stop(&mut self) {
        // Disconnecting wakes up the thread.
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                debug!("timeout thread panicked");
            }
        }
    }
}

impl Drop for ProcessKiller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::CommandExt;
    use std::os::unix::process::ExitStatusExt;
    use std::process::Command;
    use std::time::Instant;

    use super::*;

    #[test]
    fn test_kills_process_group() {
        let mut child = Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let start = Instant::now();
        let _killer = ProcessKiller::start(
            child.id(),
            Duration::from_millis(100),
            Duration::from_secs(10),
        );
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_escalates_to_sigkill() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .process_group(0)
            .spawn()
            .unwrap();
        let _killer = ProcessKiller::start(
            child.id(),
            Duration::from_millis(100),
            Duration::from_millis(200),
        );
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[test]
    fn test_stop_cancels_timeout() {
        let mut child = Command::new("sleep")
            .arg("0.3")
            .process_group(0)
            .spawn()
            .unwrap();
        let mut killer =
            ProcessKiller::start(child.id(), Duration::from_millis(50), KILL_GRACE_PERIOD);
        killer.stop();
        assert!(child.wait().unwrap().success());
    }
}
