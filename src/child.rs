//! One spawned generation of the supervised child process.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

/// Errors that can occur while starting a child generation.
#[derive(Debug)]
pub enum SpawnError {
    /// Failed to spawn the child process.
    Spawn { source: std::io::Error },
    /// The piped stdout/stderr handles were not available after spawn.
    StreamCapture,
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::Spawn { source } => {
                write!(f, "failed to spawn child process: {}", source)
            }
            SpawnError::StreamCapture => {
                write!(f, "child output streams were not captured")
            }
        }
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpawnError::Spawn { source } => Some(source),
            SpawnError::StreamCapture => None,
        }
    }
}

/// Handle to one running child generation.
///
/// The child is spawned into its own process group (via `process_group(0)`)
/// so termination signals reach the whole tree, not just the immediate
/// process. Stdin is nulled: the child runs in a non-foreground group where
/// reading the terminal would stop it with SIGTTIN.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    pid: u32,
}

impl ChildProcess {
    /// Spawn `command` with `args`, stdout and stderr piped.
    pub fn spawn(command: &str, args: &[String]) -> Result<ChildProcess, SpawnError> {
        let child = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0) // New process group for clean kill
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SpawnError::Spawn { source: e })?;
        let pid = child.id().unwrap_or(0);
        Ok(ChildProcess { child, pid })
    }

    /// Pid of the spawned process, which is also its process group id.
    pub fn id(&self) -> u32 {
        self.pid
    }

    /// Take the piped output streams for the reader pumps. Valid exactly once.
    pub fn take_streams(&mut self) -> Result<(ChildStdout, ChildStderr), SpawnError> {
        let stdout = self.child.stdout.take().ok_or(SpawnError::StreamCapture)?;
        let stderr = self.child.stderr.take().ok_or(SpawnError::StreamCapture)?;
        Ok((stdout, stderr))
    }

    /// Ask the child's process group to exit (SIGTERM). This is a request,
    /// not forced destruction; a group that is already gone is not an error.
    pub fn terminate(&self) {
        self.signal_group(Signal::SIGTERM);
    }

    /// Force the child's process group down (SIGKILL).
    pub fn force_kill(&self) {
        self.signal_group(Signal::SIGKILL);
    }

    fn signal_group(&self, signal: Signal) {
        if self.pid == 0 {
            return;
        }
        match killpg(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                tracing::warn!(
                    pid = self.pid,
                    signal = ?signal,
                    error = %e,
                    "failed to signal child process group"
                );
            }
        }
    }

    /// Wait for the child to exit and collect its status, releasing all
    /// process state (no zombie left behind).
    pub async fn reap(mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }
}
