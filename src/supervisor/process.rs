//! Presence child process spawning and control.
//!
//! The child is the same binary running the `presence` subcommand. Its stdin
//! carries commands, its stdout carries events, and its stderr carries log
//! lines.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

/// Error type for process spawning operations.
#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    /// The binary was not found.
    #[error("Child binary not found: {0}")]
    NotFound(PathBuf),
    /// Permission denied when spawning.
    #[error("Permission denied spawning {0}")]
    PermissionDenied(PathBuf),
    /// A standard stream was not piped.
    #[error("Child {0} not available")]
    MissingPipe(&'static str),
    /// Other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpawnError {
    fn from_io(err: std::io::Error, program: &Path) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(program.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(program.to_path_buf()),
            _ => Self::Io(err),
        }
    }
}

/// What to run as the child.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    program: PathBuf,
    args: Vec<String>,
}

impl ChildSpec {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Spec for re-running the current executable.
    ///
    /// # Errors
    ///
    /// Returns an error if the executable path cannot be determined.
    pub fn current_exe() -> Result<Self, SpawnError> {
        Ok(Self::new(std::env::current_exe()?))
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }
}

/// A running presence child.
#[derive(Debug)]
pub struct PresenceProcess {
    child: Child,
}

impl PresenceProcess {
    /// Spawn the child with all three standard streams piped.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError` if the process fails to spawn.
    pub fn spawn(spec: &ChildSpec) -> Result<Self, SpawnError> {
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SpawnError::from_io(e, &spec.program))?;
        Ok(Self { child })
    }

    /// Take ownership of the three pipes. Only the first call succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::MissingPipe`] if a stream was already taken.
    pub fn take_pipes(&mut self) -> Result<(ChildStdin, ChildStdout, ChildStderr), SpawnError> {
        let stdin = self.child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = self.child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = self.child.stderr.take().ok_or(SpawnError::MissingPipe("stderr"))?;
        Ok((stdin, stdout, stderr))
    }

    /// Get the process ID, if still running.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the process to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting fails.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Forcefully kill the process and reap it.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be reaped.
    pub async fn kill(&mut self) -> std::io::Result<ExitStatus> {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "Kill signal not delivered");
        }
        self.child.wait().await
    }
}

/// Ask a process to stop.
///
/// On Unix this sends SIGTERM and returns `true`. Elsewhere there is no
/// graceful signal and `false` is returned so the caller can fall back to a
/// forced kill.
#[must_use]
pub fn request_terminate(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let nix_pid = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
        if let Err(e) = kill(nix_pid, Signal::SIGTERM) {
            tracing::debug!(pid, error = %e, "SIGTERM not delivered");
        }
        true
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_classified() {
        let spec = ChildSpec::new("/nonexistent/hidden-player-child");
        let err = PresenceProcess::spawn(&spec).unwrap_err();
        assert!(matches!(err, SpawnError::NotFound(_)));
    }

    #[tokio::test]
    async fn pipes_can_be_taken_once() {
        let spec = ChildSpec::new("sleep").args(["5"]);
        let mut process = PresenceProcess::spawn(&spec).unwrap();
        assert!(process.id().is_some());
        assert!(process.take_pipes().is_ok());
        assert!(matches!(
            process.take_pipes(),
            Err(SpawnError::MissingPipe("stdin"))
        ));
        process.kill().await.unwrap();
    }

    #[tokio::test]
    async fn sigterm_stops_a_cooperative_child() {
        let spec = ChildSpec::new("sleep").args(["30"]);
        let mut process = PresenceProcess::spawn(&spec).unwrap();
        let pid = process.id().unwrap();

        assert!(request_terminate(pid));
        let status = tokio::time::timeout(std::time::Duration::from_secs(5), process.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }
}
