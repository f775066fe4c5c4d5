//! Control socket client used by the `ctl` subcommand.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::{AdminRequest, AdminResponse, ControlError};
use crate::config::DEFAULT_CONTROL_SOCKET;

/// Default timeout for one request/response exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(4);

/// Client for the supervisor's control socket.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    #[must_use]
    pub fn new() -> Self {
        Self::with_path(DEFAULT_CONTROL_SOCKET)
    }

    #[must_use]
    pub fn with_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            socket_path: path.as_ref().to_path_buf(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Checks if the supervisor is running by verifying the socket file exists.
    #[must_use]
    pub fn is_supervisor_running(&self) -> bool {
        self.socket_path.exists()
    }

    /// Send one request and wait for the answer.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The supervisor is not running ([`ControlError::SupervisorNotRunning`])
    /// - The connection fails ([`ControlError::ConnectionFailed`])
    /// - The exchange times out ([`ControlError::Timeout`])
    /// - The supervisor hangs up without answering ([`ControlError::InvalidResponse`])
    pub async fn request(&self, request: &AdminRequest) -> Result<AdminResponse, ControlError> {
        if !self.is_supervisor_running() {
            return Err(ControlError::SupervisorNotRunning);
        }

        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);

        let result = tokio::time::timeout(self.timeout, async {
            let stream = UnixStream::connect(&self.socket_path).await?;
            let (reader, mut writer) = stream.into_split();

            let mut request_json = serde_json::to_string(request)?;
            request_json.push('\n');
            writer.write_all(request_json.as_bytes()).await?;
            writer.flush().await?;

            let mut reader = BufReader::new(reader);
            let mut response_line = String::new();
            let bytes_read = reader.read_line(&mut response_line).await?;
            if bytes_read == 0 {
                return Err(ControlError::InvalidResponse);
            }

            let response: AdminResponse = serde_json::from_str(response_line.trim())?;
            Ok(response)
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(ControlError::Timeout(timeout_ms)),
        }
    }
}

impl Default for ControlClient {
    fn default() -> Self {
        Self::new()
    }
}
