//! Operator control messages.
//!
//! One request and one response per connection, each a single JSON line.

use serde::{Deserialize, Serialize};

/// Request from an operator tool to the running supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdminRequest {
    /// Stop the presence client without an automatic reconnect.
    Disconnect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Reconnect the presence client after its configured delay.
    Reconnect,
    /// Send a chat line through the presence client.
    Chat { message: String },
    /// Fetch recent child output.
    Logs,
}

/// Response from the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdminResponse {
    /// The command was relayed to the child.
    Ok,
    /// Recent child output, oldest first.
    Logs { lines: Vec<String> },
    /// The request could not be carried out.
    Error { message: String },
}

/// Errors that can occur on the control socket.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Failed to connect to the supervisor socket.
    #[error("Failed to connect to supervisor: {0}")]
    ConnectionFailed(#[from] std::io::Error),

    /// The supervisor socket does not exist.
    #[error("Supervisor not running (socket not found)")]
    SupervisorNotRunning,

    /// The operation timed out.
    #[error("Control request timed out after {0}ms")]
    Timeout(u64),

    /// Failed to serialize or deserialize a message.
    #[error("Failed to serialize message: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The supervisor closed the connection without answering.
    #[error("Invalid response from supervisor")]
    InvalidResponse,
}
