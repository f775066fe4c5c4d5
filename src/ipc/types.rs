//! IPC message types.
//!
//! This module defines the command vocabulary (supervisor → child) and the
//! event vocabulary (child → supervisor), plus the versioned envelope both
//! travel in.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Envelope version written on every line.
pub const IPC_VERSION: u32 = 1;

/// Command sent from the supervisor to the presence child.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Connect the presence client.
    Login,
    /// Stop and reconnect after the configured delay.
    Reconnect,
    /// Stop the presence client; no automatic reconnect follows.
    Disconnect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Send a chat line through the live connection.
    Chat { message: String },
    /// Exit the child process.
    Exit,
}

/// Event sent from the presence child to the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The client reached the active state.
    Ready,
    /// The connection ended.
    Disconnected { reason: String },
    /// A reconnect attempt is starting.
    Reconnecting,
    /// A chat line arrived from the remote server.
    ChatReceived { message: String },
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "Bot is ready"),
            Self::Disconnected { reason } => write!(f, "Bot disconnected: {reason}"),
            Self::Reconnecting => write!(f, "Bot is reconnecting"),
            Self::ChatReceived { message } => f.write_str(message),
        }
    }
}

fn current_version() -> u32 {
    IPC_VERSION
}

/// Wire envelope: `{"v":1,"type":...,...payload}`.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    #[serde(default = "current_version")]
    v: u32,
    #[serde(flatten)]
    body: T,
}

/// Serialize a message as one JSON line, newline included.
///
/// # Errors
///
/// Returns [`IpcError::Serialization`] if the message cannot be encoded.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, IpcError> {
    let mut line = serde_json::to_string(&Envelope {
        v: IPC_VERSION,
        body: message,
    })?;
    line.push('\n');
    Ok(line)
}

/// Parse one JSON line into a message.
///
/// # Errors
///
/// Returns [`IpcError::Serialization`] for malformed or unknown messages and
/// [`IpcError::UnsupportedVersion`] for envelopes from another version.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, IpcError> {
    let envelope: Envelope<T> = serde_json::from_str(line.trim())?;
    if envelope.v != IPC_VERSION {
        return Err(IpcError::UnsupportedVersion(envelope.v));
    }
    Ok(envelope.body)
}

/// Errors that can occur on the IPC channel.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// Failed to serialize or deserialize a message.
    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The peer speaks another envelope version.
    #[error("Unsupported IPC version {0}")]
    UnsupportedVersion(u32),

    /// The underlying stream failed.
    #[error("IPC stream error: {0}")]
    Io(#[from] std::io::Error),
}
