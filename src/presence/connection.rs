//! Seam between the state machine and the remote protocol.

use async_trait::async_trait;

use super::DisconnectReason;
use crate::config::{ConfigError, PresenceClientOptions};
use crate::ipc::{Event, IpcSender};

/// Something that happened on a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A chat line from the remote server.
    Chat(String),
    /// The connection is over.
    Ended(DisconnectReason),
}

/// A live connection to the remote server, owned by exactly one client.
#[async_trait]
pub trait Connection: Send {
    /// Next event from the server. Must be cancel-safe.
    async fn next_event(&mut self) -> ConnectionEvent;

    /// Send a chat line.
    async fn send_chat(&mut self, message: &str) -> Result<(), ConnectError>;

    /// Close the connection from our side.
    async fn close(&mut self);
}

/// Factory for connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a connection and complete the login.
    async fn connect(
        &self,
        options: &PresenceClientOptions,
    ) -> Result<Box<dyn Connection>, ConnectError>;
}

/// Receiver of lifecycle events emitted by the presence client.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

impl EventSink for IpcSender<Event> {
    fn emit(&self, event: Event) {
        if !self.send(event) {
            tracing::debug!("Supervisor channel closed, dropping event");
        }
    }
}

impl EventSink for tokio::sync::mpsc::UnboundedSender<Event> {
    fn emit(&self, event: Event) {
        let _ = self.send(event);
    }
}

/// Errors raised while establishing or using a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Invalid options: {0}")]
    InvalidOptions(#[from] ConfigError),

    #[error("Connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Kicked during login: {0}")]
    Kicked(String),

    #[error("Server requires online-mode session authentication")]
    OnlineModeUnsupported,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection is closed")]
    Closed,
}

impl ConnectError {
    /// How a failed attempt is classified for the reconnect policy.
    #[must_use]
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            Self::Kicked(detail) => DisconnectReason::RemoteKick(detail.clone()),
            other => DisconnectReason::RemoteError(other.to_string()),
        }
    }
}

impl From<crate::probe::CodecError> for ConnectError {
    fn from(err: crate::probe::CodecError) -> Self {
        match err {
            crate::probe::CodecError::Io(e) => Self::Io(e),
            other => Self::Protocol(other.to_string()),
        }
    }
}
