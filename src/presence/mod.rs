//! Presence client.
//!
//! Keeps one hidden participant on a game server while nobody else is
//! there. The client joins, checks occupancy, and either stays (sending its
//! first messages) or leaves and waits for the server to empty out. Remote
//! kicks and errors are answered with a delayed reconnect when enabled.
//!
//! ```text
//! Disconnected --connect--> Connecting --joined--> OccupancyCheck --empty--> Active
//!      ^                        |                        |                     |
//!      |                        +--failed----------------+--notEmpty-----------+
//!      +---------------------------------------- Disconnecting <---------------+
//! ```
//!
//! The network side sits behind [`Connector`]; occupancy comes from a
//! [`Probe`](crate::probe::Probe). Both are injected so the state machine can
//! be driven without a server.

pub mod client;
pub mod connection;
pub mod login;
pub mod state;
pub mod worker;

pub use client::PresenceClient;
pub use connection::{ConnectError, Connection, ConnectionEvent, Connector, EventSink};
pub use login::LoginConnector;
pub use state::{DisconnectReason, FollowUp, PresenceState};
pub use worker::{serve, WorkerExit};

use crate::config::ConfigError;

/// Errors returned by presence client operations.
#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("Invalid presence options: {0}")]
    InvalidOptions(#[from] ConfigError),

    #[error("Presence client is already connected")]
    AlreadyConnected,

    #[error("Presence client is not connected")]
    NotConnected,

    #[error("Connect attempt cancelled by a disconnect")]
    Cancelled,

    #[error("Presence client has been shut down")]
    ShutDown,

    #[error("{0}")]
    Connect(#[from] ConnectError),
}
