//! Remote status probe.
//!
//! Issues a single status query against a game server and normalizes the
//! answer (participant count, status line, round-trip latency). Used by the
//! presence client's occupancy policy and by the `ping` command.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use hidden_player::probe::{Probe, ServerProbe};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let probe = ServerProbe::default();
//! let status = probe.ping("mc.example.org", 25565, Duration::from_secs(5)).await?;
//! println!("{}", status.status_line());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod status;

pub use client::{ping_server, Probe, ServerProbe};
pub use codec::CodecError;
pub use status::{is_modern, normalize, PingResult};

/// Errors that can occur while probing a server.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// The query did not complete in time.
    #[error("Status query timed out after {0}ms")]
    Timeout(u64),

    /// The TCP connection could not be established.
    #[error("Server unreachable: {0}")]
    Unreachable(#[source] std::io::Error),

    /// The server spoke something other than the status protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The reply was well-formed but lacked required fields.
    #[error("Invalid status response: {0}")]
    InvalidResponse(String),
}

impl From<CodecError> for ProbeError {
    fn from(err: CodecError) -> Self {
        Self::Protocol(err.to_string())
    }
}
