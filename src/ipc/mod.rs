//! IPC between the supervisor and the presence child.
//!
//! # Architecture
//!
//! ```text
//! Supervisor (parent)                 Presence child
//!     |                                   |
//!     |-- Command (child stdin) --------->|
//!     |                                   | (state machine)
//!     |<-------- Event (child stdout) ----|
//!     |                                   |
//! ```
//!
//! # Protocol
//!
//! One JSON object per line, tagged with `type` and carrying an envelope
//! version `v`. Messages are fire-and-forget: there are no correlation ids,
//! and confirmation arrives only as a later lifecycle event. Order is
//! preserved per direction.

pub mod channel;
pub mod types;

pub use channel::{spawn_writer, Incoming, IpcReader, IpcSender};
pub use types::{decode_line, encode_line, Command, Event, IpcError, IPC_VERSION};
