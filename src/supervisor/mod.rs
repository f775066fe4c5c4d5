//! Process supervision for the presence child.
//!
//! The [`Supervisor`] owns at most one child process, relays commands to it
//! over stdin, records its output in a [`LogRingBuffer`] and restarts it
//! whenever it exits on its own.

mod process;
mod ring;
mod runner;

pub use process::{request_terminate, ChildSpec, PresenceProcess, SpawnError};
pub use ring::LogRingBuffer;
pub use runner::{Supervisor, SupervisorError, SupervisorEvent, Termination};
