//! Hidden Player - supervised, occupancy-aware presence on a game server.
//!
//! A parent [`supervisor`] keeps one child process alive. The child runs the
//! [`presence`] state machine, which joins the remote server only while
//! nobody else is online, and talks to the parent over the [`ipc`] channel.
//! A [`watchdog`] thread restarts the whole parent when its network link
//! stalls.

pub mod config;
#[cfg(unix)]
pub mod control;
pub mod display;
pub mod ipc;
pub mod presence;
pub mod probe;
pub mod supervisor;
pub mod watchdog;
