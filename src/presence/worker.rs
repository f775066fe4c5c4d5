//! Child-side command loop.
//!
//! Reads [`Command`]s from the supervisor, applies them to a
//! [`PresenceClient`] and streams its lifecycle [`Event`]s back.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use super::{Connector, PresenceClient};
use crate::config::PresenceClientOptions;
use crate::ipc::{spawn_writer, Command, Event, Incoming, IpcReader};
use crate::probe::Probe;

/// How long queued events may take to flush after the loop ends.
const FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Why the command loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The supervisor sent `exit`.
    Requested,
    /// The command stream closed, usually because the supervisor died.
    InputClosed,
}

/// Run the command loop until `exit` or end of input.
pub async fn serve<R, W>(
    options: PresenceClientOptions,
    connector: Arc<dyn Connector>,
    probe: Arc<dyn Probe>,
    input: R,
    output: W,
) -> WorkerExit
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (events, writer) = spawn_writer::<_, Event>(output);
    let client = PresenceClient::new(options, connector, probe, Arc::new(events));
    tracing::info!(client = %client.id(), address = %client.options().address(), "Presence worker started");

    let mut commands = IpcReader::<_, Command>::new(input);
    let exit = loop {
        match commands.next().await {
            Some(Incoming::Message(command)) => {
                if dispatch(&client, command).await.is_break() {
                    break WorkerExit::Requested;
                }
            }
            Some(Incoming::Raw(line)) => tracing::warn!(%line, "Ignoring malformed command"),
            None => break WorkerExit::InputClosed,
        }
    };

    client.shutdown().await;
    drop(client);
    if tokio::time::timeout(FLUSH_TIMEOUT, writer).await.is_err() {
        tracing::debug!("Event writer still busy at exit");
    }
    tracing::info!(?exit, "Presence worker stopped");
    exit
}

async fn dispatch(client: &PresenceClient, command: Command) -> ControlFlow<()> {
    tracing::debug!(?command, "Command received");
    let result = match command {
        Command::Login => client.begin_connect().map(|attempt| {
            tokio::spawn(async move {
                if let Err(e) = attempt.await {
                    tracing::warn!(error = %e, "Login failed");
                }
            });
        }),
        Command::Reconnect => client.reconnect(),
        Command::Disconnect { reason } => {
            if let Some(reason) = &reason {
                tracing::info!(%reason, "Disconnect requested");
            }
            client.disconnect().await
        }
        Command::Chat { message } => client.chat(message),
        Command::Exit => return ControlFlow::Break(()),
    };
    if let Err(e) = result {
        tracing::warn!(error = %e, "Command rejected");
    }
    ControlFlow::Continue(())
}
