//! JSON-line transport over a pair of byte streams.
//!
//! Sends are fire-and-forget: messages are queued to a writer task and
//! written in order. Once the peer is gone the queue closes and further
//! sends become no-ops.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::types::{decode_line, encode_line, IpcError};

/// Sending half of an IPC channel.
#[derive(Debug)]
pub struct IpcSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for IpcSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> IpcSender<T> {
    /// Queue a message; returns `false` if the peer has already gone away.
    pub fn send(&self, message: T) -> bool {
        self.tx.send(message).is_ok()
    }

    /// Whether the writer task has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn a writer task that serializes queued messages onto `writer`.
///
/// The task ends when every sender is dropped or a write fails.
pub fn spawn_writer<W, T>(writer: W) -> (IpcSender<T>, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
    T: Serialize + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<T>();
    let handle = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = rx.recv().await {
            let line = match encode_line(&message) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping unencodable IPC message");
                    continue;
                }
            };
            let written = async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            };
            if let Err(e) = written.await {
                tracing::debug!(error = %e, "IPC peer closed, stopping writer");
                break;
            }
        }
    });
    (IpcSender { tx }, handle)
}

/// One line read from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming<T> {
    /// A well-formed message.
    Message(T),
    /// Anything else the peer printed.
    Raw(String),
}

/// Receiving half of an IPC channel.
pub struct IpcReader<R, T> {
    lines: Lines<BufReader<R>>,
    _message: PhantomData<fn() -> T>,
}

impl<R, T> IpcReader<R, T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    #[must_use]
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            _message: PhantomData,
        }
    }

    /// Next line from the peer, or `None` once the stream ends.
    pub async fn next(&mut self) -> Option<Incoming<T>> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => return Some(Self::classify(line)),
                Ok(None) => return None,
                Err(e) => {
                    tracing::debug!(error = %IpcError::from(e), "IPC stream ended");
                    return None;
                }
            }
        }
    }

    fn classify(line: String) -> Incoming<T> {
        match decode_line(&line) {
            Ok(message) => Incoming::Message(message),
            Err(_) => Incoming::Raw(line),
        }
    }
}
