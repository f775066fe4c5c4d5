//! Offline-mode login over the game protocol.
//!
//! Performs the handshake and login sequence, then hands the socket to a
//! reader task that answers keep-alives and surfaces chat and disconnect
//! packets as [`ConnectionEvent`]s. Compressed packets are skipped; every
//! packet this client cares about is small enough to be sent uncompressed
//! under the usual threshold.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::connection::{ConnectError, Connection, ConnectionEvent, Connector};
use super::DisconnectReason;
use crate::config::{PlayPackets, PresenceClientOptions};
use crate::probe::codec::{read_frame, write_frame, CodecError, PacketBuilder, PacketReader};
use crate::probe::status::flatten_chat;

const LOGIN_DISCONNECT: i32 = 0x00;
const LOGIN_ENCRYPTION_REQUEST: i32 = 0x01;
const LOGIN_SUCCESS: i32 = 0x02;
const LOGIN_SET_COMPRESSION: i32 = 0x03;
const LOGIN_PLUGIN_REQUEST: i32 = 0x04;
const LOGIN_PLUGIN_RESPONSE: i32 = 0x02;

/// Longest chat line the server accepts.
const MAX_CHAT_CHARS: usize = 256;

/// Connector that joins a server with an offline-mode login.
#[derive(Debug, Clone, Copy)]
pub struct LoginConnector {
    timeout: Duration,
}

impl LoginConnector {
    /// `timeout` bounds the TCP connect plus the login exchange.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for LoginConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for LoginConnector {
    async fn connect(
        &self,
        options: &PresenceClientOptions,
    ) -> Result<Box<dyn Connection>, ConnectError> {
        options.validate()?;
        let millis = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        let connection = tokio::time::timeout(self.timeout, login(options))
            .await
            .map_err(|_| ConnectError::Timeout(millis))??;
        Ok(Box::new(connection))
    }
}

async fn login(options: &PresenceClientOptions) -> Result<LoginConnection, ConnectError> {
    let stream = TcpStream::connect((options.host.as_str(), options.port)).await?;
    stream.set_nodelay(true)?;
    let (mut read, mut write) = stream.into_split();

    let handshake = PacketBuilder::new(0x00)
        .varint(options.protocol_version)
        .string(&options.host)
        .u16(options.port)
        .varint(2)
        .finish(false);
    write_frame(&mut write, &handshake).await?;
    let login_start = PacketBuilder::new(0x00)
        .string(options.authentication.login_name())
        .finish(false);
    write_frame(&mut write, &login_start).await?;

    let mut compressed = false;
    loop {
        let frame = read_frame(&mut read).await?;
        let Some(body) = packet_body(&frame, compressed)? else {
            continue;
        };
        let mut packet = PacketReader::new(body);
        match packet.varint()? {
            LOGIN_DISCONNECT => {
                let reason = packet.string().map(|raw| chat_text(&raw))?;
                return Err(ConnectError::Kicked(reason));
            }
            LOGIN_ENCRYPTION_REQUEST => return Err(ConnectError::OnlineModeUnsupported),
            LOGIN_SUCCESS => break,
            LOGIN_SET_COMPRESSION => {
                compressed = packet.varint()? >= 0;
                tracing::debug!(compressed, "Server set compression");
            }
            LOGIN_PLUGIN_REQUEST => {
                // Answer "not understood" so the login can continue.
                let message_id = packet.varint()?;
                let reply = PacketBuilder::new(LOGIN_PLUGIN_RESPONSE)
                    .varint(message_id)
                    .bytes(&[0])
                    .finish(compressed);
                write_frame(&mut write, &reply).await?;
            }
            other => {
                return Err(ConnectError::Protocol(format!(
                    "unexpected login packet 0x{other:02X}"
                )));
            }
        }
    }

    tracing::info!(
        address = %options.address(),
        name = options.authentication.login_name(),
        "Joined server"
    );

    let writer = Arc::new(Mutex::new(write));
    let (tx, events) = mpsc::channel(64);
    let reader = tokio::spawn(read_play(
        read,
        Arc::clone(&writer),
        compressed,
        options.packets,
        tx,
    ));
    Ok(LoginConnection {
        events,
        writer,
        compressed,
        packets: options.packets,
        reader,
    })
}

/// Strip the compression header; `None` for packets that really are compressed.
fn packet_body(frame: &[u8], compressed: bool) -> Result<Option<&[u8]>, CodecError> {
    if !compressed {
        return Ok(Some(frame));
    }
    let mut reader = PacketReader::new(frame);
    if reader.varint()? == 0 {
        Ok(Some(reader.remaining()))
    } else {
        Ok(None)
    }
}

fn chat_text(raw: &str) -> String {
    serde_json::from_str::<Value>(raw).map_or_else(|_| raw.to_string(), |v| flatten_chat(&v))
}

async fn read_play(
    mut read: OwnedReadHalf,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    compressed: bool,
    packets: PlayPackets,
    tx: mpsc::Sender<ConnectionEvent>,
) {
    let reason = loop {
        let frame = match read_frame(&mut read).await {
            Ok(frame) => frame,
            Err(CodecError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break DisconnectReason::RemoteError("connection closed by server".to_string());
            }
            Err(e) => break DisconnectReason::RemoteError(e.to_string()),
        };
        let body = match packet_body(&frame, compressed) {
            Ok(Some(body)) => body,
            Ok(None) => continue,
            Err(e) => break DisconnectReason::RemoteError(e.to_string()),
        };
        let mut packet = PacketReader::new(body);
        let Ok(id) = packet.varint() else { continue };

        if id == packets.keep_alive_clientbound {
            let Ok(token) = packet.i64() else { continue };
            let reply = PacketBuilder::new(packets.keep_alive_serverbound)
                .i64(token)
                .finish(compressed);
            let mut writer = writer.lock().await;
            if let Err(e) = write_frame(&mut *writer, &reply).await {
                break DisconnectReason::RemoteError(e.to_string());
            }
        } else if id == packets.chat_clientbound {
            let Ok(raw) = packet.string() else { continue };
            if tx.send(ConnectionEvent::Chat(chat_text(&raw))).await.is_err() {
                return;
            }
        } else if id == packets.disconnect_clientbound {
            let detail = packet.string().map(|raw| chat_text(&raw)).unwrap_or_default();
            break DisconnectReason::RemoteKick(detail);
        }
    };
    tracing::debug!(%reason, "Connection reader finished");
    let _ = tx.send(ConnectionEvent::Ended(reason)).await;
}

/// Live play-state connection.
struct LoginConnection {
    events: mpsc::Receiver<ConnectionEvent>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    compressed: bool,
    packets: PlayPackets,
    reader: JoinHandle<()>,
}

#[async_trait]
impl Connection for LoginConnection {
    async fn next_event(&mut self) -> ConnectionEvent {
        match self.events.recv().await {
            Some(event) => event,
            None => ConnectionEvent::Ended(DisconnectReason::Unknown(
                "connection reader stopped".to_string(),
            )),
        }
    }

    async fn send_chat(&mut self, message: &str) -> Result<(), ConnectError> {
        if self.reader.is_finished() {
            return Err(ConnectError::Closed);
        }
        let message: String = message.chars().take(MAX_CHAT_CHARS).collect();
        let packet = PacketBuilder::new(self.packets.chat_serverbound)
            .string(&message)
            .finish(self.compressed);
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &packet).await?;
        Ok(())
    }

    async fn close(&mut self) {
        self.reader.abort();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(error = %e, "Socket shutdown failed");
        }
    }
}

impl Drop for LoginConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
