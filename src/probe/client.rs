//! Status query client.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::codec::{read_frame, write_frame, CodecError, PacketBuilder, PacketReader};
use super::status::{normalize, parse_legacy, PingResult};
use super::ProbeError;
use crate::config::DEFAULT_PROTOCOL_VERSION;

/// Source of participant counts for a remote server.
///
/// The presence client depends on this trait rather than on the network so
/// that occupancy decisions can be driven by a stub.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Query `host:port`, never taking longer than `timeout`.
    async fn ping(&self, host: &str, port: u16, timeout: Duration)
        -> Result<PingResult, ProbeError>;
}

/// Probe speaking the server's native status protocol over TCP.
#[derive(Debug, Clone, Copy)]
pub struct ServerProbe {
    protocol_version: i32,
}

impl ServerProbe {
    #[must_use]
    pub fn new(protocol_version: i32) -> Self {
        Self { protocol_version }
    }
}

impl Default for ServerProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROTOCOL_VERSION)
    }
}

#[async_trait]
impl Probe for ServerProbe {
    async fn ping(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<PingResult, ProbeError> {
        ping_server(host, port, self.protocol_version, timeout).await
    }
}

/// Query a server, falling back to the legacy query when the modern one is
/// not understood.
///
/// # Errors
///
/// - [`ProbeError::Timeout`] if the whole exchange exceeds `timeout`
/// - [`ProbeError::Unreachable`] if the TCP connection fails
/// - [`ProbeError::Protocol`] / [`ProbeError::InvalidResponse`] on malformed replies
pub async fn ping_server(
    host: &str,
    port: u16,
    protocol_version: i32,
    timeout: Duration,
) -> Result<PingResult, ProbeError> {
    // Safe: timeout values are never going to exceed u64::MAX milliseconds
    #[allow(clippy::cast_possible_truncation)]
    let timeout_ms = timeout.as_millis() as u64;

    let exchange = async {
        let raw = match query_modern(host, port, protocol_version).await {
            Ok(raw) => raw,
            Err(ProbeError::Protocol(reason)) => {
                tracing::debug!(host, port, %reason, "Modern status query failed, trying legacy");
                query_legacy(host, port).await?
            }
            Err(e) => return Err(e),
        };
        normalize(&raw)
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| ProbeError::Timeout(timeout_ms))?
}

async fn connect(host: &str, port: u16) -> Result<TcpStream, ProbeError> {
    TcpStream::connect((host, port))
        .await
        .map_err(ProbeError::Unreachable)
}

async fn query_modern(host: &str, port: u16, protocol_version: i32) -> Result<Value, ProbeError> {
    let mut stream = connect(host, port).await?;

    let handshake = PacketBuilder::new(0x00)
        .varint(protocol_version)
        .string(host)
        .u16(port)
        .varint(1)
        .finish(false);
    write_frame(&mut stream, &handshake).await?;
    write_frame(&mut stream, &PacketBuilder::new(0x00).finish(false)).await?;

    let body = read_frame(&mut stream).await?;
    let mut reader = PacketReader::new(&body);
    let id = reader.varint()?;
    if id != 0x00 {
        return Err(ProbeError::Protocol(format!(
            "expected status response, got packet {id:#04x}"
        )));
    }
    let json = reader.string()?;
    let mut raw: Value = serde_json::from_str(&json)
        .map_err(|e| ProbeError::Protocol(format!("status is not JSON: {e}")))?;

    match measure_latency(&mut stream).await {
        Ok(latency) => {
            if let Value::Object(map) = &mut raw {
                #[allow(clippy::cast_possible_truncation)]
                map.insert("latency".to_string(), Value::from(latency.as_millis() as u64));
            }
        }
        Err(e) => tracing::debug!(host, port, error = %e, "Server did not answer ping"),
    }

    Ok(raw)
}

async fn measure_latency(stream: &mut TcpStream) -> Result<Duration, ProbeError> {
    let payload = chrono::Utc::now().timestamp_millis();
    let started = Instant::now();
    write_frame(stream, &PacketBuilder::new(0x01).i64(payload).finish(false)).await?;

    let body = read_frame(stream).await?;
    let mut reader = PacketReader::new(&body);
    if reader.varint()? != 0x01 || reader.i64()? != payload {
        return Err(ProbeError::Protocol("unexpected pong".to_string()));
    }
    Ok(started.elapsed())
}

async fn query_legacy(host: &str, port: u16) -> Result<Value, ProbeError> {
    let mut stream = connect(host, port).await?;
    stream.write_all(&[0xFE, 0x01]).await.map_err(CodecError::from)?;
    stream.flush().await.map_err(CodecError::from)?;

    let kind = stream.read_u8().await.map_err(CodecError::from)?;
    if kind != 0xFF {
        return Err(ProbeError::Protocol(format!(
            "expected legacy kick packet, got {kind:#04x}"
        )));
    }
    let chars = stream.read_u16().await.map_err(CodecError::from)?;
    let mut bytes = vec![0u8; usize::from(chars) * 2];
    stream.read_exact(&mut bytes).await.map_err(CodecError::from)?;

    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    let payload = String::from_utf16(&units)
        .map_err(|_| ProbeError::Protocol("legacy payload is not UTF-16".to_string()))?;
    parse_legacy(&payload)
}
