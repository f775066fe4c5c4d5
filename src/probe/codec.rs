//! Length-prefixed packet framing for the game server wire protocol.
//!
//! Every packet is `VarInt length | VarInt packet id | payload`. Once the
//! server enables compression the body becomes `VarInt data length | data`,
//! where a data length of zero marks an uncompressed payload.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest legal VarInt encoding.
pub const MAX_VARINT_LEN: usize = 5;

/// Largest frame accepted from the network.
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

/// Errors raised while encoding or decoding packets.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("VarInt is longer than {MAX_VARINT_LEN} bytes")]
    VarIntTooLong,

    #[error("Frame length {0} out of range")]
    BadLength(i64),

    #[error("Unexpected end of packet")]
    Truncated,

    #[error("Invalid UTF-8 in string field")]
    InvalidString,
}

/// Append `value` as a VarInt.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
pub fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut v = value as u32;
    loop {
        if v & !0x7F == 0 {
            buf.push(v as u8);
            return;
        }
        buf.push(((v & 0x7F) | 0x80) as u8);
        v >>= 7;
    }
}

/// Read a VarInt from an async stream.
///
/// # Errors
///
/// Returns [`CodecError::Io`] on stream failure (including EOF) and
/// [`CodecError::VarIntTooLong`] on a malformed encoding.
#[allow(clippy::cast_possible_wrap)]
pub async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<i32, CodecError> {
    let mut result: u32 = 0;
    for i in 0..MAX_VARINT_LEN {
        let byte = reader.read_u8().await?;
        result |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(result as i32);
        }
    }
    Err(CodecError::VarIntTooLong)
}

/// Read one frame body (everything after the length prefix).
///
/// # Errors
///
/// Returns an error if the stream fails or the length is out of range.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, CodecError> {
    let len = read_varint(reader).await?;
    let len = usize::try_from(len).map_err(|_| CodecError::BadLength(i64::from(len)))?;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(CodecError::BadLength(i64::try_from(len).unwrap_or(i64::MAX)));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Write a length-prefixed frame and flush.
///
/// # Errors
///
/// Returns an error if the stream fails.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
) -> Result<(), CodecError> {
    let len = i32::try_from(body.len()).map_err(|_| CodecError::BadLength(i64::MAX))?;
    let mut frame = Vec::with_capacity(body.len() + MAX_VARINT_LEN);
    write_varint(&mut frame, len);
    frame.extend_from_slice(body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Builder for an outgoing packet body.
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    buf: Vec<u8>,
}

impl PacketBuilder {
    /// Start a packet with the given id.
    #[must_use]
    pub fn new(id: i32) -> Self {
        let mut buf = Vec::with_capacity(64);
        write_varint(&mut buf, id);
        Self { buf }
    }

    #[must_use]
    pub fn varint(mut self, value: i32) -> Self {
        write_varint(&mut self.buf, value);
        self
    }

    /// Append a VarInt-prefixed UTF-8 string.
    #[must_use]
    pub fn string(mut self, value: &str) -> Self {
        let len = i32::try_from(value.len()).unwrap_or(i32::MAX);
        write_varint(&mut self.buf, len);
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    #[must_use]
    pub fn u16(mut self, value: u16) -> Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    #[must_use]
    pub fn i64(mut self, value: i64) -> Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    #[must_use]
    pub fn bytes(mut self, value: &[u8]) -> Self {
        self.buf.extend_from_slice(value);
        self
    }

    /// Finish the body; with compression on, it is sent uncompressed.
    #[must_use]
    pub fn finish(self, compressed_layout: bool) -> Vec<u8> {
        if compressed_layout {
            let mut out = Vec::with_capacity(self.buf.len() + 1);
            write_varint(&mut out, 0);
            out.extend_from_slice(&self.buf);
            out
        } else {
            self.buf
        }
    }
}

/// Cursor over a received packet body.
#[derive(Debug)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not consumed yet.
    #[must_use]
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).ok_or(CodecError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(CodecError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    /// # Errors
    ///
    /// Returns an error if the packet ends early or the VarInt is malformed.
    #[allow(clippy::cast_possible_wrap)]
    pub fn varint(&mut self) -> Result<i32, CodecError> {
        let mut result: u32 = 0;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.take(1)?[0];
            result |= u32::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result as i32);
            }
        }
        Err(CodecError::VarIntTooLong)
    }

    /// # Errors
    ///
    /// Returns an error if the packet ends early or the string is not UTF-8.
    pub fn string(&mut self) -> Result<String, CodecError> {
        let len = self.varint()?;
        let len = usize::try_from(len).map_err(|_| CodecError::BadLength(i64::from(len)))?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidString)
    }

    /// # Errors
    ///
    /// Returns an error if the packet ends early.
    pub fn i64(&mut self) -> Result<i64, CodecError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: i32) -> Vec<u8> {
        let mut buf = Vec::new();
        write_varint(&mut buf, value);
        buf
    }

    #[test]
    fn varint_known_encodings() {
        assert_eq!(encode(0), vec![0x00]);
        assert_eq!(encode(1), vec![0x01]);
        assert_eq!(encode(127), vec![0x7F]);
        assert_eq!(encode(128), vec![0x80, 0x01]);
        assert_eq!(encode(25565), vec![0xDD, 0xC7, 0x01]);
        assert_eq!(encode(-1), vec![0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
    }

    #[test]
    fn reader_decodes_negative_varint() {
        let buf = encode(-1);
        assert_eq!(PacketReader::new(&buf).varint().unwrap(), -1);
    }

    #[test]
    fn reader_rejects_overlong_varint() {
        let buf = [0x80, 0x80, 0x80, 0x80, 0x80, 0x01];
        assert!(matches!(
            PacketReader::new(&buf).varint(),
            Err(CodecError::VarIntTooLong)
        ));
    }

    #[test]
    fn reader_reports_truncated_string() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 10);
        buf.extend_from_slice(b"abc");
        assert!(matches!(
            PacketReader::new(&buf).string(),
            Err(CodecError::Truncated)
        ));
    }

    #[test]
    fn handshake_packet_layout() {
        let body = PacketBuilder::new(0x00)
            .varint(757)
            .string("mc")
            .u16(25565)
            .varint(1)
            .finish(false);
        assert_eq!(
            body,
            vec![0x00, 0xF5, 0x05, 0x02, b'm', b'c', 0x63, 0xDD, 0x01]
        );
    }

    #[test]
    fn compressed_layout_prefixes_zero_length() {
        let body = PacketBuilder::new(0x03).string("hi").finish(true);
        assert_eq!(body, vec![0x00, 0x03, 0x02, b'h', b'i']);
    }

    #[tokio::test]
    async fn frame_through_duplex_stream() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let body = PacketBuilder::new(0x01).i64(42).finish(false);
        write_frame(&mut a, &body).await.unwrap();

        let received = read_frame(&mut b).await.unwrap();
        let mut reader = PacketReader::new(&received);
        assert_eq!(reader.varint().unwrap(), 0x01);
        assert_eq!(reader.i64().unwrap(), 42);
        assert!(reader.remaining().is_empty());
    }

    #[tokio::test]
    async fn read_frame_rejects_empty_frame() {
        let (mut a, mut b) = tokio::io::duplex(8);
        a.write_all(&[0x00]).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(CodecError::BadLength(0))
        ));
    }
}
