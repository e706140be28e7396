//! Wire protocol between a session process and its front-end.
//!
//! Every message is a single frame: `[kind:1][length:4 BE][payload:N]`.
//! The codec imposes no per-kind constraints on the payload; callers
//! validate payload layouts themselves.

use std::io::{self, Read};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ── Message kinds ───────────────────────────────────────────────────

pub const MSG_DATA: u8 = 0x01;
pub const MSG_RESIZE: u8 = 0x02;
pub const MSG_DETACH: u8 = 0x03;
pub const MSG_KILL: u8 = 0x04;
pub const MSG_HISTORY_REQUEST: u8 = 0x05;
pub const MSG_HISTORY_RESPONSE: u8 = 0x06;

/// High bit of a HISTORY_REQUEST offset: the low 31 bits are a distance
/// from the newest stored line instead of an absolute line index.
pub const HISTORY_FROM_END: u32 = 0x8000_0000;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The stream ended before a complete header or payload arrived.
    #[error("short read: stream ended mid-frame")]
    ShortRead,

    #[error("read frame: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            ProtocolError::ShortRead
        } else {
            ProtocolError::Io(err)
        }
    }
}

// ── Message ─────────────────────────────────────────────────────────

/// A single wire message. `kind` is not validated by the codec so that
/// unknown kinds pass through decode and can be ignored upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: u8,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: u8, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn data(payload: Vec<u8>) -> Self {
        Self::new(MSG_DATA, payload)
    }

    pub fn detach() -> Self {
        Self::new(MSG_DETACH, Vec::new())
    }

    pub fn kill() -> Self {
        Self::new(MSG_KILL, Vec::new())
    }

    /// `rows` then `cols`, both big-endian u16.
    pub fn resize(rows: u16, cols: u16) -> Self {
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&rows.to_be_bytes());
        payload.extend_from_slice(&cols.to_be_bytes());
        Self::new(MSG_RESIZE, payload)
    }

    /// `offset` is sent raw; callers wanting from-end semantics OR in
    /// [`HISTORY_FROM_END`] themselves.
    pub fn history_request(offset: u32, count: u32) -> Self {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&offset.to_be_bytes());
        payload.extend_from_slice(&count.to_be_bytes());
        Self::new(MSG_HISTORY_REQUEST, payload)
    }

    /// Serialize into wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + self.payload.len());
        buf.push(self.kind);
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

// ── Decode / encode over streams ────────────────────────────────────

/// Read a single message from a blocking reader.
pub fn decode(r: &mut impl Read) -> Result<Message, ProtocolError> {
    let mut header = [0u8; 5];
    r.read_exact(&mut header)?;

    let kind = header[0];
    let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;

    let mut payload = vec![0u8; length];
    if length > 0 {
        r.read_exact(&mut payload)?;
    }

    Ok(Message { kind, payload })
}

/// Read a single message from an async reader.
pub async fn read_message<R>(r: &mut R) -> Result<Message, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    r.read_exact(&mut header).await?;

    let kind = header[0];
    let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;

    let mut payload = vec![0u8; length];
    if length > 0 {
        r.read_exact(&mut payload).await?;
    }

    Ok(Message { kind, payload })
}

/// Write a message as one contiguous frame. The single `write_all` keeps
/// frames atomic as long as callers serialise access to the writer.
pub async fn write_message<W>(w: &mut W, msg: &Message) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&msg.encode()).await
}

// ── Payload layout helpers ──────────────────────────────────────────

/// RESIZE payload: `(rows, cols)`. None if shorter than 4 octets.
pub fn parse_resize(payload: &[u8]) -> Option<(u16, u16)> {
    if payload.len() < 4 {
        return None;
    }
    let rows = u16::from_be_bytes([payload[0], payload[1]]);
    let cols = u16::from_be_bytes([payload[2], payload[3]]);
    Some((rows, cols))
}

/// HISTORY_REQUEST payload: `(raw_offset, count)`. The offset is returned
/// with the from-end bit intact. None if shorter than 8 octets.
pub fn parse_history_request(payload: &[u8]) -> Option<(u32, u32)> {
    if payload.len() < 8 {
        return None;
    }
    let offset = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let count = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    Some((offset, count))
}

/// HISTORY_RESPONSE payload: `(start_line, total_lines, line data)`.
pub fn parse_history_response(payload: &[u8]) -> Option<(u32, u32, &[u8])> {
    if payload.len() < 8 {
        return None;
    }
    let start = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let total = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    Some((start, total, &payload[8..]))
}

// ── Unit tests ──────────────────────────────────────────────────────
