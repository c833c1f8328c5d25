//! Wire types for the sender -> receiver replication protocol.
//!
//! Control and ack messages are field-labeled JSON records so the receiver
//! can evolve independently. Diff data is opaque: every data message is the
//! transfer id followed by either raw diff bytes or a terminal sentinel, and
//! the receiver demultiplexes by matching the id prefix.

use crate::replica::TransferId;
use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Sentinel published after the diff tool exits with status 0
pub const END_SUCCESS: &[u8] = b"END_SUCCESS";

/// Sentinel published when the diff stream cannot complete
pub const END_FAIL: &[u8] = b"END_FAIL";

/// Wire format: all multi-byte integers are big-endian
/// Frame format: len:u32 | type:u8 | payload

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Control = 0x01,
    Ack = 0x02,
    Data = 0x03,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Control),
            0x02 => Some(Self::Ack),
            0x03 => Some(Self::Data),
            _ => None,
        }
    }
}

/// Prefix `payload` with a frame header.
///
/// Fails if the payload would not pass [`read_frame`] on the other end.
pub fn encode_frame(msg_type: MessageType, payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_FRAME_SIZE as usize {
        anyhow::bail!(
            "Frame size {} exceeds maximum allowed size {}",
            payload.len(),
            MAX_FRAME_SIZE
        );
    }
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u8(msg_type as u8);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

// =============================================================================
// CONTROL (0x01) - sender -> receiver meta port
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Announces that a diff for `snap` is about to be streamed.
    Begin {
        id: TransferId,
        /// Destination pool on the receiver
        pool: String,
        share: String,
        snap: String,
        /// Sender address the receiver should subscribe to
        ip: String,
        data_port: u16,
        meta_port: u16,
        incremental: bool,
    },
    End {
        id: TransferId,
    },
}

impl ControlMessage {
    pub fn id(&self) -> &TransferId {
        match self {
            ControlMessage::Begin { id, .. } | ControlMessage::End { id } => id,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let json = serde_json::to_vec(self).context("Failed to serialize control message")?;
        encode_frame(MessageType::Control, &json)
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        serde_json::from_slice(&payload).context("Invalid control message")
    }
}

// =============================================================================
// ACK (0x02) - receiver -> sender
// =============================================================================

/// Acknowledgment from the receiver.
///
/// `msg` is `"error"`, `"receive_error"`, or any success token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TransferId>,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Interpretation of an [`AckMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckKind {
    /// Receiver rejected the request; carries the receiver's error text
    Error(String),
    /// Receiver got the stream but failed to apply it
    ReceiveError,
    Ok,
}

impl AckMessage {
    pub const ERROR: &'static str = "error";
    pub const RECEIVE_ERROR: &'static str = "receive_error";

    pub fn ok(id: TransferId, msg: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            msg: msg.into(),
            error: None,
        }
    }

    pub fn error(id: TransferId, error: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            msg: Self::ERROR.to_string(),
            error: Some(error.into()),
        }
    }

    pub fn receive_error(id: TransferId) -> Self {
        Self {
            id: Some(id),
            msg: Self::RECEIVE_ERROR.to_string(),
            error: None,
        }
    }

    pub fn kind(&self) -> AckKind {
        match self.msg.as_str() {
            Self::ERROR => AckKind::Error(self.error.clone().unwrap_or_default()),
            Self::RECEIVE_ERROR => AckKind::ReceiveError,
            _ => AckKind::Ok,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let json = serde_json::to_vec(self).context("Failed to serialize ack")?;
        encode_frame(MessageType::Ack, &json)
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        serde_json::from_slice(&payload).context("Invalid ack message")
    }
}

// =============================================================================
// DATA (0x03) - sender -> receiver data port
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataPayload {
    Chunk(Bytes),
    EndSuccess,
    EndFail,
}

impl DataPayload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            DataPayload::Chunk(b) => b,
            DataPayload::EndSuccess => END_SUCCESS,
            DataPayload::EndFail => END_FAIL,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        !matches!(self, DataPayload::Chunk(_))
    }
}

/// One message on the shared data bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub id: TransferId,
    pub payload: DataPayload,
}

impl DataFrame {
    pub fn chunk(id: TransferId, data: Bytes) -> Self {
        Self {
            id,
            payload: DataPayload::Chunk(data),
        }
    }

    pub fn end_success(id: TransferId) -> Self {
        Self {
            id,
            payload: DataPayload::EndSuccess,
        }
    }

    pub fn end_fail(id: TransferId) -> Self {
        Self {
            id,
            payload: DataPayload::EndFail,
        }
    }

    /// Raw bus message: transfer id immediately followed by the payload.
    pub fn encode(&self) -> Bytes {
        let id = self.id.as_bytes();
        let payload = self.payload.as_bytes();
        let mut buf = BytesMut::with_capacity(id.len() + payload.len());
        buf.put_slice(id);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Demultiplex a raw bus message for `id`.
    ///
    /// Returns `None` when the message belongs to another transfer. A payload
    /// that is exactly a sentinel token is reported as that sentinel.
    pub fn decode_for(id: &TransferId, raw: &Bytes) -> Option<DataPayload> {
        let prefix = id.as_bytes();
        if !raw.starts_with(prefix) {
            return None;
        }
        let rest = raw.slice(prefix.len()..);
        let payload = if rest.as_ref() == END_SUCCESS {
            DataPayload::EndSuccess
        } else if rest.as_ref() == END_FAIL {
            DataPayload::EndFail
        } else {
            DataPayload::Chunk(rest)
        };
        Some(payload)
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Room left in a data frame for the transfer id prefix
pub const MAX_TRANSFER_ID_LEN: usize = 4096;

/// Largest diff chunk that still fits in one data frame
pub const MAX_CHUNK_SIZE: usize = MAX_FRAME_SIZE as usize - MAX_TRANSFER_ID_LEN;

/// Read a single frame from the stream.
/// Returns (message_type, payload).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(MessageType, Bytes)> {
    let len = r.read_u32().await.context("Failed to read frame length")?;

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        anyhow::bail!(
            "Frame size {} exceeds maximum allowed size {}",
            len,
            MAX_FRAME_SIZE
        );
    }

    let msg_type = r.read_u8().await.context("Failed to read message type")?;
    let msg_type = MessageType::from_u8(msg_type).context("Unknown message type")?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .context("Failed to read frame payload")?;

    Ok((msg_type, Bytes::from(payload)))
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await.context("Failed to write frame")?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
