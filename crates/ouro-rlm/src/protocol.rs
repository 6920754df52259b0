//! Length-prefixed wire protocol between executing code and the LM handler.
//!
//! A frame is a 4-byte big-endian unsigned length followed by that many
//! bytes of UTF-8 JSON. The same framing carries handler queries over TCP
//! and session commands over the local executor's stdio pipe.

use bytes::BufMut;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, RlmError};
use crate::types::{PromptInput, Usage};

/// Practical cap on a single frame. The wire format itself allows up to
/// 2^32 - 1 bytes; anything past this limit is treated as a protocol error.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// A message on the LM handler socket.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Frame {
    /// An LM call from inside an environment.
    Query {
        /// The prompt: plain text or a message sequence.
        prompt: PromptInput,
    },
    /// The completion text for a query.
    Response {
        /// The response text.
        text: String,
        /// Token usage for the call, when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    /// The query failed.
    Error {
        /// Human-readable failure description.
        message: String,
    },
}

/// Encode a message into framed bytes (header + payload).
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(RlmError::Protocol(format!(
            "frame too large: {} bytes",
            payload.len()
        )));
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(buf)
}

/// Decode a message from framed bytes (header + payload).
pub fn decode_message<T: DeserializeOwned>(buf: &[u8]) -> Result<T> {
    if buf.len() < 4 {
        return Err(RlmError::Protocol(format!(
            "short frame: {} bytes",
            buf.len()
        )));
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() != 4 + len {
        return Err(RlmError::Protocol(format!(
            "frame length mismatch: header says {}, payload is {}",
            len,
            buf.len() - 4
        )));
    }
    serde_json::from_slice(&buf[4..]).map_err(|e| RlmError::Protocol(e.to_string()))
}

/// Write one framed message to an async stream.
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let buf = encode_message(msg)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message from an async stream.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_BYTES {
        return Err(RlmError::Protocol(format!(
            "incoming frame too large: {} bytes",
            len
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload).map_err(|e| RlmError::Protocol(e.to_string()))
}
