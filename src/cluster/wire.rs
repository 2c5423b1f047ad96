//! Wire protocol for the cluster forward call.
//!
//! One remote call exists: `Forward(record_type, body) -> {message}`.
//! Messages are MessagePack-encoded and carried in 4-byte big-endian
//! length-prefixed frames.

use super::error::{ClusterError, ClusterResult};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame header size: a big-endian u32 length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Maximum message size (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Response message signalling success.
pub const MESSAGE_OK: &str = "ok";

/// A forward call carrying a serialized trace batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRequest {
    /// Record type label, currently always "traces".
    pub record_type: String,

    /// MessagePack-serialized trace batch.
    pub body: Vec<u8>,
}

impl ForwardRequest {
    /// Serialize the request to MessagePack bytes.
    pub fn to_bytes(&self) -> ClusterResult<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| ClusterError::Serialization(e.to_string()))
    }

    /// Deserialize a request from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> ClusterResult<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| ClusterError::Serialization(e.to_string()))
    }
}

/// Response to a forward call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardResponse {
    /// "ok" on success, a human-readable error otherwise.
    pub message: String,
}

impl ForwardResponse {
    /// A success response.
    pub fn ok() -> Self {
        Self {
            message: MESSAGE_OK.to_string(),
        }
    }

    /// An error response with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Whether the call succeeded.
    pub fn is_ok(&self) -> bool {
        self.message == MESSAGE_OK
    }

    /// Serialize the response to MessagePack bytes.
    pub fn to_bytes(&self) -> ClusterResult<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| ClusterError::Serialization(e.to_string()))
    }

    /// Deserialize a response from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> ClusterResult<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| ClusterError::Serialization(e.to_string()))
    }
}

/// Encode a message with its length prefix.
pub fn encode_frame(data: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + data.len());
    frame.put_u32(data.len() as u32);
    frame.put_slice(data);
    frame
}

/// Decode the length from a frame header.
///
/// Returns `None` if the message would exceed [`MAX_MESSAGE_SIZE`].
pub fn decode_frame_length(header: &[u8; FRAME_HEADER_SIZE]) -> Option<usize> {
    let len = u32::from_be_bytes(*header) as usize;
    if len <= MAX_MESSAGE_SIZE {
        Some(len)
    } else {
        None
    }
}

/// Write one length-prefixed frame to the stream.
pub async fn write_frame<W>(stream: &mut W, data: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(&encode_frame(data)).await?;
    stream.flush().await
}

/// Read one length-prefixed frame from the stream.
pub async fn read_frame<R>(stream: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    stream.read_exact(&mut header).await?;

    let len = decode_frame_length(&header).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "frame exceeds maximum size")
    })?;

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}
