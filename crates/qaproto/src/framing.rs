//! Native-messaging framing.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+------------------------------+
//! | length: u32 (LE)     | UTF-8 JSON, `length` bytes   |
//! +----------------------+------------------------------+
//! ```
//!
//! Byte order is native to the browser host, which is little-endian on every
//! supported platform. The browser refuses frames larger than 1 MiB sent
//! from the host; frames toward the host carry media chunks and may be large.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Largest frame the browser accepts from the host.
pub const MAX_OUTBOUND_FRAME: usize = 1024 * 1024;

/// Largest frame accepted from the browser.
pub const MAX_INBOUND_FRAME: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {len} bytes exceeds limit of {limit}")]
    TooLarge { len: usize, limit: usize },

    #[error("JSON encode error: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("JSON decode error: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Serialize `message` into a length-prefixed frame.
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, FrameError> {
    let body = serde_json::to_vec(message).map_err(FrameError::Encode)?;
    if body.len() > MAX_OUTBOUND_FRAME {
        return Err(FrameError::TooLarge {
            len: body.len(),
            limit: MAX_OUTBOUND_FRAME,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Body length announced by a frame header.
pub fn body_len(header: [u8; HEADER_LEN]) -> Result<usize, FrameError> {
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_INBOUND_FRAME {
        return Err(FrameError::TooLarge {
            len,
            limit: MAX_INBOUND_FRAME,
        });
    }
    Ok(len)
}

/// Deserialize a frame body (without its header).
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, FrameError> {
    serde_json::from_slice(body).map_err(FrameError::Decode)
}
