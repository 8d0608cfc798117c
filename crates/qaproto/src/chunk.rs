//! Media chunks emitted by the capture subsystem.

use crate::ids::SessionId;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default MIME type for captured media.
pub const DEFAULT_MIME_TYPE: &str = "video/webm";

/// Payload of the placeholder chunk uploaded when a session produced no media.
pub const SYNTHETIC_PAYLOAD: &[u8] = b"QAASSIST";

/// A completed media segment.
///
/// `session_id` is absent when the capture subsystem produced the segment
/// before it learned which session it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedChunk {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub index: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_ts: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub end_ts: DateTime<Utc>,
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    #[serde(with = "crate::b64")]
    pub data: Bytes,
    #[serde(default)]
    pub synthetic: bool,
}

fn default_mime_type() -> String {
    DEFAULT_MIME_TYPE.to_string()
}

impl CompletedChunk {
    /// The placeholder chunk: eight bytes covering the second before `now`.
    pub fn synthetic(session_id: SessionId, index: u32, now: DateTime<Utc>) -> Self {
        Self {
            session_id: Some(session_id),
            index,
            start_ts: now - Duration::seconds(1),
            end_ts: now,
            mime_type: DEFAULT_MIME_TYPE.to_string(),
            data: Bytes::from_static(SYNTHETIC_PAYLOAD),
            synthetic: true,
        }
    }

    pub fn byte_size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
