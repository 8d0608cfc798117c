//! Recorder error taxonomy.

use qaproto::SessionStatus;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RecorderError>;

#[derive(Debug, Error)]
pub enum RecorderError {
    /// No credential configured; start refuses before any backend call.
    #[error("auth token missing")]
    AuthMissing,

    /// Neither the real stream nor the synthetic fallback could be started.
    #[error("capture acquisition failed: {0}")]
    CaptureAcquisitionFailed(String),

    #[error("diagnostics attach failed: {0}")]
    DiagnosticsAttachFailed(String),

    /// Network or HTTP failure talking to the backend.
    #[error("backend unavailable{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    BackendUnavailable {
        status: Option<u16>,
        message: String,
    },

    /// Upload failed after the chunk was registered. Never retried.
    #[error("chunk {index} upload failed: {message}")]
    ChunkUploadFailed { index: u32, message: String },

    #[error("timed out waiting for {0}")]
    DrainTimeout(&'static str),

    #[error("cannot {action} while {status}")]
    InvalidTransition {
        action: &'static str,
        status: SessionStatus,
    },

    #[error("no active tab")]
    NoActiveTab,

    #[error("not recording")]
    NotRecording,

    #[error("chunk {0} has an empty payload")]
    EmptyChunk(u32),

    #[error("state storage error: {0}")]
    Storage(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RecorderError {
    pub fn backend(status: Option<u16>, message: impl Into<String>) -> Self {
        RecorderError::BackendUnavailable {
            status,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for RecorderError {
    fn from(err: reqwest::Error) -> Self {
        RecorderError::backend(err.status().map(|s| s.as_u16()), err.to_string())
    }
}

impl From<serde_json::Error> for RecorderError {
    fn from(err: serde_json::Error) -> Self {
        RecorderError::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for RecorderError {
    fn from(err: std::io::Error) -> Self {
        RecorderError::Storage(err.to_string())
    }
}
