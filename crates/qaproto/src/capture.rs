//! Request/acknowledge protocol with the media-capture subsystem.
//!
//! Commands flow out, events flow back. A command is never answered
//! inline: `Start` is acknowledged by `Started` or `StartFailed`, `Stop` by
//! `Stopped` and, once every chunk of that capture has been handed over,
//! `UploadsDrained`.

use crate::chunk::CompletedChunk;
use crate::ids::{SessionId, StreamRef};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CaptureCommand {
    /// Record the acquired stream.
    Start {
        stream: StreamRef,
        #[serde(default)]
        session_id: Option<SessionId>,
        chunk_duration_ms: u64,
        chunk_start_index: u32,
        debug: bool,
    },
    /// Record a synthetic source instead of a real stream.
    StartFake {
        #[serde(default)]
        session_id: Option<SessionId>,
        chunk_duration_ms: u64,
        chunk_start_index: u32,
        debug: bool,
    },
    Stop,
    /// Late session binding; also releases any chunk held for lack of one.
    SetSession {
        session_id: SessionId,
        chunk_start_index: u32,
    },
}

impl CaptureCommand {
    pub fn name(&self) -> &'static str {
        match self {
            CaptureCommand::Start { .. } => "start",
            CaptureCommand::StartFake { .. } => "start_fake",
            CaptureCommand::Stop => "stop",
            CaptureCommand::SetSession { .. } => "set_session",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CaptureEvent {
    /// The capture context finished loading.
    Ready,
    Started {
        #[serde(default)]
        session_id: Option<SessionId>,
    },
    StartFailed { error: String },
    Stopped {
        #[serde(default)]
        session_id: Option<SessionId>,
    },
    ChunkCompleted(CompletedChunk),
    UploadsDrained,
}
