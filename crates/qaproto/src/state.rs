//! Recorder lifecycle state as seen by the UI and the local store.

use crate::ids::{DeviceId, SessionId, TabId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Session lifecycle. `Ended` is terminal for a session; once its stop
/// sequence completes the session id is cleared and a new start is allowed
/// from `Ended`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Recording,
    Paused,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Recording => "recording",
            SessionStatus::Paused => "paused",
            SessionStatus::Ended => "ended",
        }
    }

    /// Recording or paused: a session is held.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Recording | SessionStatus::Paused)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of a `Status` notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusValue {
    Recording,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastTransition {
    pub from: SessionStatus,
    pub to: SessionStatus,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Entry of the locally kept recent-sessions list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    pub started_at: DateTime<Utc>,
    pub status: String,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Value,
}

/// Reply to `GetState`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderSnapshot {
    pub status: SessionStatus,
    pub session_id: Option<SessionId>,
    pub device_id: Option<DeviceId>,
    pub tab_id: Option<TabId>,
    pub chunk_index: u32,
    pub queued_events: usize,
    pub pending_uploads: usize,
    pub auto_paused: bool,
    pub debug: bool,
    pub has_auth: bool,
    pub last_error: Option<String>,
    pub last_transition: Option<LastTransition>,
    pub recent_sessions: Vec<SessionSummary>,
}
