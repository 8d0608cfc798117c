//! Native-messaging vocabulary between the browser side and the recorder.
//!
//! Every frame is a [`Frame`]: an optional correlation id plus one message.
//! Browser commands that expect an answer carry an id and get a
//! [`Outbound::Response`] with the same id. Requests the recorder makes of the
//! browser ([`HostRequest`]) carry a fresh id and are answered by
//! [`Inbound::Reply`].

use crate::capture::{CaptureCommand, CaptureEvent};
use crate::event::{EventKind, RawEvent};
use crate::ids::{ChunkId, RequestId, SessionId, TabId};
use crate::state::StatusValue;
use crate::tab::TabMessage;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One framed message with optional correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(flatten)]
    pub message: T,
}

impl<T> Frame<T> {
    pub fn new(message: T) -> Self {
        Self { id: None, message }
    }

    pub fn with_id(id: RequestId, message: T) -> Self {
        Self {
            id: Some(id),
            message,
        }
    }
}

/// Per-start overrides of bootstrap configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartOverrides {
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub debug: Option<bool>,
    #[serde(default)]
    pub chunk_duration_ms: Option<u64>,
}

/// Entry from the low-level diagnostics listener of the recorded tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosticEntry {
    Console {
        #[serde(default)]
        message: String,
        #[serde(default)]
        level: Option<String>,
        /// Milliseconds since the epoch.
        #[serde(default)]
        timestamp: Option<f64>,
    },
    Network {
        url: String,
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        status_text: Option<String>,
        #[serde(default)]
        timestamp: Option<f64>,
    },
}

impl DiagnosticEntry {
    pub fn into_raw_event(self) -> RawEvent {
        match self {
            DiagnosticEntry::Console {
                message,
                level,
                timestamp,
            } => RawEvent {
                ts: timestamp.and_then(millis_to_utc),
                kind: EventKind::Console,
                payload: json!({"message": message, "level": level}),
            },
            DiagnosticEntry::Network {
                url,
                status,
                status_text,
                timestamp,
            } => RawEvent {
                ts: timestamp.and_then(millis_to_utc),
                kind: EventKind::Network,
                payload: json!({"url": url, "status": status, "statusText": status_text}),
            },
        }
    }
}

fn millis_to_utc(ms: f64) -> Option<DateTime<Utc>> {
    if !ms.is_finite() {
        return None;
    }
    Utc.timestamp_millis_opt(ms as i64).single()
}

/// Messages arriving from the browser side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    // UI commands
    Start(StartOverrides),
    Pause,
    Resume,
    Stop,
    GetState,
    SetAuth {
        #[serde(default)]
        token: Option<String>,
    },
    AddMarker,
    Annotate,

    // Page script
    ResumeRequest,
    Interaction { event: RawEvent },
    Activity,
    MarkerSubmit {
        #[serde(default)]
        payload: Value,
    },
    AnnotationSubmit {
        #[serde(default)]
        payload: Value,
    },
    DebugLog {
        #[serde(default)]
        payload: Value,
    },

    // Browser
    TabActivated { tab_id: TabId },
    Diagnostic { tab_id: TabId, entry: DiagnosticEntry },

    // Capture subsystem
    Capture(CaptureEvent),

    /// Answer to a [`HostRequest`].
    Reply {
        ok: bool,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        error: Option<String>,
    },
}

impl Inbound {
    pub fn name(&self) -> &'static str {
        match self {
            Inbound::Start(_) => "start",
            Inbound::Pause => "pause",
            Inbound::Resume => "resume",
            Inbound::Stop => "stop",
            Inbound::GetState => "get_state",
            Inbound::SetAuth { .. } => "set_auth",
            Inbound::AddMarker => "add_marker",
            Inbound::Annotate => "annotate",
            Inbound::ResumeRequest => "resume_request",
            Inbound::Interaction { .. } => "interaction",
            Inbound::Activity => "activity",
            Inbound::MarkerSubmit { .. } => "marker_submit",
            Inbound::AnnotationSubmit { .. } => "annotation_submit",
            Inbound::DebugLog { .. } => "debug_log",
            Inbound::TabActivated { .. } => "tab_activated",
            Inbound::Diagnostic { .. } => "diagnostic",
            Inbound::Capture(_) => "capture",
            Inbound::Reply { .. } => "reply",
        }
    }
}

/// Requests the recorder makes of the browser side. Each one is answered by
/// an [`Inbound::Reply`] carrying the same frame id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum HostRequest {
    GetActiveTab,
    GetTab { tab_id: TabId },
    GetTabEnv { tab_id: TabId },
    AcquireStream { tab_id: TabId },
    AttachDiagnostics { tab_id: TabId },
    DetachDiagnostics { tab_id: TabId },
    PingCapture,
    CreateCaptureContext,
    TabMessage { tab_id: TabId, message: TabMessage },
}

impl HostRequest {
    pub fn name(&self) -> &'static str {
        match self {
            HostRequest::GetActiveTab => "get_active_tab",
            HostRequest::GetTab { .. } => "get_tab",
            HostRequest::GetTabEnv { .. } => "get_tab_env",
            HostRequest::AcquireStream { .. } => "acquire_stream",
            HostRequest::AttachDiagnostics { .. } => "attach_diagnostics",
            HostRequest::DetachDiagnostics { .. } => "detach_diagnostics",
            HostRequest::PingCapture => "ping_capture",
            HostRequest::CreateCaptureContext => "create_capture_context",
            HostRequest::TabMessage { .. } => "tab_message",
        }
    }
}

/// Messages leaving the recorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// Answer to a correlated command.
    Response {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        data: Value,
    },
    Status { value: StatusValue },
    ChunkUploaded {
        session_id: SessionId,
        #[serde(default)]
        chunk_id: Option<ChunkId>,
        chunk_index: u32,
        byte_size: u64,
        synthetic: bool,
    },
    ChunkFailed {
        session_id: SessionId,
        chunk_index: u32,
        error: String,
    },
    DebugLog {
        message: String,
        #[serde(default)]
        detail: Value,
    },
    Capture(CaptureCommand),
    Request(HostRequest),
}

impl Outbound {
    pub fn ok(data: Value) -> Self {
        Outbound::Response {
            ok: true,
            error: None,
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Outbound::Response {
            ok: false,
            error: Some(message.into()),
            data: Value::Null,
        }
    }
}
