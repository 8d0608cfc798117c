//! Structured session events.
//!
//! Events are shipped to `POST /sessions/{id}/events` in batches. The payload
//! is free-form JSON; only the timestamp and kind are interpreted here.

use crate::ids::TabId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Interaction,
    Console,
    Network,
    Marker,
    Annotation,
    Env,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Interaction => "interaction",
            EventKind::Console => "console",
            EventKind::Network => "network",
            EventKind::Marker => "marker",
            EventKind::Annotation => "annotation",
            EventKind::Env => "env",
        }
    }
}

/// Tab the event was observed in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabContext {
    pub tab_id: TabId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// An event as produced by a collaborator. The timestamp may be missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub ts: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub payload: Value,
}

impl RawEvent {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            ts: None,
            kind,
            payload,
        }
    }

    pub fn at(mut self, ts: DateTime<Utc>) -> Self {
        self.ts = Some(ts);
        self
    }
}

/// A normalized event owned by the batcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab: Option<TabContext>,
}

impl Event {
    /// Fill in the timestamp with `now` when absent and attach the tab.
    pub fn normalize(raw: RawEvent, now: DateTime<Utc>, tab: Option<TabContext>) -> Self {
        Self {
            ts: raw.ts.unwrap_or(now),
            kind: raw.kind,
            payload: raw.payload,
            tab,
        }
    }
}

/// Body of `POST /sessions/{id}/events`.
#[derive(Debug, Serialize)]
pub struct EventBatch<'a> {
    pub events: &'a [Event],
}
