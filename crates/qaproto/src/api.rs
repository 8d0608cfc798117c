//! Backend REST contract.
//!
//! Request bodies and the parts of response bodies the recorder reads.
//! Unknown response fields are ignored so the backend can grow freely.

use crate::ids::{ChunkId, DeviceId, SessionId};
use crate::tab::TabEnvironment;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Header carrying the device identifier on every backend call.
pub const DEVICE_ID_HEADER: &str = "x-device-id";

// ============================================================================
// Devices
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetadata {
    pub user_agent: String,
}

/// Body of `POST /devices`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDeviceRequest {
    pub metadata: DeviceMetadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceResponse {
    pub device_id: DeviceId,
}

// ============================================================================
// Sessions
// ============================================================================

/// Environment snapshot sent when a session is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent_data: Option<Value>,
}

impl SessionMetadata {
    pub fn from_tab(
        url: Option<String>,
        title: Option<String>,
        env: Option<&TabEnvironment>,
        fallback_user_agent: &str,
    ) -> Self {
        let user_agent = env
            .and_then(|e| e.user_agent.clone())
            .unwrap_or_else(|| fallback_user_agent.to_string());
        Self {
            url,
            title,
            user_agent: Some(user_agent),
            viewport: env.and_then(|e| e.viewport.clone()),
            screen: env.and_then(|e| e.screen.clone()),
            platform: env.and_then(|e| e.platform.clone()),
            language: env.and_then(|e| e.language.clone()),
            user_agent_data: env.and_then(|e| e.user_agent_data.clone()),
        }
    }
}

/// Body of `POST /sessions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub metadata: SessionMetadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionResponse {
    pub session: SessionRecord,
}

/// Response of `GET /sessions/{id}`. Only the chunk count matters here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionDetails {
    #[serde(default)]
    pub chunks: Vec<Value>,
}

/// Lifecycle calls under `POST /sessions/{id}/{action}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Start,
    Pause,
    Resume,
    Stop,
}

impl SessionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionAction::Start => "start",
            SessionAction::Pause => "pause",
            SessionAction::Resume => "resume",
            SessionAction::Stop => "stop",
        }
    }
}

// ============================================================================
// Chunks
// ============================================================================

/// Body of `POST /sessions/{id}/chunks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterChunkRequest {
    pub idx: u32,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub content_type: String,
}

/// Resumable-upload hint in an upload descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumableUpload {
    #[serde(default)]
    pub start_url: Option<String>,
    #[serde(default)]
    pub start_method: Option<String>,
    #[serde(default)]
    pub start_headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub id: ChunkId,
}

/// Where and how to upload a registered chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadDescriptor {
    pub upload_url: String,
    #[serde(default = "UploadDescriptor::default_method")]
    pub upload_method: String,
    #[serde(default)]
    pub upload_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub resumable: Option<ResumableUpload>,
    #[serde(default)]
    pub storage: Option<String>,
    #[serde(default)]
    pub gcs_uri: Option<String>,
    #[serde(default)]
    pub chunk: Option<ChunkRef>,
}

impl UploadDescriptor {
    fn default_method() -> String {
        "POST".to_string()
    }

    pub fn chunk_id(&self) -> Option<&ChunkId> {
        self.chunk.as_ref().map(|c| &c.id)
    }

    /// Resumable start URL, if the descriptor advertises one.
    pub fn resumable_start(&self) -> Option<&ResumableUpload> {
        self.resumable
            .as_ref()
            .filter(|r| r.start_url.as_deref().is_some_and(|u| !u.is_empty()))
    }

    /// Object-storage backends do not infer readiness from the upload and
    /// need an explicit `PATCH /chunks/{id}`.
    pub fn finalize_target(&self) -> Option<(&ChunkId, &str)> {
        if self.storage.as_deref() != Some("gcs") {
            return None;
        }
        match (self.chunk_id(), self.gcs_uri.as_deref()) {
            (Some(id), Some(uri)) if !uri.is_empty() => Some((id, uri)),
            _ => None,
        }
    }
}

/// Body of `PATCH /chunks/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeChunkRequest {
    pub status: String,
    pub analysis_status: String,
    pub gcs_uri: String,
    pub byte_size: u64,
    pub content_type: String,
}

impl FinalizeChunkRequest {
    pub fn ready(gcs_uri: &str, byte_size: u64, content_type: &str) -> Self {
        Self {
            status: "ready".to_string(),
            analysis_status: "pending".to_string(),
            gcs_uri: gcs_uri.to_string(),
            byte_size,
            content_type: content_type.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn descriptor_defaults() {
        let d: UploadDescriptor =
            serde_json::from_value(json!({"upload_url": "http://localhost:4000/api/upload/1"}))
                .unwrap();
        assert_eq!(d.upload_method, "POST");
        assert!(d.upload_headers.is_empty());
        assert!(d.resumable_start().is_none());
        assert!(d.finalize_target().is_none());
    }

    #[test]
    fn gcs_descriptor_needs_finalize() {
        let d: UploadDescriptor = serde_json::from_value(json!({
            "upload_url": "https://storage.example/put",
            "upload_method": "PUT",
            "upload_headers": {"Content-Type": "video/webm"},
            "resumable": {"start_url": "https://storage.example/start", "start_headers": {"x-goog-resumable": "start"}},
            "storage": "gcs",
            "gcs_uri": "gs://bucket/obj",
            "chunk": {"id": "c-1"}
        }))
        .unwrap();

        let (id, uri) = d.finalize_target().unwrap();
        assert_eq!(id.as_str(), "c-1");
        assert_eq!(uri, "gs://bucket/obj");
        let resumable = d.resumable_start().unwrap();
        assert_eq!(resumable.start_method, None);
        assert_eq!(resumable.start_headers["x-goog-resumable"], "start");
    }

    #[test]
    fn empty_resumable_url_is_ignored() {
        let d: UploadDescriptor = serde_json::from_value(json!({
            "upload_url": "http://x/",
            "resumable": {"start_url": ""}
        }))
        .unwrap();
        assert!(d.resumable_start().is_none());
    }

    #[test]
    fn session_metadata_is_camel_case() {
        let meta = SessionMetadata {
            url: Some("https://app.test".into()),
            user_agent: Some("UA".into()),
            ..Default::default()
        };
        let value = serde_json::to_value(CreateSessionRequest { metadata: meta }).unwrap();
        assert_eq!(
            value,
            json!({"metadata": {"url": "https://app.test", "userAgent": "UA"}})
        );
    }

    #[test]
    fn finalize_body() {
        let body = serde_json::to_value(FinalizeChunkRequest::ready("gs://b/o", 8, "video/webm"))
            .unwrap();
        assert_eq!(
            body,
            json!({
                "status": "ready",
                "analysis_status": "pending",
                "gcs_uri": "gs://b/o",
                "byte_size": 8,
                "content_type": "video/webm"
            })
        );
    }
}
