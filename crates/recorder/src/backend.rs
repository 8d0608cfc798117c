//! Backend REST client.
//!
//! Every call carries the bearer credential and the device id header once
//! they are known. Non-success statuses become
//! [`RecorderError::BackendUnavailable`] with the HTTP status attached.

use crate::error::{RecorderError, Result};
use crate::telemetry::current_traceparent;
use async_trait::async_trait;
use qaproto::api::{
    CreateSessionRequest, CreateSessionResponse, DeviceResponse, FinalizeChunkRequest,
    RegisterChunkRequest, RegisterDeviceRequest, SessionDetails, SessionRecord,
    DEVICE_ID_HEADER,
};
use qaproto::event::EventBatch;
use qaproto::{ChunkId, DeviceId, Event, SessionAction, SessionId, UploadDescriptor};
use serde::de::DeserializeOwned;
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Debug, Default)]
struct ConnectionState {
    api_base: String,
    auth_token: Option<String>,
    device_id: Option<DeviceId>,
}

/// Base URL and credentials, shared by the REST client, the upload
/// transport and the controller.
#[derive(Debug, Clone, Default)]
pub struct Connection {
    state: Arc<RwLock<ConnectionState>>,
}

impl Connection {
    pub fn new(api_base: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            state: Arc::new(RwLock::new(ConnectionState {
                api_base: api_base.into(),
                auth_token: auth_token.filter(|t| !t.is_empty()),
                device_id: None,
            })),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ConnectionState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ConnectionState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn api_base(&self) -> String {
        self.read().api_base.clone()
    }

    pub fn set_api_base(&self, api_base: impl Into<String>) {
        self.write().api_base = api_base.into();
    }

    pub fn auth_token(&self) -> Option<String> {
        self.read().auth_token.clone()
    }

    pub fn set_auth_token(&self, token: Option<String>) {
        self.write().auth_token = token.filter(|t| !t.is_empty());
    }

    pub fn has_auth(&self) -> bool {
        self.read().auth_token.is_some()
    }

    pub fn device_id(&self) -> Option<DeviceId> {
        self.read().device_id.clone()
    }

    pub fn set_device_id(&self, device_id: Option<DeviceId>) {
        self.write().device_id = device_id;
    }

    /// Absolute URL for an API path such as `/sessions`.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.read().api_base.trim_end_matches('/'), path)
    }

    /// Device id and bearer headers, whichever are known.
    pub fn auth_headers(&self) -> Vec<(&'static str, String)> {
        let state = self.read();
        let mut headers = Vec::with_capacity(2);
        if let Some(device) = &state.device_id {
            headers.push((DEVICE_ID_HEADER, device.to_string()));
        }
        if let Some(token) = &state.auth_token {
            headers.push(("Authorization", format!("Bearer {}", token)));
        }
        headers
    }
}

/// The backend calls the orchestrator makes.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn register_device(&self, request: &RegisterDeviceRequest) -> Result<DeviceId>;

    async fn create_session(&self, request: &CreateSessionRequest) -> Result<SessionRecord>;

    /// `POST /sessions/{id}/start|pause|resume|stop`
    async fn session_action(&self, session: &SessionId, action: SessionAction) -> Result<()>;

    async fn session_details(&self, session: &SessionId) -> Result<SessionDetails>;

    async fn append_events(&self, session: &SessionId, events: &[Event]) -> Result<()>;

    async fn register_chunk(
        &self,
        session: &SessionId,
        request: &RegisterChunkRequest,
    ) -> Result<UploadDescriptor>;

    async fn finalize_chunk(&self, chunk: &ChunkId, request: &FinalizeChunkRequest) -> Result<()>;

    /// Ask the backend to assemble the session artifact.
    async fn rebuild_session_json(&self, session: &SessionId) -> Result<()>;
}

/// reqwest implementation of [`Backend`].
pub struct HttpBackend {
    client: reqwest::Client,
    connection: Connection,
}

impl HttpBackend {
    pub fn new(connection: Connection, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, connection })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, self.connection.url(path));
        for (name, value) in self.connection.auth_headers() {
            builder = builder.header(name, value);
        }
        if let Some(tp) = current_traceparent() {
            builder = builder.header("traceparent", tp);
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RecorderError::backend(
                Some(status.as_u16()),
                format!("API error {}: {}", status.as_u16(), body),
            ));
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder) -> Result<T> {
        let response = self.send(builder).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| RecorderError::Protocol(format!("unexpected backend response: {}", e)))
    }
}

#[async_trait]
impl Backend for HttpBackend {
    #[tracing::instrument(skip_all)]
    async fn register_device(&self, request: &RegisterDeviceRequest) -> Result<DeviceId> {
        let response: DeviceResponse = self
            .send_json(self.request(reqwest::Method::POST, "/devices").json(request))
            .await?;
        Ok(response.device_id)
    }

    #[tracing::instrument(skip_all)]
    async fn create_session(&self, request: &CreateSessionRequest) -> Result<SessionRecord> {
        let response: CreateSessionResponse = self
            .send_json(self.request(reqwest::Method::POST, "/sessions").json(request))
            .await?;
        Ok(response.session)
    }

    #[tracing::instrument(skip_all, fields(session.id = %session, action = action.as_str()))]
    async fn session_action(&self, session: &SessionId, action: SessionAction) -> Result<()> {
        let path = format!("/sessions/{}/{}", session, action.as_str());
        self.send(self.request(reqwest::Method::POST, &path)).await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(session.id = %session))]
    async fn session_details(&self, session: &SessionId) -> Result<SessionDetails> {
        let path = format!("/sessions/{}", session);
        self.send_json(self.request(reqwest::Method::GET, &path)).await
    }

    #[tracing::instrument(skip_all, fields(session.id = %session, events = events.len()))]
    async fn append_events(&self, session: &SessionId, events: &[Event]) -> Result<()> {
        let path = format!("/sessions/{}/events", session);
        self.send(
            self.request(reqwest::Method::POST, &path)
                .json(&EventBatch { events }),
        )
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(session.id = %session, chunk.index = request.idx))]
    async fn register_chunk(
        &self,
        session: &SessionId,
        request: &RegisterChunkRequest,
    ) -> Result<UploadDescriptor> {
        let path = format!("/sessions/{}/chunks", session);
        self.send_json(self.request(reqwest::Method::POST, &path).json(request))
            .await
    }

    #[tracing::instrument(skip_all, fields(chunk.id = %chunk))]
    async fn finalize_chunk(&self, chunk: &ChunkId, request: &FinalizeChunkRequest) -> Result<()> {
        let path = format!("/chunks/{}", chunk);
        self.send(self.request(reqwest::Method::PATCH, &path).json(request))
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(session.id = %session))]
    async fn rebuild_session_json(&self, session: &SessionId) -> Result<()> {
        let path = format!("/sessions/{}/session-json/rebuild", session);
        self.send(self.request(reqwest::Method::POST, &path)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use qaproto::api::DeviceMetadata;
    use qaproto::EventKind;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend_for(server: &MockServer, token: Option<&str>) -> HttpBackend {
        let connection = Connection::new(format!("{}/api/", server.uri()), token.map(String::from));
        HttpBackend::new(connection, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn url_joins_without_double_slash() {
        let conn = Connection::new("http://localhost:4000/api/", None);
        assert_eq!(conn.url("/sessions"), "http://localhost:4000/api/sessions");
        assert!(conn.auth_headers().is_empty());

        conn.set_auth_token(Some("tok".into()));
        conn.set_device_id(Some(DeviceId::from("dev")));
        assert_eq!(
            conn.auth_headers(),
            vec![
                ("x-device-id", "dev".to_string()),
                ("Authorization", "Bearer tok".to_string())
            ]
        );

        conn.set_auth_token(Some(String::new()));
        assert!(!conn.has_auth());
    }

    #[tokio::test]
    async fn register_device_sends_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/devices"))
            .and(header("Authorization", "Bearer tok"))
            .and(body_json(json!({"metadata": {"userAgent": "qa-recorder"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"device_id": "dev-9"})))
            .expect(1)
            .mount(&server)
            .await;

        let backend = backend_for(&server, Some("tok"));
        let id = backend
            .register_device(&RegisterDeviceRequest {
                metadata: DeviceMetadata {
                    user_agent: "qa-recorder".into(),
                },
            })
            .await
            .unwrap();
        assert_eq!(id, DeviceId::from("dev-9"));
    }

    #[tokio::test]
    async fn error_status_is_backend_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sessions/s1/events"))
            .respond_with(ResponseTemplate::new(500).set_body_string("down"))
            .mount(&server)
            .await;

        let backend = backend_for(&server, Some("tok"));
        let event = Event {
            ts: Utc::now(),
            kind: EventKind::Console,
            payload: json!({}),
            tab: None,
        };
        let err = backend
            .append_events(&SessionId::from("s1"), &[event])
            .await
            .unwrap_err();
        match err {
            RecorderError::BackendUnavailable { status, message } => {
                assert_eq!(status, Some(500));
                assert!(message.contains("down"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn register_chunk_returns_descriptor_with_device_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sessions/s1/chunks"))
            .and(header("x-device-id", "dev-1"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "upload_url": "http://storage.test/up",
                "upload_method": "PUT",
                "chunk": {"id": "c-7"}
            })))
            .mount(&server)
            .await;

        let backend = backend_for(&server, Some("tok"));
        backend.connection().set_device_id(Some(DeviceId::from("dev-1")));
        let now = Utc::now();
        let descriptor = backend
            .register_chunk(
                &SessionId::from("s1"),
                &RegisterChunkRequest {
                    idx: 0,
                    start_ts: now,
                    end_ts: now,
                    content_type: "video/webm".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(descriptor.upload_method, "PUT");
        assert_eq!(descriptor.chunk_id(), Some(&ChunkId::from("c-7")));
    }

    #[tokio::test]
    async fn lifecycle_and_rebuild_paths() {
        let server = MockServer::start().await;
        for p in ["/api/sessions/s1/stop", "/api/sessions/s1/session-json/rebuild"] {
            Mock::given(method("POST"))
                .and(path(p))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/api/sessions/s1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "s1", "chunks": [{"idx": 0}, {"idx": 1}]})),
            )
            .mount(&server)
            .await;

        let backend = backend_for(&server, Some("tok"));
        let sid = SessionId::from("s1");
        backend.session_action(&sid, SessionAction::Stop).await.unwrap();
        backend.rebuild_session_json(&sid).await.unwrap();
        assert_eq!(backend.session_details(&sid).await.unwrap().chunks.len(), 2);
    }
}
