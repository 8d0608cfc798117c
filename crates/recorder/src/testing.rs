//! In-process fakes for unit tests.

use crate::backend::Backend;
use crate::capture::{CaptureCoordinator, CaptureHost};
use crate::controller::{Diagnostics, TabHost};
use crate::error::{RecorderError, Result};
use crate::upload::ChunkTransport;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use qaproto::api::{
    ChunkRef, CreateSessionRequest, FinalizeChunkRequest, RegisterChunkRequest,
    RegisterDeviceRequest, SessionDetails, SessionRecord,
};
use qaproto::{
    CaptureCommand, CaptureEvent, ChunkId, CompletedChunk, DeviceId, Event, SessionAction,
    SessionId, StreamRef, TabEnvironment, TabId, TabInfo, TabMessage, UploadDescriptor,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub fn chunk(session: Option<SessionId>, index: u32) -> CompletedChunk {
    CompletedChunk {
        session_id: session,
        index,
        start_ts: Utc::now(),
        end_ts: Utc::now(),
        mime_type: "video/webm".into(),
        data: Bytes::from_static(b"webm-bytes"),
        synthetic: false,
    }
}

/// Consume one scheduled failure, if any are left.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
pub struct FakeBackend {
    pub calls: Mutex<Vec<String>>,
    pub events: Mutex<Vec<(SessionId, Vec<Event>)>>,
    registered: Mutex<Vec<(SessionId, u32)>>,
    finalized: Mutex<Vec<ChunkId>>,
    pub fail_events: AtomicUsize,
    /// Delay before answering an event batch.
    pub events_delay_ms: AtomicU64,
    pub fail_register: AtomicUsize,
    pub fail_create: AtomicBool,
    pub existing_chunks: AtomicUsize,
    sessions_created: AtomicUsize,
}

impl FakeBackend {
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn registered(&self) -> Vec<(SessionId, u32)> {
        lock(&self.registered).clone()
    }

    pub fn finalized(&self) -> Vec<ChunkId> {
        lock(&self.finalized).clone()
    }

    pub fn posted_events(&self) -> Vec<(SessionId, Vec<Event>)> {
        lock(&self.events).clone()
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn register_device(&self, _request: &RegisterDeviceRequest) -> Result<DeviceId> {
        self.record("register_device".into());
        Ok(DeviceId::from("dev-1"))
    }

    async fn create_session(&self, _request: &CreateSessionRequest) -> Result<SessionRecord> {
        self.record("create_session".into());
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RecorderError::backend(Some(503), "unavailable"));
        }
        let n = self.sessions_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionRecord {
            id: SessionId::new(format!("sess-{}", n)),
            started_at: Some(Utc::now()),
            status: Some("created".into()),
            metadata: Value::Null,
        })
    }

    async fn session_action(&self, session: &SessionId, action: SessionAction) -> Result<()> {
        self.record(format!("{}:{}", action.as_str(), session));
        Ok(())
    }

    async fn session_details(&self, session: &SessionId) -> Result<SessionDetails> {
        self.record(format!("details:{}", session));
        let n = self.existing_chunks.load(Ordering::SeqCst);
        Ok(SessionDetails {
            chunks: vec![Value::Null; n],
        })
    }

    async fn append_events(&self, session: &SessionId, events: &[Event]) -> Result<()> {
        self.record(format!("events:{}:{}", session, events.len()));
        let delay = self.events_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if take_failure(&self.fail_events) {
            return Err(RecorderError::backend(Some(500), "API error 500"));
        }
        lock(&self.events).push((session.clone(), events.to_vec()));
        Ok(())
    }

    async fn register_chunk(
        &self,
        session: &SessionId,
        request: &RegisterChunkRequest,
    ) -> Result<UploadDescriptor> {
        self.record(format!("chunk:{}:{}", session, request.idx));
        if take_failure(&self.fail_register) {
            return Err(RecorderError::backend(None, "connection reset"));
        }
        lock(&self.registered).push((session.clone(), request.idx));
        Ok(UploadDescriptor {
            upload_url: format!("https://storage.test/{}/{}", session, request.idx),
            upload_method: "PUT".into(),
            upload_headers: BTreeMap::new(),
            resumable: None,
            storage: Some("gcs".into()),
            gcs_uri: Some(format!("gs://bucket/{}/{}", session, request.idx)),
            chunk: Some(ChunkRef {
                id: ChunkId::new(format!("c-{}", request.idx)),
            }),
        })
    }

    async fn finalize_chunk(&self, chunk: &ChunkId, _request: &FinalizeChunkRequest) -> Result<()> {
        self.record(format!("finalize:{}", chunk));
        lock(&self.finalized).push(chunk.clone());
        Ok(())
    }

    async fn rebuild_session_json(&self, session: &SessionId) -> Result<()> {
        self.record(format!("rebuild:{}", session));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTransport {
    pub fail: AtomicBool,
    uploads: Mutex<Vec<(String, u32)>>,
}

impl FakeTransport {
    pub fn uploads(&self) -> Vec<(String, u32)> {
        lock(&self.uploads).clone()
    }
}

#[async_trait]
impl ChunkTransport for FakeTransport {
    async fn upload(&self, descriptor: &UploadDescriptor, chunk: &CompletedChunk) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RecorderError::ChunkUploadFailed {
                index: chunk.index,
                message: "storage returned 403".into(),
            });
        }
        lock(&self.uploads).push((descriptor.upload_url.clone(), chunk.index));
        Ok(())
    }
}

/// Capture host that records commands and acknowledges them the way the
/// real subsystem does, through the returned event channel.
pub struct FakeCaptureHost {
    pub ping_ok: AtomicBool,
    pub stream_fails: AtomicBool,
    pub real_start_fails: AtomicBool,
    pub fake_start_fails: AtomicBool,
    /// Stop answering commands.
    pub silent: AtomicBool,
    pub created: AtomicUsize,
    commands: Mutex<Vec<CaptureCommand>>,
    events: mpsc::UnboundedSender<CaptureEvent>,
}

impl FakeCaptureHost {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<CaptureEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let host = Arc::new(Self {
            ping_ok: AtomicBool::new(true),
            stream_fails: AtomicBool::new(false),
            real_start_fails: AtomicBool::new(false),
            fake_start_fails: AtomicBool::new(false),
            silent: AtomicBool::new(false),
            created: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
            events,
        });
        (host, rx)
    }

    pub fn commands(&self) -> Vec<CaptureCommand> {
        lock(&self.commands).clone()
    }

    fn emit(&self, event: CaptureEvent) {
        if !self.silent.load(Ordering::SeqCst) {
            let _ = self.events.send(event);
        }
    }
}

/// Feed acknowledgments straight into a coordinator.
pub fn pump_capture(
    mut rx: mpsc::UnboundedReceiver<CaptureEvent>,
    coordinator: Arc<CaptureCoordinator>,
) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            coordinator.on_event(event);
        }
    });
}

#[async_trait]
impl CaptureHost for FakeCaptureHost {
    async fn ping(&self) -> Result<()> {
        if self.ping_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RecorderError::Protocol("no capture context".into()))
        }
    }

    async fn create_context(&self) -> Result<()> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.emit(CaptureEvent::Ready);
        Ok(())
    }

    async fn acquire_stream(&self, tab: TabId) -> Result<StreamRef> {
        if self.stream_fails.load(Ordering::SeqCst) {
            return Err(RecorderError::CaptureAcquisitionFailed("permission denied".into()));
        }
        Ok(StreamRef::new(format!("stream-{}", tab)))
    }

    async fn send(&self, command: CaptureCommand) -> Result<()> {
        let ack = match &command {
            CaptureCommand::Start { session_id, .. } => {
                if self.real_start_fails.load(Ordering::SeqCst) {
                    vec![CaptureEvent::StartFailed {
                        error: "NotAllowedError".into(),
                    }]
                } else {
                    vec![CaptureEvent::Started {
                        session_id: session_id.clone(),
                    }]
                }
            }
            CaptureCommand::StartFake { session_id, .. } => {
                if self.fake_start_fails.load(Ordering::SeqCst) {
                    vec![CaptureEvent::StartFailed {
                        error: "canvas unavailable".into(),
                    }]
                } else {
                    vec![CaptureEvent::Started {
                        session_id: session_id.clone(),
                    }]
                }
            }
            CaptureCommand::Stop => vec![
                CaptureEvent::Stopped { session_id: None },
                CaptureEvent::UploadsDrained,
            ],
            CaptureCommand::SetSession { .. } => Vec::new(),
        };
        lock(&self.commands).push(command);
        for event in ack {
            self.emit(event);
        }
        Ok(())
    }
}

pub struct FakeTabs {
    pub active: Mutex<Option<TabInfo>>,
    messages: Mutex<Vec<(TabId, TabMessage)>>,
    pub unreachable: AtomicBool,
}

impl Default for FakeTabs {
    fn default() -> Self {
        Self {
            active: Mutex::new(Some(TabInfo {
                id: TabId(7),
                url: Some("https://app.test/checkout".into()),
                title: Some("Checkout".into()),
            })),
            messages: Mutex::new(Vec::new()),
            unreachable: AtomicBool::new(false),
        }
    }
}

impl FakeTabs {
    pub fn messages(&self) -> Vec<(TabId, TabMessage)> {
        lock(&self.messages).clone()
    }
}

#[async_trait]
impl TabHost for FakeTabs {
    async fn active_tab(&self) -> Result<Option<TabInfo>> {
        Ok(lock(&self.active).clone())
    }

    async fn tab(&self, id: TabId) -> Result<Option<TabInfo>> {
        Ok(lock(&self.active).clone().filter(|t| t.id == id))
    }

    async fn environment(&self, _id: TabId) -> Result<Option<TabEnvironment>> {
        Ok(Some(TabEnvironment {
            platform: Some("Linux".into()),
            language: Some("en-US".into()),
            user_agent: Some("FakeBrowser/1.0".into()),
            ..Default::default()
        }))
    }

    async fn send(&self, tab: TabId, message: TabMessage) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RecorderError::Protocol("no receiving end".into()));
        }
        lock(&self.messages).push((tab, message));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDiagnostics {
    pub fail_attach: AtomicBool,
    pub attached: AtomicUsize,
    pub detached: AtomicUsize,
    /// Milliseconds each detach takes.
    pub detach_delay_ms: AtomicU64,
}

#[async_trait]
impl Diagnostics for FakeDiagnostics {
    async fn attach(&self, _tab: TabId) -> Result<()> {
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(RecorderError::DiagnosticsAttachFailed(
                "another debugger is attached".into(),
            ));
        }
        self.attached.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn detach(&self, _tab: TabId) -> Result<()> {
        let delay = self.detach_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.detached.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
