//! Session state machine.
//!
//! ```text
//! idle ──start──▶ recording ──pause──▶ paused
//!                   ▲   │                │
//!                   └───┼────resume──────┘
//!                       ▼                │
//!                     ended ◀────stop────┘
//! ```
//!
//! [`Recorder`] is the only writer of lifecycle fields in the
//! [`SessionContext`]. Start is all-or-nothing: if capture or diagnostics
//! cannot be brought up the recorder is left as it was. Stop always
//! completes; drain failures are logged and unflushed events are journaled.

use crate::backend::{Backend, Connection};
use crate::batcher::EventBatcher;
use crate::capture::{CaptureCoordinator, CaptureHost, CaptureStart};
use crate::error::{RecorderError, Result};
use crate::idle::IdleMonitor;
use crate::outbox::Outbox;
use crate::pipeline::ChunkPipeline;
use crate::session::{SessionContext, SessionState};
use crate::store::{Journal, StateStore};
use crate::tasks::{spawn_flush_task, spawn_idle_task, SessionTasks};
use crate::upload::ChunkTransport;
use async_trait::async_trait;
use chrono::Utc;
use qaconf::BootstrapConfig;
use qaproto::api::{
    CreateSessionRequest, DeviceMetadata, RegisterDeviceRequest, SessionMetadata,
};
use qaproto::{
    CaptureEvent, CompletedChunk, EventKind, Frame, Inbound, Outbound, RawEvent, RecorderSnapshot,
    RequestId, SessionAction, SessionId, SessionStatus, SessionSummary, StartOverrides,
    StatusValue, TabEnvironment, TabId, TabInfo, TabMessage,
};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Identifies the recorder to the backend when the page reports no user agent.
pub const USER_AGENT: &str = concat!("qa-recorder/", env!("CARGO_PKG_VERSION"));

/// Browser tabs.
#[async_trait]
pub trait TabHost: Send + Sync {
    async fn active_tab(&self) -> Result<Option<TabInfo>>;

    async fn tab(&self, id: TabId) -> Result<Option<TabInfo>>;

    /// Environment snapshot from the tab's page script.
    async fn environment(&self, id: TabId) -> Result<Option<TabEnvironment>>;

    async fn send(&self, tab: TabId, message: TabMessage) -> Result<()>;
}

/// Console and network listener on a tab.
#[async_trait]
pub trait Diagnostics: Send + Sync {
    async fn attach(&self, tab: TabId) -> Result<()>;
    async fn detach(&self, tab: TabId) -> Result<()>;
}

/// External collaborators the recorder drives.
pub struct RecorderParts {
    pub backend: Arc<dyn Backend>,
    pub transport: Arc<dyn ChunkTransport>,
    pub capture: Arc<dyn CaptureHost>,
    pub tabs: Arc<dyn TabHost>,
    pub diagnostics: Arc<dyn Diagnostics>,
    pub store: Arc<dyn StateStore>,
}

struct Inner {
    config: BootstrapConfig,
    connection: Connection,
    backend: Arc<dyn Backend>,
    tabs: Arc<dyn TabHost>,
    diagnostics: Arc<dyn Diagnostics>,
    ctx: Arc<SessionContext>,
    journal: Arc<Journal>,
    batcher: EventBatcher,
    pipeline: ChunkPipeline,
    capture: CaptureCoordinator,
    idle: Arc<IdleMonitor>,
    tasks: Mutex<SessionTasks>,
    outbox: Outbox,
}

#[derive(Clone)]
pub struct Recorder {
    inner: Arc<Inner>,
}

impl Recorder {
    /// Build a recorder and restore persisted state. A session that was
    /// recording when the process went away comes back paused, since its
    /// capture did not survive.
    pub fn new(
        config: BootstrapConfig,
        connection: Connection,
        parts: RecorderParts,
        outbox: Outbox,
    ) -> Result<Self> {
        let journal = Arc::new(Journal::open(
            parts.store,
            config.recording.recent_sessions_limit,
        )?);
        let persisted = journal.state();

        if let Some(base) = persisted.api_base.as_deref().filter(|b| !b.is_empty()) {
            connection.set_api_base(base);
        }
        if !connection.has_auth() {
            connection.set_auth_token(persisted.auth_token.clone());
        }
        connection.set_device_id(persisted.device_id.clone());

        let mut state = SessionState {
            device_id: persisted.device_id.clone(),
            session_id: persisted.session_id.clone(),
            status: persisted.status,
            chunk_index: persisted.chunk_index,
            tab: persisted.tab.clone(),
            auto_paused: persisted.auto_paused,
            debug: persisted.debug || config.recording.debug,
            chunk_duration_ms: config.recording.chunk_duration_ms,
            last_error: persisted.last_error.clone(),
            last_transition: persisted.last_transition.clone(),
            ..Default::default()
        };
        match (state.status, state.session_id.is_some()) {
            (SessionStatus::Recording | SessionStatus::Ended, true) => {
                state.transition(SessionStatus::Paused, "recorder restarted", Utc::now());
            }
            (SessionStatus::Recording | SessionStatus::Paused, false) => {
                state.transition(SessionStatus::Idle, "recorder restarted", Utc::now());
            }
            _ => {}
        }
        journal.record_session(&state)?;

        let ctx = Arc::new(SessionContext::new(state));
        let batcher = EventBatcher::new(parts.backend.clone(), ctx.clone(), journal.clone());
        let pipeline = ChunkPipeline::new(
            parts.backend.clone(),
            parts.transport,
            ctx.clone(),
            journal.clone(),
            outbox.clone(),
        );
        let capture = CaptureCoordinator::new(parts.capture, config.capture.clone());
        let idle = Arc::new(IdleMonitor::new(config.idle.clone()));

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connection,
                backend: parts.backend,
                tabs: parts.tabs,
                diagnostics: parts.diagnostics,
                ctx,
                journal,
                batcher,
                pipeline,
                capture,
                idle,
                tasks: Mutex::new(SessionTasks::default()),
                outbox,
            }),
        })
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.inner.ctx
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.inner.journal
    }

    pub fn batcher(&self) -> &EventBatcher {
        &self.inner.batcher
    }

    pub fn pipeline(&self) -> &ChunkPipeline {
        &self.inner.pipeline
    }

    fn tasks(&self) -> MutexGuard<'_, SessionTasks> {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self) {
        let state = self.inner.ctx.snapshot();
        if let Err(e) = self.inner.journal.record_session(&state) {
            warn!(error = %e, "failed to persist recorder state");
        }
    }

    /// Log a diagnostic line; in debug mode also forward it to the browser.
    fn note(&self, message: &str, detail: Value) {
        debug!(%detail, "{}", message);
        if self.inner.ctx.debug() {
            self.inner.outbox.debug_log(message, detail);
        }
    }

    // ========================================================================
    // Start / resume
    // ========================================================================

    /// Begin recording the active tab, or resume the paused session.
    #[tracing::instrument(skip_all)]
    pub async fn start(&self, overrides: StartOverrides) -> Result<()> {
        self.apply_overrides(overrides);

        if !self.inner.connection.has_auth() {
            return Err(RecorderError::AuthMissing);
        }

        let resuming = {
            let mut state = self.inner.ctx.lock();
            if state.starting || state.pausing || state.stopping {
                return Err(RecorderError::InvalidTransition {
                    action: "start",
                    status: state.status,
                });
            }
            let resuming = match state.status {
                SessionStatus::Paused if state.session_id.is_some() => true,
                SessionStatus::Recording => {
                    return Err(RecorderError::InvalidTransition {
                        action: "start",
                        status: state.status,
                    })
                }
                _ => false,
            };
            state.starting = true;
            resuming
        };

        let result = self.start_sequence(resuming).await;

        {
            let mut state = self.inner.ctx.lock();
            state.starting = false;
            if let Err(e) = &result {
                state.last_error = Some(e.to_string());
            }
        }
        self.persist();
        if let Err(e) = &result {
            warn!(error = %e, resuming, "start failed");
            self.note("start failed", json!({ "error": e.to_string() }));
        }
        result
    }

    /// Resume the paused session.
    pub async fn resume(&self) -> Result<()> {
        let status = self.inner.ctx.status();
        if status != SessionStatus::Paused {
            return Err(RecorderError::InvalidTransition {
                action: "resume",
                status,
            });
        }
        self.start(StartOverrides::default()).await
    }

    fn apply_overrides(&self, overrides: StartOverrides) {
        if let Some(base) = overrides.api_base.filter(|b| !b.is_empty()) {
            self.inner.connection.set_api_base(base.clone());
            if let Err(e) = self.inner.journal.update(|p| p.api_base = Some(base)) {
                warn!(error = %e, "failed to persist api base");
            }
        }
        let mut state = self.inner.ctx.lock();
        if let Some(debug) = overrides.debug {
            state.debug = debug;
        }
        if let Some(ms) = overrides.chunk_duration_ms.filter(|ms| *ms > 0) {
            state.chunk_duration_ms = ms;
        }
    }

    async fn start_sequence(&self, resuming: bool) -> Result<()> {
        let tab = self.target_tab(resuming).await?;
        let env = match self.inner.tabs.environment(tab.id).await {
            Ok(env) => env,
            Err(e) => {
                debug!(error = %e, "tab environment unavailable");
                None
            }
        };
        self.note("start recording", json!({ "tabId": tab.id, "url": tab.url }));

        self.ensure_device().await?;

        let (session, chunk_index) = if resuming {
            self.resume_backend_session().await?
        } else {
            self.create_backend_session(&tab, env.as_ref()).await?
        };

        let (chunk_duration_ms, debug) = {
            let mut state = self.inner.ctx.lock();
            state.session_id = Some(session.clone());
            state.reset_chunks(chunk_index);
            state.tab = Some(tab.clone());
            (state.chunk_duration_ms, state.debug)
        };

        let capture_start = CaptureStart {
            tab: tab.id,
            session_id: Some(session.clone()),
            chunk_duration_ms,
            chunk_start_index: chunk_index,
            debug,
        };
        let mode = match self.inner.capture.start(capture_start).await {
            Ok(mode) => mode,
            Err(e) => {
                self.roll_back(&session, resuming).await;
                return Err(e);
            }
        };
        self.note("capture started", json!({ "mode": format!("{:?}", mode) }));

        if let Err(e) = self.inner.diagnostics.attach(tab.id).await {
            if let Err(stop_err) = self.inner.capture.stop().await {
                warn!(error = %stop_err, "failed to stop capture during rollback");
            }
            self.roll_back(&session, resuming).await;
            return Err(match e {
                RecorderError::DiagnosticsAttachFailed(_) => e,
                other => RecorderError::DiagnosticsAttachFailed(other.to_string()),
            });
        }

        if let Err(e) = self.inner.capture.set_session(&session, chunk_index).await {
            warn!(error = %e, "failed to bind capture to session");
        }
        self.inner.pipeline.session_known(&session);

        {
            let mut state = self.inner.ctx.lock();
            let reason = if resuming { "resume" } else { "start" };
            state.transition(SessionStatus::Recording, reason, Utc::now());
            state.auto_paused = false;
            state.last_error = None;
        }
        self.inner.idle.touch();
        self.persist();

        if let Err(e) = self.inner.tabs.send(tab.id, TabMessage::HideResumePrompt).await {
            debug!(error = %e, "resume prompt not hidden");
        }

        let env = env.unwrap_or_default();
        self.inner.batcher.enqueue(RawEvent::new(
            EventKind::Env,
            json!({
                "url": tab.url,
                "title": tab.title,
                "viewport": env.viewport,
                "screen": env.screen,
                "platform": env.platform,
                "language": env.language,
                "userAgent": env.user_agent.as_deref().unwrap_or(USER_AGENT),
                "userAgentData": env.user_agent_data,
            }),
        ));
        self.inner.batcher.trigger();

        self.spawn_tasks();
        self.inner.outbox.send(Outbound::Status {
            value: StatusValue::Recording,
        });
        info!(session.id = %session, chunk_index, resuming, "recording");
        Ok(())
    }

    async fn target_tab(&self, resuming: bool) -> Result<TabInfo> {
        if resuming {
            if let Some(id) = self.inner.ctx.snapshot().tab_id() {
                if let Ok(Some(tab)) = self.inner.tabs.tab(id).await {
                    return Ok(tab);
                }
            }
        }
        self.inner
            .tabs
            .active_tab()
            .await?
            .ok_or(RecorderError::NoActiveTab)
    }

    async fn ensure_device(&self) -> Result<()> {
        if self.inner.connection.device_id().is_some() {
            return Ok(());
        }
        let request = RegisterDeviceRequest {
            metadata: DeviceMetadata {
                user_agent: USER_AGENT.to_string(),
            },
        };
        let device = self.inner.backend.register_device(&request).await?;
        info!(device.id = %device, "device registered");
        self.inner.connection.set_device_id(Some(device.clone()));
        self.inner.ctx.lock().device_id = Some(device);
        self.persist();
        Ok(())
    }

    async fn resume_backend_session(&self) -> Result<(SessionId, u32)> {
        let (session, known_index) = {
            let state = self.inner.ctx.lock();
            let session = state.session_id.clone().ok_or(RecorderError::NotRecording)?;
            (session, state.chunk_index)
        };
        self.inner
            .backend
            .session_action(&session, SessionAction::Resume)
            .await?;
        let details = self.inner.backend.session_details(&session).await?;
        let chunk_index = if details.chunks.is_empty() {
            known_index
        } else {
            details.chunks.len() as u32
        };
        if let Err(e) = self
            .inner
            .journal
            .update_recent(&session, SessionStatus::Recording, None)
        {
            warn!(error = %e, "failed to update recent sessions");
        }
        Ok((session, chunk_index))
    }

    async fn create_backend_session(
        &self,
        tab: &TabInfo,
        env: Option<&TabEnvironment>,
    ) -> Result<(SessionId, u32)> {
        let replayed = self.inner.batcher.replay_persisted().await;
        if replayed > 0 {
            info!(sessions = replayed, "delivered events from earlier sessions");
        }
        self.inner.batcher.reset();

        let metadata = SessionMetadata::from_tab(tab.url.clone(), tab.title.clone(), env, USER_AGENT);
        let record = self
            .inner
            .backend
            .create_session(&CreateSessionRequest { metadata })
            .await?;
        self.inner
            .backend
            .session_action(&record.id, SessionAction::Start)
            .await?;

        let summary = SessionSummary {
            id: record.id.clone(),
            url: tab.url.clone(),
            title: tab.title.clone(),
            started_at: record.started_at.unwrap_or_else(Utc::now),
            status: SessionStatus::Recording.as_str().to_string(),
            ended_at: None,
            metadata: record.metadata,
        };
        if let Err(e) = self.inner.journal.add_recent(summary) {
            warn!(error = %e, "failed to record recent session");
        }
        Ok((record.id, 0))
    }

    /// Undo a failed start. A failed resume keeps the paused session and
    /// pauses it again on the backend; a failed new start stops the backend
    /// session and forgets it.
    async fn roll_back(&self, session: &SessionId, resuming: bool) {
        {
            let mut state = self.inner.ctx.lock();
            if resuming {
                state.chunks_received = 0;
            } else {
                state.session_id = None;
                state.reset_chunks(0);
                state.tab = None;
            }
        }
        let action = if resuming {
            SessionAction::Pause
        } else {
            self.inner.pipeline.clear_held();
            SessionAction::Stop
        };
        if let Err(e) = self.inner.backend.session_action(session, action).await {
            warn!(error = %e, ?action, "backend rollback failed");
        }
        if !resuming {
            if let Err(e) =
                self.inner
                    .journal
                    .update_recent(session, SessionStatus::Ended, Some(Utc::now()))
            {
                warn!(error = %e, "failed to update recent sessions");
            }
        }
        warn!(session.id = %session, resuming, "start rolled back");
    }

    fn spawn_tasks(&self) {
        let token = self.tasks().begin();
        spawn_flush_task(
            self.inner.batcher.clone(),
            self.inner.config.recording.flush_interval(),
            token.clone(),
        );
        if self.inner.idle.watches_idle() {
            let recorder = self.clone();
            spawn_idle_task(
                self.inner.idle.clone(),
                self.inner.ctx.clone(),
                token,
                move || async move {
                    if let Err(e) = recorder.auto_pause("Idle timeout", None).await {
                        warn!(error = %e, "idle auto-pause failed");
                    }
                },
            );
        }
    }

    // ========================================================================
    // Pause
    // ========================================================================

    /// Pause at the user's request.
    pub async fn pause(&self) -> Result<()> {
        self.pause_with(false, "paused by user").await
    }

    /// Pause on a policy trigger: record a marker, pause, and offer the user
    /// a resume prompt on `prompt_tab` (or the active tab).
    pub async fn auto_pause(&self, reason: &str, prompt_tab: Option<TabId>) -> Result<()> {
        self.inner.batcher.enqueue(RawEvent::new(
            EventKind::Marker,
            json!({ "message": format!("Auto-paused: {}", reason) }),
        ));
        self.pause_with(true, reason).await?;

        let mut tab = None;
        if let Some(id) = prompt_tab {
            tab = self.inner.tabs.tab(id).await.ok().flatten();
        }
        if tab.is_none() {
            tab = self.inner.tabs.active_tab().await.ok().flatten();
        }
        if let Some(tab) = tab {
            let prompt = TabMessage::ShowResumePrompt {
                reason: reason.to_string(),
            };
            if let Err(e) = self.inner.tabs.send(tab.id, prompt).await {
                debug!(error = %e, "resume prompt not shown");
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(auto = auto, reason = reason))]
    async fn pause_with(&self, auto: bool, reason: &str) -> Result<()> {
        let (session, tab) = {
            let mut state = self.inner.ctx.lock();
            if state.status != SessionStatus::Recording
                || state.starting
                || state.pausing
                || state.stopping
            {
                return Err(RecorderError::InvalidTransition {
                    action: "pause",
                    status: state.status,
                });
            }
            let Some(session) = state.session_id.clone() else {
                return Err(RecorderError::NotRecording);
            };
            state.transition(SessionStatus::Paused, reason, Utc::now());
            state.auto_paused = auto;
            state.pausing = true;
            (session, state.tab_id())
        };
        self.tasks().cancel_all();
        self.persist();
        self.note("pausing recording", json!({ "sessionId": session, "autoPaused": auto }));

        if let Some(tab) = tab {
            if let Err(e) = self.inner.diagnostics.detach(tab).await {
                warn!(error = %e, "diagnostics detach failed");
            }
        }
        if let Err(e) = self.inner.capture.stop().await {
            warn!(error = %e, "capture stop failed");
        }
        if let Err(e) = self.inner.batcher.flush(true).await {
            warn!(error = %e, "flush on pause failed");
        }

        let result = self
            .inner
            .backend
            .session_action(&session, SessionAction::Pause)
            .await;
        self.inner.ctx.lock().pausing = false;
        if let Err(e) = self
            .inner
            .journal
            .update_recent(&session, SessionStatus::Paused, None)
        {
            warn!(error = %e, "failed to update recent sessions");
        }
        self.inner.outbox.send(Outbound::Status {
            value: StatusValue::Paused,
        });
        info!(session.id = %session, auto, "paused");
        result
    }

    // ========================================================================
    // Stop
    // ========================================================================

    /// End the session. A stop already in progress makes this a no-op, as
    /// does having no session.
    #[tracing::instrument(skip_all)]
    pub async fn stop(&self) -> Result<()> {
        let (session, was_recording, tab) = {
            let mut state = self.inner.ctx.lock();
            if state.stopping {
                debug!("stop already in progress");
                return Ok(());
            }
            if state.starting {
                return Err(RecorderError::InvalidTransition {
                    action: "stop",
                    status: state.status,
                });
            }
            let Some(session) = state.session_id.clone() else {
                return Ok(());
            };
            let was_recording = state.status == SessionStatus::Recording;
            state.stopping = true;
            state.auto_paused = false;
            state.transition(SessionStatus::Ended, "stopped", Utc::now());
            (session, was_recording, state.tab_id())
        };
        self.tasks().cancel_all();
        self.persist();
        self.note("stopping recording", json!({ "sessionId": session }));

        self.drain_and_finalize(&session, was_recording, tab).await;

        {
            let mut state = self.inner.ctx.lock();
            state.session_id = None;
            state.reset_chunks(0);
            state.tab = None;
            state.stopping = false;
        }
        self.inner.pipeline.clear_held();
        self.persist();
        if let Err(e) =
            self.inner
                .journal
                .update_recent(&session, SessionStatus::Ended, Some(Utc::now()))
        {
            warn!(error = %e, "failed to update recent sessions");
        }

        self.inner.outbox.send(Outbound::Status {
            value: StatusValue::Stopped,
        });
        info!(session.id = %session, "recording stopped");
        Ok(())
    }

    async fn drain_and_finalize(&self, session: &SessionId, was_recording: bool, tab: Option<TabId>) {
        let inner = &self.inner;

        if was_recording {
            if let Some(tab) = tab {
                if let Err(e) = inner.diagnostics.detach(tab).await {
                    warn!(error = %e, "diagnostics detach failed");
                }
            }
            if let Err(e) = inner.capture.stop().await {
                warn!(error = %e, "capture stop failed");
            }
            inner.capture.wait_stopped().await;
        }
        inner.capture.wait_uploads_drained().await;

        let retried = inner.pipeline.retry_deferred();
        if retried > 0 {
            info!(retried, "resubmitting chunks whose registration failed");
        }
        let uploads_timeout = inner.config.capture.uploads_timeout();
        if !inner.pipeline.wait_idle(uploads_timeout).await {
            warn!(pending = inner.pipeline.pending(), "{}", RecorderError::DrainTimeout("chunk uploads"));
        }

        let (received, next_index) = {
            let state = inner.ctx.lock();
            (state.chunks_received, state.chunk_index)
        };
        if received == 0 && next_index == 0 {
            self.note("creating synthetic chunk", json!({ "sessionId": session }));
            let synthetic = CompletedChunk::synthetic(session.clone(), next_index, Utc::now());
            match inner.pipeline.dispatch(synthetic) {
                Ok(_) => {
                    if !inner.pipeline.wait_idle(uploads_timeout).await {
                        warn!("{}", RecorderError::DrainTimeout("synthetic chunk"));
                    }
                }
                Err(e) => warn!(error = %e, "synthetic chunk rejected"),
            }
        }

        let recording = &inner.config.recording;
        if !inner
            .batcher
            .flush_with_retry(recording.stop_flush_attempts, recording.stop_flush_delay())
            .await
        {
            warn!(queued = inner.batcher.len(), "events not flushed before stop");
        }
        inner.batcher.seal_and_persist(session);

        if let Err(e) = inner.backend.rebuild_session_json(session).await {
            warn!(error = %e, "session artifact rebuild failed");
        }
        if let Err(e) = inner.backend.session_action(session, SessionAction::Stop).await {
            warn!(error = %e, "backend stop failed");
        }
    }

    // ========================================================================
    // Markers, annotations, auth
    // ========================================================================

    /// Ask the page to open its marker UI, or record a plain marker if the
    /// page cannot be reached.
    pub async fn add_marker(&self) -> Result<()> {
        if !self.inner.ctx.is_recording() {
            return Err(RecorderError::NotRecording);
        }
        let tab = self.ui_tab().await?;
        if let Err(e) = self.inner.tabs.send(tab.id, TabMessage::OpenMarker).await {
            debug!(error = %e, "marker UI unavailable, recording plain marker");
            let url = tab
                .url
                .clone()
                .or_else(|| self.inner.ctx.snapshot().tab.and_then(|t| t.url));
            if self.inner.batcher.enqueue(RawEvent::new(
                EventKind::Marker,
                json!({ "label": "Marker", "url": url }),
            )) {
                self.inner.batcher.trigger();
            }
            if let Err(e) = self.inner.tabs.send(tab.id, TabMessage::MarkerToast).await {
                debug!(error = %e, "marker toast not shown");
            }
        }
        Ok(())
    }

    pub async fn open_annotation(&self) -> Result<()> {
        if !self.inner.ctx.is_recording() {
            return Err(RecorderError::NotRecording);
        }
        let tab = self.ui_tab().await?;
        self.inner.tabs.send(tab.id, TabMessage::OpenAnnotation).await
    }

    /// The recorded tab if it still exists, else the active tab.
    async fn ui_tab(&self) -> Result<TabInfo> {
        if let Some(id) = self.inner.ctx.snapshot().tab_id() {
            if let Ok(Some(tab)) = self.inner.tabs.tab(id).await {
                return Ok(tab);
            }
        }
        self.inner
            .tabs
            .active_tab()
            .await?
            .ok_or(RecorderError::NoActiveTab)
    }

    pub fn set_auth(&self, token: Option<String>) -> Result<()> {
        let token = token.filter(|t| !t.is_empty());
        self.inner.connection.set_auth_token(token.clone());
        self.inner.journal.update(|p| p.auth_token = token)
    }

    pub fn snapshot(&self) -> RecorderSnapshot {
        let state = self.inner.ctx.snapshot();
        RecorderSnapshot {
            status: state.status,
            session_id: state.session_id.clone(),
            device_id: state.device_id.clone(),
            tab_id: state.tab_id(),
            chunk_index: state.chunk_index,
            queued_events: self.inner.batcher.len(),
            pending_uploads: self.inner.pipeline.pending(),
            auto_paused: state.auto_paused,
            debug: state.debug,
            has_auth: self.inner.connection.has_auth(),
            last_error: state.last_error,
            last_transition: state.last_transition,
            recent_sessions: self.inner.journal.state().recent_sessions,
        }
    }

    /// Stop any held session; used on process shutdown.
    pub async fn shutdown(&self) {
        if self.inner.ctx.status().is_active() {
            if let Err(e) = self.stop().await {
                warn!(error = %e, "stop during shutdown failed");
            }
        }
        self.tasks().cancel_all();
    }

    // ========================================================================
    // Inbound dispatch
    // ========================================================================

    /// Route one inbound message. Quick messages are applied in place, so
    /// events keep their arrival order; lifecycle commands run on their own
    /// task and answer through the outbox.
    pub fn handle(&self, frame: Frame<Inbound>) {
        let Frame { id, message } = frame;
        let inner = &self.inner;

        match message {
            Inbound::Start(overrides) => {
                self.spawn_command(id, |r| async move { r.start(overrides).await })
            }
            Inbound::ResumeRequest => {
                self.spawn_command(id, |r| async move { r.start(StartOverrides::default()).await })
            }
            Inbound::Pause => self.spawn_command(id, |r| async move { r.pause().await }),
            Inbound::Resume => self.spawn_command(id, |r| async move { r.resume().await }),
            Inbound::Stop => self.spawn_command(id, |r| async move { r.stop().await }),
            Inbound::AddMarker => self.spawn_command(id, |r| async move { r.add_marker().await }),
            Inbound::Annotate => {
                self.spawn_command(id, |r| async move { r.open_annotation().await })
            }
            Inbound::GetState => {
                let reply = match serde_json::to_value(self.snapshot()) {
                    Ok(value) => Outbound::ok(value),
                    Err(e) => Outbound::error(e.to_string()),
                };
                inner.outbox.reply(id, reply);
            }
            Inbound::SetAuth { token } => {
                let result = self.set_auth(token);
                self.respond(id, result);
            }
            Inbound::Interaction { event } => {
                inner.idle.touch();
                self.record(event);
            }
            Inbound::Activity => inner.idle.touch(),
            Inbound::MarkerSubmit { payload } => {
                self.record(RawEvent::new(EventKind::Marker, payload).at(Utc::now()));
            }
            Inbound::AnnotationSubmit { payload } => {
                self.record(RawEvent::new(EventKind::Annotation, payload).at(Utc::now()));
            }
            Inbound::DebugLog { payload } => {
                if inner.ctx.debug() {
                    let message = payload
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("debug")
                        .to_string();
                    let detail = payload.get("detail").cloned().unwrap_or(Value::Null);
                    inner.outbox.send(Outbound::DebugLog { message, detail });
                }
            }
            Inbound::TabActivated { tab_id } => self.on_tab_activated(tab_id),
            Inbound::Diagnostic { tab_id, entry } => {
                let state = inner.ctx.snapshot();
                if state.status == SessionStatus::Recording && state.tab_id() == Some(tab_id) {
                    self.record(entry.into_raw_event());
                }
            }
            Inbound::Capture(CaptureEvent::ChunkCompleted(chunk)) => {
                let index = chunk.index;
                match inner.pipeline.dispatch(chunk) {
                    Ok(outcome) => debug!(chunk.index = index, ?outcome, "chunk accepted"),
                    Err(e) => warn!(chunk.index = index, error = %e, "chunk rejected"),
                }
            }
            Inbound::Capture(event) => inner.capture.on_event(event),
            Inbound::Reply { .. } => debug!("reply with no pending request"),
        }
    }

    fn record(&self, event: RawEvent) {
        if self.inner.batcher.enqueue(event) {
            self.inner.batcher.trigger();
        }
    }

    fn on_tab_activated(&self, tab_id: TabId) {
        if !self.inner.idle.pauses_on_tab_switch() {
            return;
        }
        let state = self.inner.ctx.snapshot();
        if state.status != SessionStatus::Recording || state.tab_id() == Some(tab_id) {
            return;
        }
        let recorder = self.clone();
        tokio::spawn(async move {
            if let Err(e) = recorder.auto_pause("Tab switched", Some(tab_id)).await {
                warn!(error = %e, "tab-switch auto-pause failed");
            }
        });
    }

    fn respond(&self, id: Option<RequestId>, result: Result<()>) {
        let reply = match result {
            Ok(()) => Outbound::ok(Value::Null),
            Err(e) => Outbound::error(e.to_string()),
        };
        self.inner.outbox.reply(id, reply);
    }

    fn spawn_command<F, Fut>(&self, id: Option<RequestId>, command: F)
    where
        F: FnOnce(Recorder) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let recorder = self.clone();
        tokio::spawn(async move {
            let result = command(recorder.clone()).await;
            recorder.respond(id, result);
        });
    }
}
