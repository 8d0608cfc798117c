//! Capture coordinator.
//!
//! The capture subsystem lives out of process. Commands are sent through a
//! [`CaptureHost`]; acknowledgments come back later as [`CaptureEvent`]s and
//! are fed to [`CaptureCoordinator::on_event`]. Every wait for an
//! acknowledgment is bounded by the configured timeouts.

use crate::error::{RecorderError, Result};
use crate::waiters::Waiters;
use async_trait::async_trait;
use qaconf::CaptureConfig;
use qaproto::{CaptureCommand, CaptureEvent, SessionId, StreamRef, TabId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Transport to the capture subsystem.
#[async_trait]
pub trait CaptureHost: Send + Sync {
    /// Probe the existing capture context.
    async fn ping(&self) -> Result<()>;

    /// Create the capture context. It reports [`CaptureEvent::Ready`] once
    /// loaded.
    async fn create_context(&self) -> Result<()>;

    /// Obtain a stream handle for a tab.
    async fn acquire_stream(&self, tab: TabId) -> Result<StreamRef>;

    async fn send(&self, command: CaptureCommand) -> Result<()>;
}

/// Which source ended up recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Stream,
    Synthetic,
}

#[derive(Debug, Clone)]
pub struct CaptureStart {
    pub tab: TabId,
    pub session_id: Option<SessionId>,
    pub chunk_duration_ms: u64,
    pub chunk_start_index: u32,
    pub debug: bool,
}

type StartAck = std::result::Result<(), String>;

pub struct CaptureCoordinator {
    host: Arc<dyn CaptureHost>,
    config: CaptureConfig,
    ready: Waiters,
    stopped: Waiters,
    uploads_drained: Waiters,
    start_ack: Mutex<Option<oneshot::Sender<StartAck>>>,
    stop_requested: AtomicBool,
}

impl CaptureCoordinator {
    pub fn new(host: Arc<dyn CaptureHost>, config: CaptureConfig) -> Self {
        Self {
            host,
            config,
            ready: Waiters::new(),
            stopped: Waiters::satisfied(),
            uploads_drained: Waiters::satisfied(),
            start_ack: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Make sure a capture context is running. A context that answers the
    /// ping is left alone.
    pub async fn ensure_ready(&self) -> Result<()> {
        let ping = tokio::time::timeout(self.config.ping_timeout(), self.host.ping()).await;
        if let Ok(Ok(())) = ping {
            self.ready.resolve_all();
            return Ok(());
        }

        debug!("capture context not answering, creating one");
        self.ready.reset();
        self.host.create_context().await?;
        if !self.ready.wait(self.config.ready_timeout()).await {
            warn!(timeout_ms = self.config.ready_timeout_ms, "capture context did not report ready");
        }
        Ok(())
    }

    /// Start recording `start.tab`. Falls back to a synthetic source when
    /// the stream cannot be acquired or the subsystem refuses it.
    #[tracing::instrument(skip_all, fields(tab.id = %start.tab))]
    pub async fn start(&self, start: CaptureStart) -> Result<CaptureMode> {
        self.stop_requested.store(false, Ordering::Release);
        self.stopped.reset();
        self.uploads_drained.reset();

        self.ensure_ready().await?;

        match self.host.acquire_stream(start.tab).await {
            Ok(stream) => {
                let command = CaptureCommand::Start {
                    stream,
                    session_id: start.session_id.clone(),
                    chunk_duration_ms: start.chunk_duration_ms,
                    chunk_start_index: start.chunk_start_index,
                    debug: start.debug,
                };
                match self.command_with_ack(command).await {
                    Ok(()) => {
                        info!("capture started");
                        return Ok(CaptureMode::Stream);
                    }
                    Err(e) => warn!(error = %e, "stream capture failed, falling back to synthetic"),
                }
            }
            Err(e) => warn!(error = %e, "stream acquisition failed, falling back to synthetic"),
        }

        let command = CaptureCommand::StartFake {
            session_id: start.session_id,
            chunk_duration_ms: start.chunk_duration_ms,
            chunk_start_index: start.chunk_start_index,
            debug: start.debug,
        };
        match self.command_with_ack(command).await {
            Ok(()) => {
                info!("synthetic capture started");
                Ok(CaptureMode::Synthetic)
            }
            Err(e) => {
                self.stopped.resolve_all();
                self.uploads_drained.resolve_all();
                Err(RecorderError::CaptureAcquisitionFailed(e))
            }
        }
    }

    async fn command_with_ack(&self, command: CaptureCommand) -> std::result::Result<(), String> {
        let (tx, rx) = oneshot::channel();
        *self.start_ack.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        let name = command.name();
        self.host
            .send(command)
            .await
            .map_err(|e| format!("{} not delivered: {}", name, e))?;

        match tokio::time::timeout(self.config.start_ack_timeout(), rx).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(_)) => Err(format!("{} superseded", name)),
            Err(_) => Err(format!("{} not acknowledged", name)),
        }
    }

    /// Bind the running capture to a session.
    pub async fn set_session(&self, session: &SessionId, chunk_start_index: u32) -> Result<()> {
        self.host
            .send(CaptureCommand::SetSession {
                session_id: session.clone(),
                chunk_start_index,
            })
            .await
    }

    /// Ask the subsystem to stop. Acknowledgments arrive later.
    pub async fn stop(&self) -> Result<()> {
        self.stop_requested.store(true, Ordering::Release);
        self.host.send(CaptureCommand::Stop).await
    }

    pub async fn wait_stopped(&self) -> bool {
        let done = self.stopped.wait(self.config.stop_timeout()).await;
        if !done {
            let e = RecorderError::DrainTimeout("capture stop");
            warn!(timeout_ms = self.config.stop_timeout_ms, "{}", e);
        }
        done
    }

    pub async fn wait_uploads_drained(&self) -> bool {
        let done = self.uploads_drained.wait(self.config.uploads_timeout()).await;
        if !done {
            let e = RecorderError::DrainTimeout("capture uploads");
            warn!(timeout_ms = self.config.uploads_timeout_ms, "{}", e);
        }
        done
    }

    /// Apply an acknowledgment. Completed chunks are not handled here.
    pub fn on_event(&self, event: CaptureEvent) {
        match event {
            CaptureEvent::Ready => {
                self.ready.resolve_all();
            }
            CaptureEvent::Started { session_id } if self.stop_requested() => {
                debug!(session.id = ?session_id, "ignoring start acknowledgment after stop");
            }
            CaptureEvent::Started { .. } => self.ack_start(Ok(())),
            CaptureEvent::StartFailed { error } => self.ack_start(Err(error)),
            CaptureEvent::Stopped { session_id } => {
                debug!(session.id = ?session_id, "capture stopped");
                self.stopped.resolve_all();
            }
            CaptureEvent::UploadsDrained => {
                debug!("capture uploads drained");
                self.uploads_drained.resolve_all();
            }
            CaptureEvent::ChunkCompleted(chunk) => {
                debug!(chunk.index = chunk.index, "chunk routed past coordinator");
            }
        }
    }

    fn ack_start(&self, ack: StartAck) {
        let pending = self.start_ack.lock().unwrap_or_else(|e| e.into_inner()).take();
        match pending {
            Some(tx) => {
                let _ = tx.send(ack);
            }
            None => debug!(?ack, "start acknowledgment with no pending start"),
        }
    }
}
