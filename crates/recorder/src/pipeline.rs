//! Chunk upload pipeline.
//!
//! Every completed chunk is registered with the backend under the index the
//! capture subsystem assigned, then uploaded and, for object storage,
//! finalized. Registrations reach the backend in arrival order; uploads run
//! concurrently and may complete out of order.
//!
//! Failure handling depends on how far a chunk got:
//!
//! - registration failed: the chunk is held back and resubmitted once when
//!   the session stops;
//! - registration succeeded: the chunk is reported failed and abandoned, so
//!   the backend never sees a duplicate record and the gap stays visible.

use crate::backend::Backend;
use crate::error::{RecorderError, Result};
use crate::outbox::Outbox;
use crate::session::{ChunkClaim, SessionContext};
use crate::store::Journal;
use crate::upload::ChunkTransport;
use crate::waiters::Waiters;
use qaproto::api::{FinalizeChunkRequest, RegisterChunkRequest};
use qaproto::{ChunkId, CompletedChunk, Outbound, SessionId};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What happened to a chunk handed to [`ChunkPipeline::dispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Submitted(SessionId),
    /// A start is in flight; held until [`ChunkPipeline::session_known`].
    Held,
    /// Stale session, no session at all, or an index already used.
    Discarded,
}

enum SubmitError {
    Unregistered(RecorderError),
    Registered(RecorderError),
}

struct Inner {
    backend: Arc<dyn Backend>,
    transport: Arc<dyn ChunkTransport>,
    ctx: Arc<SessionContext>,
    journal: Arc<Journal>,
    outbox: Outbox,
    in_flight: Mutex<usize>,
    idle: Waiters,
    /// Held across a registration call. Fair, so arrival order is kept.
    register_order: tokio::sync::Mutex<()>,
    held: Mutex<Vec<CompletedChunk>>,
    deferred: Mutex<Vec<(SessionId, CompletedChunk)>>,
}

#[derive(Clone)]
pub struct ChunkPipeline {
    inner: Arc<Inner>,
}

impl ChunkPipeline {
    pub fn new(
        backend: Arc<dyn Backend>,
        transport: Arc<dyn ChunkTransport>,
        ctx: Arc<SessionContext>,
        journal: Arc<Journal>,
        outbox: Outbox,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                transport,
                ctx,
                journal,
                outbox,
                in_flight: Mutex::new(0),
                idle: Waiters::satisfied(),
                register_order: tokio::sync::Mutex::new(()),
                held: Mutex::new(Vec::new()),
                deferred: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Accept a completed chunk. Validation happens here; the upload itself
    /// runs in the background.
    pub fn dispatch(&self, chunk: CompletedChunk) -> Result<Dispatch> {
        if chunk.is_empty() {
            return Err(RecorderError::EmptyChunk(chunk.index));
        }

        let (current, starting) = {
            let state = self.inner.ctx.lock();
            (state.session_id.clone(), state.starting)
        };
        let session = match (chunk.session_id.clone(), current) {
            (Some(own), Some(current)) if own == current => own,
            (Some(own), _) => {
                debug!(session.id = %own, chunk.index = chunk.index, "discarding chunk for stale session");
                return Ok(Dispatch::Discarded);
            }
            (None, Some(current)) => current,
            (None, None) if starting => {
                debug!(chunk.index = chunk.index, "holding chunk until a session is known");
                self.held().push(chunk);
                return Ok(Dispatch::Held);
            }
            (None, None) => {
                debug!(chunk.index = chunk.index, "discarding chunk with no session");
                return Ok(Dispatch::Discarded);
            }
        };

        match self.inner.ctx.claim_chunk(&session, chunk.index, chunk.synthetic) {
            ChunkClaim::Claimed => {}
            ChunkClaim::Stale => return Ok(Dispatch::Discarded),
            ChunkClaim::Behind { next } => {
                warn!(session.id = %session, chunk.index = chunk.index, next, "chunk index out of order");
                self.inner.outbox.send(Outbound::ChunkFailed {
                    session_id: session,
                    chunk_index: chunk.index,
                    error: format!("chunk index {} out of order, expected {} or later", chunk.index, next),
                });
                return Ok(Dispatch::Discarded);
            }
        }

        self.spawn_submit(session.clone(), chunk, false);
        Ok(Dispatch::Submitted(session))
    }

    /// Release chunks that arrived before the session id was known.
    pub fn session_known(&self, session: &SessionId) -> usize {
        let held = std::mem::take(&mut *self.held());
        let count = held.len();
        for mut chunk in held {
            chunk.session_id = Some(session.clone());
            if let Err(e) = self.dispatch(chunk) {
                warn!(error = %e, "held chunk rejected");
            }
        }
        count
    }

    /// Drop chunks still waiting for a session.
    pub fn clear_held(&self) {
        let dropped = std::mem::take(&mut *self.held()).len();
        if dropped > 0 {
            warn!(dropped, "dropping chunks that never got a session");
        }
    }

    /// Resubmit chunks whose registration failed, once. Only chunks of the
    /// current session are retried.
    pub fn retry_deferred(&self) -> usize {
        let deferred = std::mem::take(&mut *self.deferred());
        let current = self.inner.ctx.session_id();
        let mut retried = 0;
        for (session, chunk) in deferred {
            if current.as_ref() != Some(&session) {
                continue;
            }
            self.spawn_submit(session, chunk, true);
            retried += 1;
        }
        retried
    }

    /// Uploads started but not finished, plus chunks held for a session.
    pub fn pending(&self) -> usize {
        *self.in_flight() + self.held().len()
    }

    /// Wait until no upload is in flight.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.inner.idle.wait(timeout).await
    }

    fn held(&self) -> std::sync::MutexGuard<'_, Vec<CompletedChunk>> {
        self.inner.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deferred(&self) -> std::sync::MutexGuard<'_, Vec<(SessionId, CompletedChunk)>> {
        self.inner.deferred.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, usize> {
        self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn_submit(&self, session: SessionId, chunk: CompletedChunk, is_retry: bool) {
        {
            let mut in_flight = self.in_flight();
            *in_flight += 1;
            self.inner.idle.reset();
        }
        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.submit(session, chunk, is_retry).await;
            pipeline.finish_one();
        });
    }

    fn finish_one(&self) {
        let mut in_flight = self.in_flight();
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            self.inner.idle.resolve_all();
        }
    }

    #[tracing::instrument(skip_all, fields(session.id = %session, chunk.index = chunk.index))]
    async fn submit(&self, session: SessionId, chunk: CompletedChunk, is_retry: bool) {
        match self.upload(&session, &chunk).await {
            Ok(chunk_id) => {
                info!(bytes = chunk.byte_size(), synthetic = chunk.synthetic, "chunk uploaded");
                self.inner.outbox.send(Outbound::ChunkUploaded {
                    session_id: session,
                    chunk_id,
                    chunk_index: chunk.index,
                    byte_size: chunk.byte_size(),
                    synthetic: chunk.synthetic,
                });
            }
            Err(SubmitError::Unregistered(e)) if !is_retry => {
                warn!(error = %e, "chunk registration failed, deferring");
                self.deferred().push((session, chunk));
            }
            Err(SubmitError::Unregistered(e)) | Err(SubmitError::Registered(e)) => {
                warn!(error = %e, "chunk failed");
                self.inner.outbox.send(Outbound::ChunkFailed {
                    session_id: session,
                    chunk_index: chunk.index,
                    error: e.to_string(),
                });
            }
        }
    }

    async fn upload(
        &self,
        session: &SessionId,
        chunk: &CompletedChunk,
    ) -> std::result::Result<Option<ChunkId>, SubmitError> {
        let request = RegisterChunkRequest {
            idx: chunk.index,
            start_ts: chunk.start_ts,
            end_ts: chunk.end_ts,
            content_type: chunk.mime_type.clone(),
        };
        let descriptor = {
            let _turn = self.inner.register_order.lock().await;
            self.inner
                .backend
                .register_chunk(session, &request)
                .await
                .map_err(SubmitError::Unregistered)?
        };
        debug!(chunk.id = ?descriptor.chunk_id(), "chunk registered");

        if self.inner.ctx.chunk_registered(session, chunk.index) {
            let next = chunk.index + 1;
            let persisted = self.inner.journal.update(|p| {
                if p.session_id.as_ref() == Some(session) {
                    p.chunk_index = p.chunk_index.max(next);
                }
            });
            if let Err(e) = persisted {
                warn!(error = %e, "failed to persist chunk index");
            }
        }

        self.inner
            .transport
            .upload(&descriptor, chunk)
            .await
            .map_err(SubmitError::Registered)?;

        if let Some((chunk_id, gcs_uri)) = descriptor.finalize_target() {
            let finalize = FinalizeChunkRequest::ready(gcs_uri, chunk.byte_size(), &chunk.mime_type);
            self.inner
                .backend
                .finalize_chunk(chunk_id, &finalize)
                .await
                .map_err(SubmitError::Registered)?;
            debug!(chunk.id = %chunk_id, "chunk marked ready");
        }

        Ok(descriptor.chunk_id().cloned())
    }
}
