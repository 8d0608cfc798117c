//! Event batching.
//!
//! Events for the recording session queue up here and go to the backend in
//! batches. Only one batch is ever in flight; a failed batch goes back to the
//! front of the queue in its original order. Once a session has been sealed
//! at stop time, anything that still cannot be delivered is written to the
//! journal under its session id and replayed before the next session starts.

use crate::backend::Backend;
use crate::error::Result;
use crate::session::SessionContext;
use crate::store::Journal;
use chrono::Utc;
use qaproto::{Event, RawEvent, SessionId, SessionStatus};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing to send, or no session.
    Empty,
    /// Not recording and not forced.
    Skipped,
    /// Another flush holds the slot.
    InFlight,
    Flushed(usize),
}

/// Clears the in-flight flag when the flush ends, however it ends.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    backend: Arc<dyn Backend>,
    ctx: Arc<SessionContext>,
    journal: Arc<Journal>,
    queue: Mutex<VecDeque<Event>>,
    in_flight: AtomicBool,
    sealed: AtomicBool,
}

#[derive(Clone)]
pub struct EventBatcher {
    inner: Arc<Inner>,
}

impl EventBatcher {
    pub fn new(backend: Arc<dyn Backend>, ctx: Arc<SessionContext>, journal: Arc<Journal>) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                ctx,
                journal,
                queue: Mutex::new(VecDeque::new()),
                in_flight: AtomicBool::new(false),
                sealed: AtomicBool::new(false),
            }),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.inner.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }

    /// Queue an event for the recording session, stamping it with the
    /// current time if it has none and with the recorded tab. Returns false
    /// (and drops the event) when nothing is recording.
    pub fn enqueue(&self, raw: RawEvent) -> bool {
        let state = self.inner.ctx.lock();
        if state.status != SessionStatus::Recording || state.session_id.is_none() {
            debug!(kind = raw.kind.as_str(), "event dropped (not recording)");
            return false;
        }
        let event = Event::normalize(raw, Utc::now(), state.tab_context());
        self.queue().push_back(event);
        true
    }

    /// Flush in the background, ignoring the outcome.
    pub fn trigger(&self) {
        let batcher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = batcher.flush(false).await {
                debug!(error = %e, "background flush failed");
            }
        });
    }

    /// Send the whole queue as one batch.
    #[tracing::instrument(skip_all, fields(force = force))]
    pub async fn flush(&self, force: bool) -> Result<FlushOutcome> {
        let session = {
            let state = self.inner.ctx.lock();
            let Some(session) = state.session_id.clone() else {
                return Ok(FlushOutcome::Empty);
            };
            if !force && state.status != SessionStatus::Recording {
                return Ok(FlushOutcome::Skipped);
            }
            session
        };

        if self.inner.in_flight.swap(true, Ordering::AcqRel) {
            return Ok(FlushOutcome::InFlight);
        }
        let guard = FlightGuard(&self.inner.in_flight);

        let batch: Vec<Event> = self.queue().drain(..).collect();
        if batch.is_empty() {
            return Ok(FlushOutcome::Empty);
        }
        let count = batch.len();
        debug!(session.id = %session, count, "flushing events");

        if let Err(e) = self.inner.backend.append_events(&session, &batch).await {
            warn!(session.id = %session, count, error = %e, "event flush failed");
            self.give_back(&session, batch);
            return Err(e);
        }

        drop(guard);
        let backlog = self.len();
        if backlog > 0 && self.inner.ctx.recording_session().as_ref() == Some(&session) {
            debug!(backlog, "backlog after flush, flushing again");
            self.trigger();
        }
        Ok(FlushOutcome::Flushed(count))
    }

    /// Return a failed batch: to the front of the queue while its session is
    /// still current and open, otherwise to the journal.
    fn give_back(&self, session: &SessionId, batch: Vec<Event>) {
        let current = self.inner.ctx.session_id();
        if current.as_ref() == Some(session) && !self.inner.sealed.load(Ordering::Acquire) {
            let mut queue = self.queue();
            for event in batch.into_iter().rev() {
                queue.push_front(event);
            }
            return;
        }
        if let Err(e) = self.inner.journal.stash_events(session, batch) {
            warn!(session.id = %session, error = %e, "failed to persist unflushed events");
        }
    }

    /// Forced flush, retried up to `attempts` times with `delay` between
    /// attempts. Returns true once the queue is empty.
    pub async fn flush_with_retry(&self, attempts: u32, delay: Duration) -> bool {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            match self.flush(true).await {
                Ok(FlushOutcome::InFlight) => {}
                Ok(_) if self.is_empty() => return true,
                Ok(outcome) => debug!(?outcome, attempt, "events remain after flush"),
                Err(e) => warn!(attempt, error = %e, "forced flush failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }
        self.is_empty()
    }

    /// Close the queue for `session`: whatever is left is journaled for a
    /// later run, as is any batch that fails from now on.
    pub fn seal_and_persist(&self, session: &SessionId) -> usize {
        self.inner.sealed.store(true, Ordering::Release);
        let remaining: Vec<Event> = self.queue().drain(..).collect();
        let count = remaining.len();
        if count > 0 {
            warn!(session.id = %session, count, "persisting unflushed events");
            if let Err(e) = self.inner.journal.stash_events(session, remaining) {
                warn!(session.id = %session, error = %e, "failed to persist unflushed events");
            }
        }
        count
    }

    /// Empty queue, open for a new session.
    pub fn reset(&self) {
        self.queue().clear();
        self.inner.sealed.store(false, Ordering::Release);
    }

    /// Deliver events journaled by earlier sessions. Sessions that still
    /// fail stay journaled. Returns how many sessions were delivered.
    pub async fn replay_persisted(&self) -> usize {
        let mut delivered = 0;
        for (session, events) in self.inner.journal.pending_events() {
            if events.is_empty() {
                continue;
            }
            match self.inner.backend.append_events(&session, &events).await {
                Ok(()) => {
                    info!(session.id = %session, count = events.len(), "replayed persisted events");
                    if let Err(e) = self.inner.journal.clear_pending(&session) {
                        warn!(session.id = %session, error = %e, "failed to clear replayed events");
                    }
                    delivered += 1;
                }
                Err(e) => {
                    warn!(session.id = %session, error = %e, "persisted events still undeliverable");
                }
            }
        }
        delivered
    }
}
