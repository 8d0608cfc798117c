//! The session context: the single owner of mutable recording state.
//!
//! Every component reads the active session id from here to decide whether
//! incoming data still belongs to the current session. Only the controller
//! mutates lifecycle fields. The lock is never held across an await.

use chrono::{DateTime, Utc};
use qaproto::{DeviceId, LastTransition, SessionId, SessionStatus, TabContext, TabId, TabInfo};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub device_id: Option<DeviceId>,
    pub session_id: Option<SessionId>,
    pub status: SessionStatus,
    /// Next chunk index for the active session.
    pub chunk_index: u32,
    /// Chunks handed to the pipeline for the active session in this process.
    pub chunks_received: u32,
    /// Lowest index the pipeline still accepts for the active session.
    pub next_submit_index: u32,
    pub tab: Option<TabInfo>,
    pub auto_paused: bool,
    pub debug: bool,
    pub chunk_duration_ms: u64,
    /// A start or resume is between its first and last await.
    pub starting: bool,
    /// A pause is between its first and last await.
    pub pausing: bool,
    /// A stop is between its first and last await.
    pub stopping: bool,
    pub last_error: Option<String>,
    pub last_transition: Option<LastTransition>,
}

impl SessionState {
    pub fn tab_id(&self) -> Option<TabId> {
        self.tab.as_ref().map(|t| t.id)
    }

    pub fn tab_context(&self) -> Option<TabContext> {
        self.tab.as_ref().map(|t| TabContext {
            tab_id: t.id,
            url: t.url.clone(),
        })
    }

    /// Restart chunk numbering at `chunk_index`.
    pub fn reset_chunks(&mut self, chunk_index: u32) {
        self.chunk_index = chunk_index;
        self.next_submit_index = chunk_index;
        self.chunks_received = 0;
    }

    /// Move to `to`, journaling the transition.
    pub fn transition(&mut self, to: SessionStatus, reason: impl Into<String>, at: DateTime<Utc>) {
        self.last_transition = Some(LastTransition {
            from: self.status,
            to,
            reason: reason.into(),
            at,
        });
        self.status = to;
    }
}

/// Outcome of [`SessionContext::claim_chunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkClaim {
    Claimed,
    /// The session is no longer current.
    Stale,
    /// The index was already submitted or precedes the session's next index.
    Behind { next: u32 },
}

#[derive(Debug, Default)]
pub struct SessionContext {
    state: Mutex<SessionState>,
}

impl SessionContext {
    pub fn new(state: SessionState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Exclusive access for a synchronous section.
    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> SessionState {
        self.lock().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.lock().session_id.clone()
    }

    pub fn is_recording(&self) -> bool {
        self.lock().status == SessionStatus::Recording
    }

    /// Session id, only while recording.
    pub fn recording_session(&self) -> Option<SessionId> {
        let state = self.lock();
        match state.status {
            SessionStatus::Recording => state.session_id.clone(),
            _ => None,
        }
    }

    pub fn debug(&self) -> bool {
        self.lock().debug
    }

    /// Reserve `index` for submission under `session`. Indexes must strictly
    /// increase within a session.
    pub fn claim_chunk(&self, session: &SessionId, index: u32, synthetic: bool) -> ChunkClaim {
        let mut state = self.lock();
        if state.session_id.as_ref() != Some(session) {
            return ChunkClaim::Stale;
        }
        let next = state.chunk_index.max(state.next_submit_index);
        if index < next {
            return ChunkClaim::Behind { next };
        }
        state.next_submit_index = index + 1;
        if !synthetic {
            state.chunks_received += 1;
        }
        ChunkClaim::Claimed
    }

    /// Record that chunk `index` of `session` was registered. The next index
    /// never moves backwards. Returns false for a stale session.
    pub fn chunk_registered(&self, session: &SessionId, index: u32) -> bool {
        let mut state = self.lock();
        if state.session_id.as_ref() != Some(session) {
            return false;
        }
        state.chunk_index = state.chunk_index.max(index + 1);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_journals_from_and_to() {
        let mut state = SessionState::default();
        let at = Utc::now();
        state.transition(SessionStatus::Recording, "start", at);
        state.transition(SessionStatus::Paused, "Idle timeout", at);

        let last = state.last_transition.unwrap();
        assert_eq!(last.from, SessionStatus::Recording);
        assert_eq!(last.to, SessionStatus::Paused);
        assert_eq!(last.reason, "Idle timeout");
        assert_eq!(state.status, SessionStatus::Paused);
    }

    #[test]
    fn chunk_index_only_advances_for_current_session() {
        let ctx = SessionContext::new(SessionState {
            session_id: Some(SessionId::from("a")),
            status: SessionStatus::Recording,
            chunk_index: 2,
            ..Default::default()
        });

        assert!(ctx.chunk_registered(&SessionId::from("a"), 4));
        assert_eq!(ctx.snapshot().chunk_index, 5);
        assert!(ctx.chunk_registered(&SessionId::from("a"), 1));
        assert_eq!(ctx.snapshot().chunk_index, 5);
        assert!(!ctx.chunk_registered(&SessionId::from("b"), 9));
        assert_eq!(ctx.snapshot().chunk_index, 5);
        assert_eq!(ctx.recording_session(), Some(SessionId::from("a")));
    }

    #[test]
    fn chunk_claims_strictly_increase() {
        let ctx = SessionContext::new(SessionState {
            session_id: Some(SessionId::from("a")),
            status: SessionStatus::Recording,
            chunk_index: 2,
            ..Default::default()
        });
        let a = SessionId::from("a");

        assert_eq!(ctx.claim_chunk(&a, 1, false), ChunkClaim::Behind { next: 2 });
        assert_eq!(ctx.claim_chunk(&a, 2, false), ChunkClaim::Claimed);
        assert_eq!(ctx.claim_chunk(&a, 2, false), ChunkClaim::Behind { next: 3 });
        assert_eq!(ctx.claim_chunk(&a, 5, false), ChunkClaim::Claimed);
        assert_eq!(ctx.claim_chunk(&a, 4, false), ChunkClaim::Behind { next: 6 });
        assert_eq!(ctx.claim_chunk(&SessionId::from("b"), 9, false), ChunkClaim::Stale);
        assert_eq!(ctx.snapshot().chunks_received, 2);

        ctx.lock().reset_chunks(3);
        assert_eq!(ctx.claim_chunk(&a, 3, true), ChunkClaim::Claimed);
        assert_eq!(ctx.snapshot().chunks_received, 0);
    }
}
