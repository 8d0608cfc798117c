//! Durable local state.
//!
//! The store holds the device id, the lifecycle of the current session, the
//! transition journal, events that could not be flushed (keyed by session)
//! and the recent-sessions list. [`Journal`] keeps an in-memory copy and
//! writes the whole document through a [`StateStore`] on every change.

use crate::error::{RecorderError, Result};
use crate::session::SessionState;
use chrono::{DateTime, Utc};
use qaproto::{
    DeviceId, Event, LastTransition, SessionId, SessionStatus, SessionSummary, TabInfo,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Everything the recorder remembers across restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub device_id: Option<DeviceId>,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub chunk_index: u32,
    #[serde(default)]
    pub tab: Option<TabInfo>,
    #[serde(default)]
    pub auto_paused: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_transition: Option<LastTransition>,
    /// Events that failed to flush at stop time.
    #[serde(default)]
    pub pending_events: BTreeMap<SessionId, Vec<Event>>,
    #[serde(default)]
    pub recent_sessions: Vec<SessionSummary>,
}

/// Backing storage for [`PersistedState`].
pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<PersistedState>;
    fn save(&self, state: &PersistedState) -> Result<()>;
}

/// JSON document on disk, replaced atomically on save.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Result<PersistedState> {
        if !self.path.exists() {
            return Ok(PersistedState::default());
        }
        let json = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&json).map_err(|e| {
            RecorderError::Storage(format!("{}: {}", self.path.display(), e))
        })
    }

    fn save(&self, state: &PersistedState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Atomic write: write to temp, then rename
        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, json)?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<PersistedState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<PersistedState> {
        Ok(self.state.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, state: &PersistedState) -> Result<()> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state.clone();
        Ok(())
    }
}

/// Cached persisted state with write-through.
pub struct Journal {
    store: Arc<dyn StateStore>,
    cache: Mutex<PersistedState>,
    recent_limit: usize,
}

impl Journal {
    pub fn open(store: Arc<dyn StateStore>, recent_limit: usize) -> Result<Self> {
        let state = store.load()?;
        Ok(Self {
            store,
            cache: Mutex::new(state),
            recent_limit,
        })
    }

    fn cache(&self) -> MutexGuard<'_, PersistedState> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> PersistedState {
        self.cache().clone()
    }

    /// Mutate the cached state and write it through.
    pub fn update(&self, f: impl FnOnce(&mut PersistedState)) -> Result<()> {
        let snapshot = {
            let mut cache = self.cache();
            f(&mut cache);
            cache.clone()
        };
        self.store.save(&snapshot)
    }

    /// Copy the lifecycle fields of the session context.
    pub fn record_session(&self, session: &SessionState) -> Result<()> {
        self.update(|p| {
            p.device_id = session.device_id.clone();
            p.session_id = session.session_id.clone();
            p.status = session.status;
            p.chunk_index = session.chunk_index;
            p.tab = session.tab.clone();
            p.auto_paused = session.auto_paused;
            p.debug = session.debug;
            p.last_error = session.last_error.clone();
            p.last_transition = session.last_transition.clone();
        })
    }

    /// Prepend a session summary, replacing any entry with the same id.
    pub fn add_recent(&self, summary: SessionSummary) -> Result<()> {
        let limit = self.recent_limit;
        self.update(|p| {
            p.recent_sessions.retain(|s| s.id != summary.id);
            p.recent_sessions.insert(0, summary);
            p.recent_sessions.truncate(limit);
        })
    }

    /// Update the status of a recent-session entry in place.
    pub fn update_recent(
        &self,
        id: &SessionId,
        status: SessionStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.update(|p| {
            if let Some(entry) = p.recent_sessions.iter_mut().find(|s| &s.id == id) {
                entry.status = status.as_str().to_string();
                if ended_at.is_some() {
                    entry.ended_at = ended_at;
                }
            }
        })
    }

    /// Keep unflushed events for a later run. Merges with events already
    /// held for the session, ordered by timestamp.
    pub fn stash_events(&self, session: &SessionId, events: Vec<Event>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.update(|p| {
            let held = p.pending_events.entry(session.clone()).or_default();
            held.extend(events);
            held.sort_by_key(|e| e.ts);
        })
    }

    pub fn pending_events(&self) -> Vec<(SessionId, Vec<Event>)> {
        self.cache()
            .pending_events
            .iter()
            .map(|(id, events)| (id.clone(), events.clone()))
            .collect()
    }

    pub fn clear_pending(&self, session: &SessionId) -> Result<()> {
        self.update(|p| {
            p.pending_events.remove(session);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use qaproto::EventKind;
    use serde_json::json;

    fn summary(id: &str) -> SessionSummary {
        SessionSummary {
            id: SessionId::from(id),
            url: None,
            title: None,
            started_at: Utc::now(),
            status: "recording".into(),
            ended_at: None,
            metadata: json!({}),
        }
    }

    fn event_at(secs: i64) -> Event {
        Event {
            ts: Utc.timestamp_opt(secs, 0).unwrap(),
            kind: EventKind::Interaction,
            payload: json!({ "n": secs }),
            tab: None,
        }
    }

    #[test]
    fn file_store_roundtrip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested/state.json"));
        assert_eq!(store.load().unwrap(), PersistedState::default());

        let mut state = PersistedState::default();
        state.device_id = Some(DeviceId::from("dev-1"));
        state.pending_events
            .insert(SessionId::from("s1"), vec![event_at(1)]);
        store.save(&state).unwrap();

        assert_eq!(store.load().unwrap(), state);
        assert!(!store.path().with_extension("tmp").exists());
    }

    #[test]
    fn corrupt_file_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = JsonFileStore::new(&path).load().unwrap_err();
        assert!(matches!(err, RecorderError::Storage(_)));
    }

    #[test]
    fn recent_sessions_are_bounded_and_deduplicated() {
        let journal = Journal::open(Arc::new(MemoryStore::new()), 3).unwrap();
        for id in ["a", "b", "c", "d"] {
            journal.add_recent(summary(id)).unwrap();
        }
        journal.add_recent(summary("c")).unwrap();

        let ids: Vec<_> = journal
            .state()
            .recent_sessions
            .iter()
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(ids, vec!["c", "d", "b"]);

        let ended = Utc::now();
        journal
            .update_recent(&SessionId::from("d"), SessionStatus::Ended, Some(ended))
            .unwrap();
        let d = journal.state().recent_sessions[1].clone();
        assert_eq!(d.status, "ended");
        assert_eq!(d.ended_at, Some(ended));
    }

    #[test]
    fn stashed_events_merge_in_time_order() {
        let store = Arc::new(MemoryStore::new());
        let journal = Journal::open(store.clone(), 20).unwrap();
        let sid = SessionId::from("s1");

        journal.stash_events(&sid, vec![event_at(3), event_at(4)]).unwrap();
        journal.stash_events(&sid, vec![event_at(1)]).unwrap();

        let pending = journal.pending_events();
        assert_eq!(pending.len(), 1);
        let secs: Vec<_> = pending[0].1.iter().map(|e| e.ts.timestamp()).collect();
        assert_eq!(secs, vec![1, 3, 4]);

        // Written through to the backing store.
        assert_eq!(store.load().unwrap().pending_events[&sid].len(), 3);

        journal.clear_pending(&sid).unwrap();
        assert!(journal.pending_events().is_empty());
    }
}
