//! recorder - session recording orchestrator for QA Assist
//!
//! A recording session moves through `idle → recording ⇄ paused → ended`.
//! While it records, three streams flow to the backend:
//!
//! - **Events** (`batcher`): interactions, console and network entries,
//!   markers. Queued per session, posted in batches, journaled when the
//!   backend cannot take them.
//! - **Media chunks** (`pipeline`, `upload`): completed segments from the
//!   capture subsystem, registered, uploaded and finalized in index order.
//! - **Lifecycle calls** (`controller`): session create, start, pause,
//!   resume, stop and artifact rebuild.
//!
//! The capture subsystem and the browser live on the other side of the
//! native-messaging channel (`bridge`). Everything the recorder remembers
//! across restarts goes through the `store` journal.

pub mod backend;
pub mod batcher;
pub mod bridge;
pub mod capture;
pub mod controller;
pub mod error;
pub mod idle;
pub mod outbox;
pub mod pipeline;
pub mod session;
pub mod store;
pub mod tasks;
pub mod telemetry;
pub mod upload;
pub mod waiters;

#[cfg(test)]
mod testing;

pub use backend::{Backend, Connection, HttpBackend};
pub use capture::{CaptureCoordinator, CaptureHost, CaptureMode};
pub use controller::{Diagnostics, Recorder, RecorderParts, TabHost};
pub use error::{RecorderError, Result};
pub use store::{JsonFileStore, Journal, MemoryStore, PersistedState, StateStore};
pub use upload::{ChunkTransport, HttpTransport};
