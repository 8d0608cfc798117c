//! qaproto - wire types for the QA Assist recorder
//!
//! The recorder talks to three parties, each with its own vocabulary here:
//!
//! - **Backend REST API** (`api`): devices, sessions, event batches, chunk
//!   registration and finalization.
//! - **Capture subsystem** (`capture`, `chunk`): a request/acknowledge
//!   protocol; commands go out, acknowledgments and completed media
//!   segments come back.
//! - **Browser side** (`messages`, `tab`, `framing`): the native-messaging
//!   channel. Frames are a little-endian length prefix plus JSON; every
//!   message is a closed, tagged enum.
//!
//! Events (`event`) and lifecycle state (`state`) are shared by all three.

mod b64;

pub mod api;
pub mod capture;
pub mod chunk;
pub mod event;
pub mod framing;
pub mod ids;
pub mod messages;
pub mod state;
pub mod tab;

pub use api::{SessionAction, UploadDescriptor};
pub use capture::{CaptureCommand, CaptureEvent};
pub use chunk::CompletedChunk;
pub use event::{Event, EventKind, RawEvent, TabContext};
pub use framing::FrameError;
pub use ids::{ChunkId, DeviceId, RequestId, SessionId, StreamRef, TabId};
pub use messages::{DiagnosticEntry, Frame, HostRequest, Inbound, Outbound, StartOverrides};
pub use state::{LastTransition, RecorderSnapshot, SessionStatus, SessionSummary, StatusValue};
pub use tab::{TabEnvironment, TabInfo, TabMessage};
