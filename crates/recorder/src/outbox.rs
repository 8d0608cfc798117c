//! Outbound frame queue toward the browser side.

use qaproto::{Frame, Outbound, RequestId};
use serde_json::Value;
use tokio::sync::mpsc;

/// Cloneable sender half. The writer task owns the receiver.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Frame<Outbound>>,
}

impl Outbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Frame<Outbound>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a frame. A closed channel means the host went away; the frame
    /// is dropped.
    pub fn send_frame(&self, frame: Frame<Outbound>) {
        if self.tx.send(frame).is_err() {
            tracing::debug!("outbox closed, dropping frame");
        }
    }

    pub fn send(&self, message: Outbound) {
        self.send_frame(Frame::new(message));
    }

    /// Answer a command, echoing its correlation id.
    pub fn reply(&self, id: Option<RequestId>, message: Outbound) {
        self.send_frame(Frame { id, message });
    }

    pub fn debug_log(&self, message: impl Into<String>, detail: Value) {
        self.send(Outbound::DebugLog {
            message: message.into(),
            detail,
        });
    }
}
