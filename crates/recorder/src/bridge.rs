//! Native-messaging host.
//!
//! The browser side talks to the recorder over stdin/stdout with
//! length-prefixed JSON frames. One task reads frames and routes them; one
//! task drains the [`Outbox`] onto the writer. Requests the recorder makes of
//! the browser go out as [`Outbound::Request`] and are matched to their
//! [`Inbound::Reply`] by frame id.

use crate::capture::CaptureHost;
use crate::controller::{Diagnostics, Recorder, TabHost};
use crate::error::{RecorderError, Result};
use crate::outbox::Outbox;
use async_trait::async_trait;
use qaproto::framing::{self, FrameError, HEADER_LEN};
use qaproto::{
    CaptureCommand, Frame, HostRequest, Inbound, Outbound, RequestId, StreamRef, TabEnvironment,
    TabId, TabInfo, TabMessage,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

type ReplyResult = std::result::Result<Value, String>;

/// Browser-side services reached through host requests.
pub struct HostBridge {
    outbox: Outbox,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<ReplyResult>>>,
    timeout: Duration,
}

impl HostBridge {
    pub fn new(outbox: Outbox, timeout: Duration) -> Self {
        Self {
            outbox,
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, oneshot::Sender<ReplyResult>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Send a request and wait for its reply.
    pub async fn request(&self, request: HostRequest) -> Result<Value> {
        let id = RequestId::generate();
        let name = request.name();
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id.clone(), tx);
        trace!(request = name, %id, "host request");
        self.outbox
            .send_frame(Frame::with_id(id.clone(), Outbound::Request(request)));

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(data))) => Ok(data),
            Ok(Ok(Err(error))) => Err(RecorderError::Protocol(format!("{}: {}", name, error))),
            Ok(Err(_)) => Err(RecorderError::Protocol(format!("{}: host went away", name))),
            Err(_) => {
                self.pending().remove(&id);
                Err(RecorderError::Protocol(format!("{}: no reply", name)))
            }
        }
    }

    async fn request_as<T: DeserializeOwned>(&self, request: HostRequest) -> Result<T> {
        let data = self.request(request).await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Complete the pending request `id`. False when nothing was waiting.
    pub fn resolve(&self, id: &RequestId, reply: ReplyResult) -> bool {
        match self.pending().remove(id) {
            Some(tx) => {
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding request; used when the browser disconnects.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.pending().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err("host disconnected".to_string()));
        }
        count
    }
}

#[async_trait]
impl TabHost for HostBridge {
    async fn active_tab(&self) -> Result<Option<TabInfo>> {
        self.request_as(HostRequest::GetActiveTab).await
    }

    async fn tab(&self, id: TabId) -> Result<Option<TabInfo>> {
        self.request_as(HostRequest::GetTab { tab_id: id }).await
    }

    async fn environment(&self, id: TabId) -> Result<Option<TabEnvironment>> {
        self.request_as(HostRequest::GetTabEnv { tab_id: id }).await
    }

    async fn send(&self, tab: TabId, message: TabMessage) -> Result<()> {
        self.request(HostRequest::TabMessage {
            tab_id: tab,
            message,
        })
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl Diagnostics for HostBridge {
    async fn attach(&self, tab: TabId) -> Result<()> {
        self.request(HostRequest::AttachDiagnostics { tab_id: tab })
            .await
            .map(|_| ())
            .map_err(|e| RecorderError::DiagnosticsAttachFailed(e.to_string()))
    }

    async fn detach(&self, tab: TabId) -> Result<()> {
        self.request(HostRequest::DetachDiagnostics { tab_id: tab })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl CaptureHost for HostBridge {
    async fn ping(&self) -> Result<()> {
        self.request(HostRequest::PingCapture).await.map(|_| ())
    }

    async fn create_context(&self) -> Result<()> {
        self.request(HostRequest::CreateCaptureContext)
            .await
            .map(|_| ())
    }

    async fn acquire_stream(&self, tab: TabId) -> Result<StreamRef> {
        self.request_as(HostRequest::AcquireStream { tab_id: tab })
            .await
            .map_err(|e| RecorderError::CaptureAcquisitionFailed(e.to_string()))
    }

    async fn send(&self, command: CaptureCommand) -> Result<()> {
        debug!(command = command.name(), "capture command");
        self.outbox.send(Outbound::Capture(command));
        Ok(())
    }
}

/// Serve one browser connection until the reader closes or `cancel` fires.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    recorder: Recorder,
    bridge: Arc<HostBridge>,
    outbound: mpsc::UnboundedReceiver<Frame<Outbound>>,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer_cancel = cancel.child_token();
    let writer_task = tokio::spawn(write_frames(writer, outbound, writer_cancel.clone()));

    let result = tokio::select! {
        _ = cancel.cancelled() => {
            info!("host bridge cancelled");
            Ok(())
        }
        result = read_frames(reader, &recorder, &bridge) => result,
    };

    let failed = bridge.fail_all();
    if failed > 0 {
        debug!(failed, "failed outstanding host requests");
    }
    writer_cancel.cancel();
    if let Err(e) = writer_task.await {
        warn!(error = %e, "frame writer panicked");
    }
    result
}

async fn read_frames<R>(mut reader: R, recorder: &Recorder, bridge: &HostBridge) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut header = [0u8; HEADER_LEN];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                info!("browser closed the connection");
                return Ok(());
            }
            Err(e) => return Err(RecorderError::Protocol(format!("read failed: {}", e))),
        }

        let len = framing::body_len(header).map_err(|e| RecorderError::Protocol(e.to_string()))?;
        let mut body = vec![0u8; len];
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| RecorderError::Protocol(format!("truncated frame: {}", e)))?;

        let frame: Frame<Inbound> = match framing::decode(&body) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, len, "dropping undecodable frame");
                continue;
            }
        };
        trace!(message = frame.message.name(), "inbound frame");
        route(frame, recorder, bridge);
    }
}

fn route(frame: Frame<Inbound>, recorder: &Recorder, bridge: &HostBridge) {
    if let (Some(id), Inbound::Reply { ok, data, error }) = (&frame.id, &frame.message) {
        let reply = if *ok {
            Ok(data.clone())
        } else {
            Err(error.clone().unwrap_or_else(|| "request failed".to_string()))
        };
        if bridge.resolve(id, reply) {
            return;
        }
    }
    recorder.handle(frame);
}

async fn write_frames<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Frame<Outbound>>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let bytes = match framing::encode(&frame) {
            Ok(bytes) => bytes,
            Err(FrameError::TooLarge { len, limit }) => {
                warn!(len, limit, "dropping oversized outbound frame");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "dropping unencodable outbound frame");
                continue;
            }
        };
        if let Err(e) = writer.write_all(&bytes).await {
            warn!(error = %e, "write to browser failed");
            break;
        }
        if let Err(e) = writer.flush().await {
            warn!(error = %e, "flush to browser failed");
            break;
        }
    }

    // Drain what is already queued so final status messages get out.
    while let Ok(frame) = outbound.try_recv() {
        if let Ok(bytes) = framing::encode(&frame) {
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    }
    let _ = writer.flush().await;
}
