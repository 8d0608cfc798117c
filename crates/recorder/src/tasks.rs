//! Timers tied to a recording stretch.
//!
//! Started when recording begins or resumes, cancelled when it pauses or
//! stops. Cancellation does not wait for a tick that is already running.

use crate::batcher::EventBatcher;
use crate::idle::IdleMonitor;
use crate::session::SessionContext;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Periodic event flush.
pub fn spawn_flush_task(
    batcher: EventBatcher,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("flush task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = batcher.flush(false).await {
                        debug!(error = %e, "periodic flush failed");
                    }
                }
            }
        }
    })
}

/// Periodic idle check. Runs `on_idle` once and exits when the threshold
/// passes while recording.
pub fn spawn_idle_task<F, Fut>(
    monitor: Arc<IdleMonitor>,
    ctx: Arc<SessionContext>,
    cancel: CancellationToken,
    on_idle: F,
) -> JoinHandle<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(monitor.policy().check_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("idle task shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if ctx.is_recording() && monitor.should_auto_pause() {
                        info!(idle_ms = monitor.idle_for().as_millis() as u64, "idle threshold passed");
                        break;
                    }
                }
            }
        }
        on_idle().await;
    })
}

/// Cancellation handle for the current recording stretch.
#[derive(Default)]
pub struct SessionTasks {
    cancel: Option<CancellationToken>,
}

impl SessionTasks {
    /// Cancel any previous stretch and return a token for the new one.
    pub fn begin(&mut self) -> CancellationToken {
        self.cancel_all();
        let token = CancellationToken::new();
        self.cancel = Some(token.clone());
        token
    }

    pub fn cancel_all(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| !t.is_cancelled())
    }
}
