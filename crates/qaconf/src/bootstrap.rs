//! Bootstrap configuration - seeds runtime state, then the recorder owns it.
//!
//! A start command may override `debug` and `chunk_duration_ms` for a single
//! session; these values are only the starting point.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Recording and event batching tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Target media chunk length handed to the capture subsystem.
    /// Default: 600000 (10 minutes)
    #[serde(default = "RecordingConfig::default_chunk_duration_ms")]
    pub chunk_duration_ms: u64,

    /// Periodic event flush interval while recording.
    /// Default: 3000
    #[serde(default = "RecordingConfig::default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Flush attempts made during stop before events are persisted.
    /// Default: 3
    #[serde(default = "RecordingConfig::default_stop_flush_attempts")]
    pub stop_flush_attempts: u32,

    /// Delay between stop-time flush attempts.
    /// Default: 500
    #[serde(default = "RecordingConfig::default_stop_flush_delay_ms")]
    pub stop_flush_delay_ms: u64,

    /// Maximum number of recent session summaries kept locally.
    /// Default: 20
    #[serde(default = "RecordingConfig::default_recent_sessions_limit")]
    pub recent_sessions_limit: usize,

    /// Forward diagnostics to the page as debug log messages.
    #[serde(default)]
    pub debug: bool,
}

impl RecordingConfig {
    fn default_chunk_duration_ms() -> u64 {
        10 * 60 * 1000
    }

    fn default_flush_interval_ms() -> u64 {
        3_000
    }

    fn default_stop_flush_attempts() -> u32 {
        3
    }

    fn default_stop_flush_delay_ms() -> u64 {
        500
    }

    fn default_recent_sessions_limit() -> usize {
        20
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn stop_flush_delay(&self) -> Duration {
        Duration::from_millis(self.stop_flush_delay_ms)
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            chunk_duration_ms: Self::default_chunk_duration_ms(),
            flush_interval_ms: Self::default_flush_interval_ms(),
            stop_flush_attempts: Self::default_stop_flush_attempts(),
            stop_flush_delay_ms: Self::default_stop_flush_delay_ms(),
            recent_sessions_limit: Self::default_recent_sessions_limit(),
            debug: false,
        }
    }
}

/// Bounds for waits on the capture subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Wait for the capture context to announce readiness after creation.
    /// Default: 2000
    #[serde(default = "CaptureConfig::default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    /// Wait for a start acknowledgment (real or fake source).
    /// Default: 5000
    #[serde(default = "CaptureConfig::default_start_ack_timeout_ms")]
    pub start_ack_timeout_ms: u64,

    /// Wait for the "stopped" acknowledgment during stop.
    /// Default: 5000
    #[serde(default = "CaptureConfig::default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Wait for "uploads drained" and for the pipeline to reach zero.
    /// Default: 15000
    #[serde(default = "CaptureConfig::default_uploads_timeout_ms")]
    pub uploads_timeout_ms: u64,

    /// Wait for a ping reply from an existing capture context.
    /// Default: 500
    #[serde(default = "CaptureConfig::default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    /// Wait for the browser to answer a host request (tab lookup, stream
    /// handle, diagnostics attach).
    /// Default: 10000
    #[serde(default = "CaptureConfig::default_host_request_timeout_ms")]
    pub host_request_timeout_ms: u64,
}

impl CaptureConfig {
    fn default_ready_timeout_ms() -> u64 {
        2_000
    }

    fn default_start_ack_timeout_ms() -> u64 {
        5_000
    }

    fn default_stop_timeout_ms() -> u64 {
        5_000
    }

    fn default_uploads_timeout_ms() -> u64 {
        15_000
    }

    fn default_ping_timeout_ms() -> u64 {
        500
    }

    fn default_host_request_timeout_ms() -> u64 {
        10_000
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn start_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.start_ack_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn uploads_timeout(&self) -> Duration {
        Duration::from_millis(self.uploads_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn host_request_timeout(&self) -> Duration {
        Duration::from_millis(self.host_request_timeout_ms)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: Self::default_ready_timeout_ms(),
            start_ack_timeout_ms: Self::default_start_ack_timeout_ms(),
            stop_timeout_ms: Self::default_stop_timeout_ms(),
            uploads_timeout_ms: Self::default_uploads_timeout_ms(),
            ping_timeout_ms: Self::default_ping_timeout_ms(),
            host_request_timeout_ms: Self::default_host_request_timeout_ms(),
        }
    }
}

/// Auto-pause policies. Both are off by default: long idle stretches and tab
/// switches are normal during long-running manual tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdleConfig {
    #[serde(default)]
    pub auto_pause_on_idle: bool,

    #[serde(default)]
    pub auto_pause_on_tab_switch: bool,

    /// Default: 300000 (5 minutes)
    #[serde(default = "IdleConfig::default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Default: 15000
    #[serde(default = "IdleConfig::default_check_interval_ms")]
    pub check_interval_ms: u64,
}

impl IdleConfig {
    fn default_idle_timeout_ms() -> u64 {
        5 * 60 * 1000
    }

    fn default_check_interval_ms() -> u64 {
        15_000
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            auto_pause_on_idle: false,
            auto_pause_on_tab_switch: false,
            idle_timeout_ms: Self::default_idle_timeout_ms(),
            check_interval_ms: Self::default_check_interval_ms(),
        }
    }
}

/// All bootstrap settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub recording: RecordingConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub idle: IdleConfig,
}
