//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem paths for recorder state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding the persisted recorder state.
    /// Default: ~/.local/share/qa-assist
    #[serde(default = "PathsConfig::default_state_dir")]
    pub state_dir: PathBuf,
}

impl PathsConfig {
    fn default_state_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/qa-assist"))
            .unwrap_or_else(|| PathBuf::from(".local/share/qa-assist"))
    }

    /// Path of the JSON state file inside `state_dir`.
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: Self::default_state_dir(),
        }
    }
}

/// Backend REST API connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the REST API, including the `/api` prefix.
    /// Default: http://localhost:4000/api
    #[serde(default = "BackendConfig::default_api_base")]
    pub api_base: String,

    /// Bearer credential. Recording refuses to start without one.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Per-request timeout in milliseconds.
    /// Default: 30000
    #[serde(default = "BackendConfig::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl BackendConfig {
    fn default_api_base() -> String {
        "http://localhost:4000/api".to_string()
    }

    fn default_request_timeout_ms() -> u64 {
        30_000
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_base: Self::default_api_base(),
            auth_token: None,
            request_timeout_ms: Self::default_request_timeout_ms(),
        }
    }
}

/// Telemetry and observability configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint. Empty disables export; logs still go to stderr.
    #[serde(default)]
    pub otlp_endpoint: String,

    /// Log level (trace, debug, info, warn, error).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    pub fn otlp_enabled(&self) -> bool {
        !self.otlp_endpoint.trim().is_empty()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: String::new(),
            log_level: Self::default_log_level(),
        }
    }
}

/// All infrastructure settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfraConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}
