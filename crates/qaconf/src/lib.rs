//! Minimal configuration loading for the QA Assist recorder.
//!
//! # Configuration Philosophy
//!
//! Configuration is split into two categories:
//!
//! - **Infrastructure** (`InfraConfig`): things that cannot change while the
//!   recorder runs - the state directory, the backend endpoint and credential,
//!   telemetry export.
//!
//! - **Bootstrap** (`BootstrapConfig`): initial values for recording, capture
//!   and idle policies. A start command can override some of them per session.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/qa-assist/config.toml` (system)
//! 2. `~/.config/qa-assist/config.toml` (user)
//! 3. `./qa-assist.toml` (local override, or the `--config` path)
//! 4. Environment variables (`QA_ASSIST_*`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! state_dir = "~/.local/share/qa-assist"
//!
//! [backend]
//! api_base = "https://qa.example.com/api"
//! auth_token = "..."
//!
//! [recording]
//! flush_interval_ms = 3000
//! stop_flush_attempts = 3
//!
//! [idle]
//! auto_pause_on_idle = false
//! ```

pub mod bootstrap;
pub mod infra;
pub mod loader;

pub use bootstrap::{BootstrapConfig, CaptureConfig, IdleConfig, RecordingConfig};
pub use infra::{BackendConfig, InfraConfig, PathsConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete recorder configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QaConfig {
    /// Infrastructure - cannot change at runtime.
    #[serde(flatten)]
    pub infra: InfraConfig,

    /// Bootstrap - seeds runtime state.
    #[serde(flatten)]
    pub bootstrap: BootstrapConfig,
}

impl QaConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, letting `config_path` replace the local override.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let mut config = loader::from_table(merged, sources.files.last())?;
        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to a TOML string. The auth token is redacted.
    pub fn to_toml(&self) -> String {
        let infra = &self.infra;
        let boot = &self.bootstrap;
        let mut output = String::new();

        output.push_str("# QA Assist Recorder Configuration\n\n");

        output.push_str("[paths]\n");
        output.push_str(&format!(
            "state_dir = \"{}\"\n",
            infra.paths.state_dir.display()
        ));

        output.push_str("\n[backend]\n");
        output.push_str(&format!("api_base = \"{}\"\n", infra.backend.api_base));
        if infra.backend.auth_token.is_some() {
            output.push_str("auth_token = \"<redacted>\"\n");
        }
        output.push_str(&format!(
            "request_timeout_ms = {}\n",
            infra.backend.request_timeout_ms
        ));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!(
            "otlp_endpoint = \"{}\"\n",
            infra.telemetry.otlp_endpoint
        ));
        output.push_str(&format!("log_level = \"{}\"\n", infra.telemetry.log_level));

        output.push_str("\n[recording]\n");
        output.push_str(&format!(
            "chunk_duration_ms = {}\n",
            boot.recording.chunk_duration_ms
        ));
        output.push_str(&format!(
            "flush_interval_ms = {}\n",
            boot.recording.flush_interval_ms
        ));
        output.push_str(&format!(
            "stop_flush_attempts = {}\n",
            boot.recording.stop_flush_attempts
        ));
        output.push_str(&format!(
            "stop_flush_delay_ms = {}\n",
            boot.recording.stop_flush_delay_ms
        ));
        output.push_str(&format!(
            "recent_sessions_limit = {}\n",
            boot.recording.recent_sessions_limit
        ));
        output.push_str(&format!("debug = {}\n", boot.recording.debug));

        output.push_str("\n[capture]\n");
        output.push_str(&format!(
            "ready_timeout_ms = {}\n",
            boot.capture.ready_timeout_ms
        ));
        output.push_str(&format!(
            "start_ack_timeout_ms = {}\n",
            boot.capture.start_ack_timeout_ms
        ));
        output.push_str(&format!("stop_timeout_ms = {}\n", boot.capture.stop_timeout_ms));
        output.push_str(&format!(
            "uploads_timeout_ms = {}\n",
            boot.capture.uploads_timeout_ms
        ));
        output.push_str(&format!("ping_timeout_ms = {}\n", boot.capture.ping_timeout_ms));
        output.push_str(&format!(
            "host_request_timeout_ms = {}\n",
            boot.capture.host_request_timeout_ms
        ));

        output.push_str("\n[idle]\n");
        output.push_str(&format!(
            "auto_pause_on_idle = {}\n",
            boot.idle.auto_pause_on_idle
        ));
        output.push_str(&format!(
            "auto_pause_on_tab_switch = {}\n",
            boot.idle.auto_pause_on_tab_switch
        ));
        output.push_str(&format!("idle_timeout_ms = {}\n", boot.idle.idle_timeout_ms));
        output.push_str(&format!(
            "check_interval_ms = {}\n",
            boot.idle.check_interval_ms
        ));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QaConfig::default();
        assert_eq!(config.infra.backend.api_base, "http://localhost:4000/api");
        assert_eq!(config.bootstrap.recording.flush_interval_ms, 3_000);
        assert!(!config.bootstrap.idle.auto_pause_on_idle);
        assert!(config.infra.backend.auth_token.is_none());
    }

    #[test]
    fn test_to_toml_redacts_token() {
        let mut config = QaConfig::default();
        config.infra.backend.auth_token = Some("secret-token".to_string());
        let toml = config.to_toml();
        assert!(toml.contains("[backend]"));
        assert!(toml.contains("[idle]"));
        assert!(toml.contains("<redacted>"));
        assert!(!toml.contains("secret-token"));
    }

    #[test]
    fn test_to_toml_parses_back() {
        let config = QaConfig::default();
        let table: toml::Table = config.to_toml().parse().unwrap();
        let reparsed = loader::from_table(table, None).unwrap();
        assert_eq!(reparsed.bootstrap, config.bootstrap);
        assert_eq!(reparsed.infra.backend.api_base, config.infra.backend.api_base);
    }
}
