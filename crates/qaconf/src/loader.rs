//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, QaConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local). Only existing files.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/qa-assist/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("qa-assist/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("qa-assist.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    contents
        .parse::<toml::Table>()
        .map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Load a single config file (defaults for everything it leaves out).
pub fn load_from_file(path: &Path) -> Result<QaConfig, ConfigError> {
    from_table(load_table(path)?, Some(&path.to_path_buf()))
}

/// Deep-merge `overlay` into `base`. Nested tables merge key by key; any
/// other value in `overlay` replaces the one in `base`.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Turn a merged table into a typed config, expanding `~` in paths.
pub fn from_table(table: toml::Table, origin: Option<&PathBuf>) -> Result<QaConfig, ConfigError> {
    let mut config: QaConfig =
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: origin.cloned().unwrap_or_else(|| PathBuf::from("<merged>")),
                message: e.to_string(),
            })?;

    let state_dir = config.infra.paths.state_dir.to_string_lossy().into_owned();
    config.infra.paths.state_dir = expand_path(&state_dir);

    Ok(config)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut QaConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("QA_ASSIST_STATE_DIR") {
        config.infra.paths.state_dir = expand_path(&v);
        sources.env_overrides.push("QA_ASSIST_STATE_DIR".to_string());
    }

    // Backend
    if let Ok(v) = env::var("QA_ASSIST_API_BASE") {
        config.infra.backend.api_base = v;
        sources.env_overrides.push("QA_ASSIST_API_BASE".to_string());
    }
    if let Ok(v) = env::var("QA_ASSIST_AUTH_TOKEN") {
        if !v.is_empty() {
            config.infra.backend.auth_token = Some(v);
            sources.env_overrides.push("QA_ASSIST_AUTH_TOKEN".to_string());
        }
    }

    // Telemetry
    if let Ok(v) = env::var("QA_ASSIST_OTLP_ENDPOINT") {
        config.infra.telemetry.otlp_endpoint = v;
        sources.env_overrides.push("QA_ASSIST_OTLP_ENDPOINT".to_string());
    }
    if let Ok(v) = env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        config.infra.telemetry.otlp_endpoint = v;
        sources.env_overrides.push("OTEL_EXPORTER_OTLP_ENDPOINT".to_string());
    }
    if let Ok(v) = env::var("QA_ASSIST_LOG_LEVEL") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("QA_ASSIST_LOG_LEVEL".to_string());
    }
    if let Ok(v) = env::var("RUST_LOG") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }

    // Recording
    if let Some(v) = env::var("QA_ASSIST_DEBUG").ok().and_then(|v| parse_bool(&v)) {
        config.bootstrap.recording.debug = v;
        sources.env_overrides.push("QA_ASSIST_DEBUG".to_string());
    }
    if let Some(v) = env::var("QA_ASSIST_AUTO_PAUSE_ON_IDLE")
        .ok()
        .and_then(|v| parse_bool(&v))
    {
        config.bootstrap.idle.auto_pause_on_idle = v;
        sources
            .env_overrides
            .push("QA_ASSIST_AUTO_PAUSE_ON_IDLE".to_string());
    }
    if let Some(v) = env::var("QA_ASSIST_AUTO_PAUSE_ON_TAB_SWITCH")
        .ok()
        .and_then(|v| parse_bool(&v))
    {
        config.bootstrap.idle.auto_pause_on_tab_switch = v;
        sources
            .env_overrides
            .push("QA_ASSIST_AUTO_PAUSE_ON_TAB_SWITCH".to_string());
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // Handle $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}
