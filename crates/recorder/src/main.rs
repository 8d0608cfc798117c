//! qa-recorder - native-messaging host for QA Assist session recording
//!
//! Subcommands:
//! - `qa-recorder serve` - Speak native messaging on stdin/stdout (what the
//!   browser launches)
//! - `qa-recorder config` - Print the effective configuration
//! - `qa-recorder flush-pending` - Deliver events journaled by earlier runs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qaconf::QaConfig;
use recorder::backend::{Connection, HttpBackend};
use recorder::batcher::EventBatcher;
use recorder::bridge::{self, HostBridge};
use recorder::controller::{Recorder, RecorderParts};
use recorder::outbox::Outbox;
use recorder::session::SessionContext;
use recorder::store::{JsonFileStore, Journal};
use recorder::telemetry;
use recorder::upload::HttpTransport;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "qa-recorder")]
#[command(about = "Session recording host for QA Assist")]
#[command(version)]
struct Cli {
    /// Config file, loaded after the standard locations
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as the browser's native-messaging host (default)
    Serve,

    /// Print the effective configuration and where it came from
    Config,

    /// Post events left over from sessions that ended while offline
    FlushPending,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, sources) = QaConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Config => {
            for file in &sources.files {
                println!("# loaded: {}", file.display());
            }
            for var in &sources.env_overrides {
                println!("# env: {}", var);
            }
            print!("{}", config.to_toml());
            Ok(())
        }
        Commands::FlushPending => {
            let guard = telemetry::init(&config.infra.telemetry)?;
            let result = flush_pending(config).await;
            guard.shutdown();
            result
        }
        Commands::Serve => {
            let guard = telemetry::init(&config.infra.telemetry)?;
            let result = serve(config).await;
            guard.shutdown();
            result
        }
    }
}

fn connection(config: &QaConfig) -> (Connection, Duration) {
    let backend = &config.infra.backend;
    (
        Connection::new(backend.api_base.clone(), backend.auth_token.clone()),
        Duration::from_millis(backend.request_timeout_ms),
    )
}

async fn serve(config: QaConfig) -> Result<()> {
    let state_file = config.infra.paths.state_file();
    info!(state_file = %state_file.display(), "starting recorder host");

    let (connection, timeout) = connection(&config);
    let backend = Arc::new(HttpBackend::new(connection.clone(), timeout)?);
    let transport = Arc::new(HttpTransport::new(connection.clone(), timeout)?);

    let (outbox, outbound) = Outbox::channel();
    let host = Arc::new(HostBridge::new(
        outbox.clone(),
        config.bootstrap.capture.host_request_timeout(),
    ));

    let recorder = Recorder::new(
        config.bootstrap,
        connection,
        RecorderParts {
            backend,
            transport,
            capture: host.clone(),
            tabs: host.clone(),
            diagnostics: host.clone(),
            store: Arc::new(JsonFileStore::new(state_file)),
        },
        outbox,
    )
    .context("Failed to restore recorder state")?;

    let cancel = CancellationToken::new();
    {
        let recorder = recorder.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            // Stop while the browser can still acknowledge.
            recorder.shutdown().await;
            cancel.cancel();
        });
    }

    bridge::serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        recorder.clone(),
        host,
        outbound,
        cancel,
    )
    .await?;

    recorder.shutdown().await;
    info!("recorder host exited");
    Ok(())
}

async fn flush_pending(config: QaConfig) -> Result<()> {
    let (connection, timeout) = connection(&config);
    let backend = Arc::new(HttpBackend::new(connection, timeout)?);
    let store = Arc::new(JsonFileStore::new(config.infra.paths.state_file()));
    let journal = Arc::new(Journal::open(
        store,
        config.bootstrap.recording.recent_sessions_limit,
    )?);

    let waiting = journal.pending_events().len();
    if waiting == 0 {
        println!("No pending events.");
        return Ok(());
    }

    let batcher = EventBatcher::new(backend, Arc::new(SessionContext::default()), journal.clone());
    let delivered = batcher.replay_persisted().await;
    let left = journal.pending_events().len();
    println!("Delivered events for {} of {} sessions.", delivered, waiting);
    if left > 0 {
        anyhow::bail!("{} sessions still have undelivered events", left);
    }
    Ok(())
}

async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(_) => std::future::pending::<()>().await,
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
