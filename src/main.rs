#![forbid(unsafe_code)]

//! `agent-relay`: headless RPC server binary.
//!
//! Reads one JSON command per line from stdin and writes responses and
//! agent events to stdout. Logs go to stderr so stdout carries nothing but
//! protocol lines. Exits 0 when stdin closes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use agent_relay::rpc::server::run_server;
use agent_relay::session::local::{EchoResponder, LocalSession};
use agent_relay::{AppError, RelayConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-relay", about = "Headless JSON Lines agent server", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for session files; overrides `agent.session_dir`.
    #[arg(long, conflicts_with = "no_session")]
    session_dir: Option<PathBuf>,

    /// Keep the session in memory only.
    #[arg(long)]
    no_session: bool,

    /// Model selected at startup, as `provider/id`.
    #[arg(long)]
    model: Option<String>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?;

    let result = runtime.block_on(run(args));
    // Stdin is read on a blocking thread that may still be parked in a read.
    runtime.shutdown_timeout(Duration::from_millis(100));
    result
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match args.config {
        Some(ref path) => RelayConfig::load_from_path(path)?,
        None => RelayConfig::default(),
    };

    if let Some(dir) = args.session_dir {
        config.agent.session_dir = Some(dir);
    }
    if args.no_session {
        config.agent.session_dir = None;
    }
    if let Some(model) = args.model {
        config.agent.default_model = Some(model);
    }
    config.validate()?;
    info!("configuration loaded");

    // ── Open the session ────────────────────────────────
    let session = Arc::new(LocalSession::open(&config, Arc::new(EchoResponder)).await?);

    let ct = CancellationToken::new();
    let signal_ct = ct.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_ct.cancel();
    });

    // ── Serve until stdin closes ────────────────────────
    run_server(session, tokio::io::stdin(), tokio::io::stdout(), ct).await?;
    info!("agent-relay shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
