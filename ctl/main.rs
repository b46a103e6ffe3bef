#![forbid(unsafe_code)]

//! `agent-relay-ctl`: command-line driver for a headless `agent-relay`.
//!
//! Spawns the server as a child, issues one command, prints the result as
//! JSON on stdout, and stops the child. `prompt` prints every event of the
//! run, one JSON value per line, up to and including `agent_end`.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

use agent_relay::rpc::client::RpcClient;
use agent_relay::{AppError, RelayConfig, Result};

#[derive(Debug, Parser)]
#[command(
    name = "agent-relay-ctl",
    about = "Drive a headless agent-relay server",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file (`[client]` table).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Program to spawn instead of `client.program`.
    #[arg(long)]
    agent: Option<String>,

    /// Argument passed to the spawned program; repeatable.
    #[arg(long = "agent-arg", allow_hyphen_values = true)]
    agent_args: Vec<String>,

    /// Seconds to wait for a prompt run to finish.
    #[arg(long)]
    idle_timeout: Option<u64>,

    #[command(subcommand)]
    command: CtlCommand,
}

#[derive(Debug, Subcommand)]
enum CtlCommand {
    /// Send a prompt and print its events until the agent is idle.
    Prompt {
        /// Message text.
        message: String,
    },

    /// Print the session state snapshot.
    State,

    /// List the models the agent can switch to.
    Models,

    /// Print session statistics.
    Stats,

    /// List conversation branches.
    Branches,

    /// List persisted sessions, newest first.
    Sessions,
}

fn main() {
    let args = Cli::parse();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();

    let outcome = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))
        .and_then(|runtime| runtime.block_on(run(args)));

    if let Err(err) = outcome {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

async fn run(args: Cli) -> Result<()> {
    let mut config = match args.config {
        Some(ref path) => RelayConfig::load_from_path(path)?,
        None => RelayConfig::default(),
    };
    if let Some(agent) = args.agent {
        config.client.program = agent;
    }
    if !args.agent_args.is_empty() {
        config.client.args = args.agent_args;
    }
    let idle_timeout = args.idle_timeout.map(Duration::from_secs);

    let client = RpcClient::new(config.client);
    client.start().await?;
    let outcome = execute(&client, args.command, idle_timeout).await;
    client.stop().await;
    outcome
}

async fn execute(
    client: &RpcClient,
    command: CtlCommand,
    idle_timeout: Option<Duration>,
) -> Result<()> {
    match command {
        CtlCommand::Prompt { message } => {
            for event in client
                .prompt_and_wait(message, Vec::new(), idle_timeout)
                .await?
            {
                println!("{}", event.0);
            }
        }
        CtlCommand::State => print_json(&client.get_state().await?)?,
        CtlCommand::Models => print_json(&client.get_available_models().await?)?,
        CtlCommand::Stats => print_json(&client.get_session_stats().await?)?,
        CtlCommand::Branches => print_json(&client.list_branches().await?)?,
        CtlCommand::Sessions => print_json(&client.list_sessions().await?)?,
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
