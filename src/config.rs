//! Configuration parsing, defaults, and validation.
//!
//! A single TOML file configures both halves of the protocol: the
//! `[client]` table controls how `agent-relay-ctl` (or any embedder of
//! [`RpcClient`](crate::rpc::client::RpcClient)) spawns and talks to the
//! child, and the `[agent]` table plus `[[models]]` configure the
//! reference session served by the `agent-relay` binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::session::ModelInfo;
use crate::{AppError, Result};

/// Settings used by the client side when spawning and driving a child.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClientConfig {
    /// Program launched as the headless child.
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments passed to the child program.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory of the child; inherits the caller's when unset.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Per-request response timeout.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Default timeout for `wait_for_idle` / `collect_events`.
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
    /// Delay after spawn before checking for an early exit.
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    /// Time allowed for a clean exit after SIGTERM before SIGKILL.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Fail outstanding requests as soon as the child's stdout closes
    /// instead of letting each one run into its timeout.
    #[serde(default)]
    pub fail_pending_on_exit: bool,
}

fn default_program() -> String {
    "agent-relay".into()
}

fn default_request_timeout_seconds() -> u64 {
    30
}

fn default_idle_timeout_seconds() -> u64 {
    60
}

fn default_startup_grace_ms() -> u64 {
    100
}

fn default_shutdown_grace_ms() -> u64 {
    1000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            cwd: None,
            request_timeout_seconds: default_request_timeout_seconds(),
            idle_timeout_seconds: default_idle_timeout_seconds(),
            startup_grace_ms: default_startup_grace_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            fail_pending_on_exit: false,
        }
    }
}

impl ClientConfig {
    /// Per-request response timeout as a [`Duration`].
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Default idle-wait timeout as a [`Duration`].
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    /// Post-spawn grace delay as a [`Duration`].
    #[must_use]
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    /// Shutdown grace period as a [`Duration`].
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Settings for the reference agent session served by `agent-relay`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Directory for JSONL session files; `None` disables persistence.
    #[serde(default)]
    pub session_dir: Option<PathBuf>,
    /// Model selected at startup, as `provider/id`; the first registry
    /// entry when unset.
    #[serde(default)]
    pub default_model: Option<String>,
    /// Messages kept verbatim by `compact` when the command omits it.
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
    /// Delay between streamed chunks of an assistant reply.
    #[serde(default)]
    pub chunk_delay_ms: u64,
}

fn default_keep_recent() -> usize {
    4
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            session_dir: None,
            default_model: None,
            keep_recent: default_keep_recent(),
            chunk_delay_ms: 0,
        }
    }
}

/// Entry of the `[[models]]` registry.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ModelEntry {
    /// Provider name, e.g. `local` or `google`.
    pub provider: String,
    /// Model identifier within the provider.
    pub id: String,
    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
    /// Whether the model supports thinking levels above `off`.
    #[serde(default)]
    pub reasoning: bool,
}

impl From<&ModelEntry> for ModelInfo {
    fn from(entry: &ModelEntry) -> Self {
        Self {
            provider: entry.provider.clone(),
            model_id: entry.id.clone(),
            name: entry.name.clone().unwrap_or_else(|| entry.id.clone()),
            reasoning: entry.reasoning,
        }
    }
}

fn default_models() -> Vec<ModelEntry> {
    vec![ModelEntry {
        provider: "local".into(),
        id: "echo".into(),
        name: Some("Echo".into()),
        reasoning: false,
    }]
}

/// Top-level configuration parsed from `relay.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RelayConfig {
    /// Client-side process and timeout settings.
    #[serde(default)]
    pub client: ClientConfig,
    /// Reference agent settings.
    #[serde(default)]
    pub agent: AgentConfig,
    /// Models the reference agent may switch between.
    #[serde(default = "default_models")]
    pub models: Vec<ModelEntry>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            agent: AgentConfig::default(),
            models: default_models(),
        }
    }
}

impl RelayConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Models from the registry in declaration order.
    #[must_use]
    pub fn model_infos(&self) -> Vec<ModelInfo> {
        self.models.iter().map(ModelInfo::from).collect()
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.client.request_timeout_seconds == 0 {
            return Err(AppError::Config(
                "request_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.client.idle_timeout_seconds == 0 {
            return Err(AppError::Config(
                "idle_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.models.is_empty() {
            return Err(AppError::Config("models must not be empty".into()));
        }

        if let Some(ref spec) = self.agent.default_model {
            let (provider, id) = split_model_spec(spec)?;
            if !self
                .models
                .iter()
                .any(|m| m.provider == provider && m.id == id)
            {
                return Err(AppError::Config(format!(
                    "default_model '{spec}' is not in the models registry"
                )));
            }
        }

        Ok(())
    }
}

/// Split a `provider/id` model reference.
///
/// # Errors
///
/// Returns `AppError::Config` when the reference has no `/` separator or
/// either side is empty.
pub fn split_model_spec(spec: &str) -> Result<(&str, &str)> {
    match spec.split_once('/') {
        Some((provider, id)) if !provider.is_empty() && !id.is_empty() => Ok((provider, id)),
        _ => Err(AppError::Config(format!(
            "model reference '{spec}' must have the form provider/id"
        ))),
    }
}
