//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The server answered a command with `success: false`.
    Rpc(String),
    /// Malformed wire data (framing, JSON, or unexpected shape).
    Protocol(String),
    /// A request or idle wait exceeded its deadline.
    Timeout(String),
    /// Child process spawn, exit, or stdio failure.
    Process(String),
    /// The agent session rejected an operation.
    Agent(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Rpc(msg) => write!(f, "rpc: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Process(msg) => write!(f, "process: {msg}"),
            Self::Agent(msg) => write!(f, "agent: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// The bare message without the category prefix.
    ///
    /// Used when an error crosses the wire: the `error` field of a failed
    /// response carries the message only, never the local category.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Config(msg)
            | Self::Rpc(msg)
            | Self::Protocol(msg)
            | Self::Timeout(msg)
            | Self::Process(msg)
            | Self::Agent(msg)
            | Self::NotFound(msg)
            | Self::Io(msg) => msg,
        }
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
