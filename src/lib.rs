#![forbid(unsafe_code)]

//! Headless RPC control plane for a stateful conversational agent.
//!
//! The `agent-relay` binary serves an [`session::AgentSession`] over
//! stdin/stdout; [`rpc::client::RpcClient`] spawns it as a child and
//! drives it with correlated requests while receiving its events.

pub mod config;
pub mod errors;
pub mod rpc;
pub mod session;

pub use config::RelayConfig;
pub use errors::{AppError, Result};
