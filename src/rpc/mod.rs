//! JSON Lines RPC over a child process's stdio.
//!
//! - [`types`]: commands, responses and typed payloads on the wire.
//! - [`codec`]: newline framing with a maximum line length.
//! - [`writer`]: the single outbound writer task.
//! - [`server`]: the dispatcher run by the headless process.
//! - [`reader`], [`spawner`], [`client`]: the parent side.

pub mod client;
pub mod codec;
pub mod reader;
pub mod server;
pub mod spawner;
pub mod types;
pub mod writer;
