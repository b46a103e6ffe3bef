//! Agent session abstraction.
//!
//! The [`AgentSession`] trait is the narrow surface the RPC dispatcher
//! drives. Implementations own all conversation state; the dispatcher
//! holds one session for the life of the process and reaches it only
//! through these methods.
//!
//! [`local::LocalSession`] is the in-process implementation served by the
//! `agent-relay` binary.

pub mod events;
pub mod local;
pub mod store;
pub mod types;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use tokio::sync::mpsc;

pub use events::AgentEvent;
pub use types::{
    AgentMessage, Attachment, AttachmentKind, BranchInfo, Checkpoint, CompactionResult,
    MergeResult, ModelInfo, QueueMode, Role, SessionStats, SessionSummary, StopReason,
    ThinkingLevel,
};

use crate::rpc::types::RpcSessionState;
use crate::Result;

/// Boxed, sendable future returned by asynchronous session operations.
pub type SessionFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Interface between the RPC dispatcher and a stateful agent.
pub trait AgentSession: Send + Sync + 'static {
    /// Run a prompt to completion.
    ///
    /// Resolves once the agent is idle again. Progress and the outcome are
    /// reported through [`subscribe`](Self::subscribe); the returned error
    /// covers only failures that prevent the run from starting.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Agent`](crate::AppError::Agent) if the session is
    /// already streaming, has no model, or the message is empty.
    fn prompt(&self, message: String, attachments: Vec<Attachment>) -> SessionFuture<'_, ()>;

    /// Queue a message for delivery after the current turn.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Agent`](crate::AppError::Agent) for an empty message.
    fn queue_message(&self, message: String) -> SessionFuture<'_, ()>;

    /// Cancel the in-flight generation. A no-op when idle.
    ///
    /// # Errors
    ///
    /// Implementations should not fail; the signature allows I/O-backed agents.
    fn abort(&self) -> SessionFuture<'_, ()>;

    /// Abort, discard all history, and start a fresh session. Safe when empty.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`](crate::AppError::Io) if a new session file
    /// cannot be created.
    fn reset(&self) -> SessionFuture<'_, ()>;

    /// Point-in-time snapshot of the session.
    fn state(&self) -> RpcSessionState;

    /// Messages on the active branch.
    fn messages(&self) -> Vec<AgentMessage>;

    /// Models the session may switch to.
    fn available_models(&self) -> Vec<ModelInfo>;

    /// Select a model from the registry.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`](crate::AppError::NotFound) with
    /// `Model not found: provider/id` for unknown models.
    fn change_model(&self, provider: String, model_id: String) -> SessionFuture<'_, ModelInfo>;

    /// Set the thinking level and return the effective level.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Agent`](crate::AppError::Agent) if no model is selected.
    fn update_thinking_level(&self, level: ThinkingLevel) -> Result<ThinkingLevel>;

    /// Set how queued messages are delivered.
    fn set_queue_mode(&self, mode: QueueMode);

    /// Fold older history of the active branch into a summary.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Agent`](crate::AppError::Agent) while streaming or
    /// when nothing is old enough to compact.
    fn compact_history(&self, keep_recent: Option<usize>) -> SessionFuture<'_, CompactionResult>;

    /// Aggregate counters for the session.
    fn session_stats(&self) -> SessionStats;

    /// Write an HTML transcript and return its path.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`](crate::AppError::Io) if the file cannot be written.
    fn export_to_html(&self, path: Option<PathBuf>) -> SessionFuture<'_, PathBuf>;

    /// Replace the current session with one loaded from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Agent`](crate::AppError::Agent) while streaming, or
    /// an I/O / protocol error if the file cannot be loaded.
    fn switch_session(&self, path: PathBuf) -> SessionFuture<'_, ()>;

    /// Persisted sessions, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`](crate::AppError::Io) if the directory cannot be read.
    fn list_sessions(&self) -> SessionFuture<'_, Vec<SessionSummary>>;

    /// Create a branch from the first `from_index` messages of the active branch.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Agent`](crate::AppError::Agent) for duplicate
    /// names or an out-of-range index.
    fn create_branch(&self, name: String, from_index: Option<usize>)
        -> SessionFuture<'_, BranchInfo>;

    /// Make `name` the active branch.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`](crate::AppError::NotFound) for unknown
    /// branches, [`AppError::Agent`](crate::AppError::Agent) while streaming.
    fn switch_branch(&self, name: String) -> SessionFuture<'_, ()>;

    /// Create a branch and switch to it.
    ///
    /// # Errors
    ///
    /// Any error of [`create_branch`](Self::create_branch) or
    /// [`switch_branch`](Self::switch_branch).
    fn branch_and_switch(
        &self,
        name: String,
        from_index: Option<usize>,
    ) -> SessionFuture<'_, BranchInfo>;

    /// Every branch with its size.
    fn list_branches(&self) -> Vec<BranchInfo>;

    /// Append the divergent tail of `source` to `target` (default: active).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`](crate::AppError::NotFound) for unknown
    /// branches, [`AppError::Agent`](crate::AppError::Agent) when merging a
    /// branch into itself.
    fn smart_merge_branch(
        &self,
        source: String,
        target: Option<String>,
    ) -> SessionFuture<'_, MergeResult>;

    /// Record a named checkpoint at the end of the active branch.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Agent`](crate::AppError::Agent) for an empty name.
    fn create_checkpoint(
        &self,
        name: String,
        metadata: Option<serde_json::Value>,
    ) -> SessionFuture<'_, Checkpoint>;

    /// Every checkpoint, oldest first.
    fn list_checkpoints(&self) -> Vec<Checkpoint>;

    /// Register a new event receiver. Every event is delivered to every
    /// live receiver in emission order.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<AgentEvent>;
}
