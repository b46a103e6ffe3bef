//! Lifecycle events raised by the reference agent session.
//!
//! The vocabulary never uses the tag `response`, so an event line can be
//! told apart from a response line by its `type` alone.

use serde::{Deserialize, Serialize};

use crate::session::{AgentMessage, BranchInfo};

/// Event emitted through [`AgentSession::subscribe`](crate::session::AgentSession::subscribe).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum AgentEvent {
    /// A prompt was accepted and the agent started working.
    AgentStart,
    /// The agent finished; carries every message produced by the run.
    AgentEnd {
        /// Messages appended during the run, in order.
        messages: Vec<AgentMessage>,
    },
    /// A model turn began.
    TurnStart,
    /// A model turn finished.
    TurnEnd {
        /// The assistant message the turn produced.
        message: AgentMessage,
    },
    /// A message was appended to the history.
    MessageStart {
        /// Message as of its creation.
        message: AgentMessage,
    },
    /// A streamed assistant message grew.
    MessageUpdate {
        /// Message including every chunk so far.
        message: AgentMessage,
        /// The chunk that was just appended.
        delta: String,
    },
    /// A message is complete.
    MessageEnd {
        /// Final message.
        message: AgentMessage,
    },
    /// The queued-message list changed.
    QueueUpdate {
        /// Texts still waiting for delivery.
        queued: Vec<String>,
    },
    /// Older history was folded into a summary.
    Compaction {
        /// Branch that was compacted.
        branch: String,
        /// Messages replaced by the summary.
        removed_messages: usize,
    },
    /// Another session file was loaded.
    SessionSwitched {
        /// Id of the loaded session.
        session_id: String,
    },
    /// The active branch changed.
    BranchSwitched {
        /// Newly active branch.
        branch: BranchInfo,
    },
}

impl AgentEvent {
    /// Wire name of the event's `type` tag.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AgentStart => "agent_start",
            Self::AgentEnd { .. } => "agent_end",
            Self::TurnStart => "turn_start",
            Self::TurnEnd { .. } => "turn_end",
            Self::MessageStart { .. } => "message_start",
            Self::MessageUpdate { .. } => "message_update",
            Self::MessageEnd { .. } => "message_end",
            Self::QueueUpdate { .. } => "queue_update",
            Self::Compaction { .. } => "compaction",
            Self::SessionSwitched { .. } => "session_switched",
            Self::BranchSwitched { .. } => "branch_switched",
        }
    }
}
