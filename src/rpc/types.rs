//! Wire protocol: commands, responses, and the session-state snapshot.
//!
//! ## Requests (client → server)
//!
//! ```json
//! {"id":"req_1","type":"prompt","message":"hi"}
//! {"id":"req_2","type":"set_model","provider":"google","modelId":"model-x"}
//! {"type":"abort"}
//! ```
//!
//! ## Responses (server → client)
//!
//! ```json
//! {"id":"req_1","type":"response","command":"prompt","success":true}
//! {"id":"req_2","type":"response","command":"set_model","success":false,"error":"Model not found: google/model-x"}
//! {"type":"response","command":"parse","success":false,"error":"..."}
//! ```
//!
//! Any other line on the server's output is an event: it has its own
//! `type` and never carries `success`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{
    AgentMessage, Attachment, BranchInfo, Checkpoint, ModelInfo, QueueMode, SessionSummary,
    ThinkingLevel,
};

/// Value of the `type` field on every response line.
pub const RESPONSE_TYPE: &str = "response";

/// `command` reported for lines that could not be parsed at all.
pub const PARSE_COMMAND: &str = "parse";

/// Every command the server understands.
///
/// Adding a variant makes the dispatcher's `match` non-exhaustive until a
/// handler is written for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum Command {
    /// Start a run; acknowledged before the run completes.
    Prompt {
        /// User message text.
        message: String,
        /// Files attached to the message.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
    },
    /// Queue a message for delivery after the current turn.
    QueueMessage {
        /// Message text.
        message: String,
    },
    /// Cancel the in-flight generation.
    Abort,
    /// Discard the session and start fresh.
    Reset,
    /// Snapshot of the session state.
    GetState,
    /// Messages on the active branch.
    GetMessages,
    /// Models the agent can switch to.
    GetAvailableModels,
    /// Switch model.
    SetModel {
        /// Provider name.
        provider: String,
        /// Model id within the provider.
        model_id: String,
    },
    /// Change the thinking level.
    SetThinkingLevel {
        /// Requested level.
        level: ThinkingLevel,
    },
    /// Change queued-message delivery.
    SetQueueMode {
        /// Requested mode.
        mode: QueueMode,
    },
    /// Summarise older history.
    Compact {
        /// Messages to keep verbatim.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        keep_recent: Option<usize>,
    },
    /// Aggregate session counters.
    GetSessionStats,
    /// Write an HTML transcript.
    ExportHtml {
        /// Destination file; defaults to the working directory.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_path: Option<String>,
    },
    /// Load another session file.
    SwitchSession {
        /// Session file to load.
        session_path: String,
    },
    /// Persisted sessions.
    ListSessions,
    /// Create a branch.
    CreateBranch {
        /// Branch name.
        name: String,
        /// Copy only the first `from_index` messages.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_index: Option<usize>,
    },
    /// Switch the active branch.
    SwitchBranch {
        /// Branch name.
        name: String,
    },
    /// Create a branch and switch to it.
    Branch {
        /// Branch name.
        name: String,
        /// Copy only the first `from_index` messages.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_index: Option<usize>,
    },
    /// Every branch.
    ListBranches,
    /// Merge one branch into another.
    MergeBranch {
        /// Branch to merge from.
        source: String,
        /// Branch to merge into; defaults to the active branch.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    /// Record a checkpoint.
    CreateCheckpoint {
        /// Checkpoint name.
        name: String,
        /// Arbitrary metadata stored with the checkpoint.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    /// Every checkpoint.
    ListCheckpoints,
}

impl Command {
    /// Every wire name, in declaration order.
    pub const NAMES: &'static [&'static str] = &[
        "prompt",
        "queue_message",
        "abort",
        "reset",
        "get_state",
        "get_messages",
        "get_available_models",
        "set_model",
        "set_thinking_level",
        "set_queue_mode",
        "compact",
        "get_session_stats",
        "export_html",
        "switch_session",
        "list_sessions",
        "create_branch",
        "switch_branch",
        "branch",
        "list_branches",
        "merge_branch",
        "create_checkpoint",
        "list_checkpoints",
    ];

    /// Wire name of this command's `type` tag.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Prompt { .. } => "prompt",
            Self::QueueMessage { .. } => "queue_message",
            Self::Abort => "abort",
            Self::Reset => "reset",
            Self::GetState => "get_state",
            Self::GetMessages => "get_messages",
            Self::GetAvailableModels => "get_available_models",
            Self::SetModel { .. } => "set_model",
            Self::SetThinkingLevel { .. } => "set_thinking_level",
            Self::SetQueueMode { .. } => "set_queue_mode",
            Self::Compact { .. } => "compact",
            Self::GetSessionStats => "get_session_stats",
            Self::ExportHtml { .. } => "export_html",
            Self::SwitchSession { .. } => "switch_session",
            Self::ListSessions => "list_sessions",
            Self::CreateBranch { .. } => "create_branch",
            Self::SwitchBranch { .. } => "switch_branch",
            Self::Branch { .. } => "branch",
            Self::ListBranches => "list_branches",
            Self::MergeBranch { .. } => "merge_branch",
            Self::CreateCheckpoint { .. } => "create_checkpoint",
            Self::ListCheckpoints => "list_checkpoints",
        }
    }

    /// Whether `name` is the wire name of a known command.
    #[must_use]
    pub fn is_known(name: &str) -> bool {
        Self::NAMES.contains(&name)
    }
}

/// A command plus its optional correlation id, as written on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Client-assigned correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// The command itself; its fields sit beside `id`.
    #[serde(flatten)]
    pub command: Command,
}

impl RpcRequest {
    /// Wrap `command` with a correlation id.
    #[must_use]
    pub fn new(id: impl Into<String>, command: Command) -> Self {
        Self {
            id: Some(id.into()),
            command,
        }
    }
}

/// Reply to one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Echoed correlation id; absent when the command had none or it could
    /// not be recovered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Always [`RESPONSE_TYPE`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Name of the command being answered.
    pub command: String,
    /// Whether the command succeeded.
    pub success: bool,
    /// Command-specific payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    /// Successful response, with or without data.
    #[must_use]
    pub fn success(id: Option<String>, command: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            id,
            kind: RESPONSE_TYPE.to_owned(),
            command: command.into(),
            success: true,
            data,
            error: None,
        }
    }

    /// Failed response.
    #[must_use]
    pub fn error(
        id: Option<String>,
        command: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id,
            kind: RESPONSE_TYPE.to_owned(),
            command: command.into(),
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Point-in-time projection of the session returned by `get_state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcSessionState {
    /// Selected model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelInfo>,
    /// Current thinking level.
    pub thinking_level: ThinkingLevel,
    /// Whether a run is in flight.
    pub is_streaming: bool,
    /// Queued-message delivery mode.
    pub queue_mode: QueueMode,
    /// Backing session file, when persistence is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_file: Option<String>,
    /// Session id.
    pub session_id: String,
    /// Active branch name.
    pub active_branch: String,
    /// All branch names.
    pub branches: Vec<String>,
    /// Messages on the active branch.
    pub message_count: usize,
    /// Messages waiting for delivery.
    pub queued_message_count: usize,
}

/// `data` of `get_messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesData {
    /// Messages on the active branch.
    pub messages: Vec<AgentMessage>,
}

/// `data` of `get_available_models`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelsData {
    /// Registered models.
    pub models: Vec<ModelInfo>,
}

/// `data` of `set_thinking_level`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingLevelData {
    /// Level in effect after the change.
    pub level: ThinkingLevel,
}

/// `data` of `export_html`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportData {
    /// Written file.
    pub path: String,
}

/// `data` of `list_sessions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionsData {
    /// Persisted sessions, newest first.
    pub sessions: Vec<SessionSummary>,
}

/// `data` of `list_branches`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchesData {
    /// Every branch.
    pub branches: Vec<BranchInfo>,
}

/// `data` of `list_checkpoints`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointsData {
    /// Every checkpoint, oldest first.
    pub checkpoints: Vec<Checkpoint>,
}
