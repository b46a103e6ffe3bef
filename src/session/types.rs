//! Value types exchanged with an agent session.
//!
//! Every type here is serialised with camelCase field names because the
//! same values travel verbatim inside response `data` payloads and event
//! bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a model the agent can run against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    /// Provider name, e.g. `google`.
    pub provider: String,
    /// Model identifier within the provider.
    pub model_id: String,
    /// Human-readable name.
    pub name: String,
    /// Whether thinking levels above `off` are honoured.
    #[serde(default)]
    pub reasoning: bool,
}

impl ModelInfo {
    /// `provider/model_id` reference string.
    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}/{}", self.provider, self.model_id)
    }
}

/// Reasoning effort requested from the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingLevel {
    /// No extended reasoning.
    #[default]
    Off,
    /// Minimal reasoning budget.
    Minimal,
    /// Low reasoning budget.
    Low,
    /// Medium reasoning budget.
    Medium,
    /// High reasoning budget.
    High,
}

/// How queued messages are delivered once the current turn ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueMode {
    /// Deliver every queued message together in the next turn.
    All,
    /// Deliver one queued message per turn.
    #[default]
    OneAtATime,
}

/// Kind of an attached file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    /// An image, sent to the model as-is.
    Image,
    /// A document whose text was extracted client-side.
    Document,
}

/// File attached to a prompt. `content` is base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Client-assigned attachment id.
    pub id: String,
    /// Attachment kind.
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    /// Original file name.
    pub file_name: String,
    /// MIME type of the decoded content.
    pub mime_type: String,
    /// Size of the decoded content in bytes.
    #[serde(default)]
    pub size: u64,
    /// Base64-encoded file content.
    pub content: String,
    /// Text extracted from a document attachment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
}

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Message written by the driving user.
    User,
    /// Message generated by the model.
    Assistant,
    /// Compaction summary standing in for older messages.
    Summary,
}

/// Why an assistant message stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The reply completed normally.
    Stop,
    /// The reply was cut short by `abort`.
    Aborted,
    /// The model call failed; see `error_message`.
    Error,
}

/// One message of the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    /// Author.
    pub role: Role,
    /// Text content.
    pub content: String,
    /// Files attached to a user message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// `provider/id` of the model that produced an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Stop reason of an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    /// Failure text when `stop_reason` is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AgentMessage {
    /// A user message stamped with the current time.
    #[must_use]
    pub fn user(content: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            attachments,
            timestamp: Utc::now(),
            model: None,
            stop_reason: None,
            error_message: None,
        }
    }

    /// An empty assistant message about to be streamed into.
    #[must_use]
    pub fn assistant(model: &ModelInfo) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            attachments: Vec::new(),
            timestamp: Utc::now(),
            model: Some(model.reference()),
            stop_reason: None,
            error_message: None,
        }
    }

    /// A compaction summary message.
    #[must_use]
    pub fn summary(content: impl Into<String>) -> Self {
        Self {
            role: Role::Summary,
            content: content.into(),
            attachments: Vec::new(),
            timestamp: Utc::now(),
            model: None,
            stop_reason: None,
            error_message: None,
        }
    }

    /// Rough token estimate (four bytes per token).
    #[must_use]
    pub fn estimated_tokens(&self) -> u64 {
        let bytes = self.content.len()
            + self
                .attachments
                .iter()
                .filter_map(|a| a.extracted_text.as_ref())
                .map(String::len)
                .sum::<usize>();
        (bytes as u64).div_ceil(4)
    }
}

/// Outcome of `compact`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionResult {
    /// Text of the summary message that replaced older history.
    pub summary: String,
    /// Number of messages folded into the summary.
    pub removed_messages: usize,
    /// Number of recent messages kept verbatim.
    pub kept_messages: usize,
    /// Estimated tokens of the branch before compaction.
    pub tokens_before: u64,
    /// Estimated tokens of the branch after compaction.
    pub tokens_after: u64,
}

/// Aggregate counters returned by `get_session_stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    /// Current session id.
    pub session_id: String,
    /// Backing session file, when persistence is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_file: Option<String>,
    /// User messages on the active branch.
    pub user_messages: usize,
    /// Assistant messages on the active branch.
    pub assistant_messages: usize,
    /// All messages on the active branch.
    pub total_messages: usize,
    /// Number of branches.
    pub branches: usize,
    /// Number of checkpoints.
    pub checkpoints: usize,
    /// Estimated tokens on the active branch.
    pub estimated_tokens: u64,
}

/// A persisted session found by `list_sessions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session file path.
    pub path: String,
    /// Session id from the file header.
    pub session_id: String,
    /// Header timestamp.
    pub created_at: DateTime<Utc>,
    /// Message entries in the file, across all branches.
    pub message_count: usize,
}

/// A conversation branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchInfo {
    /// Branch name.
    pub name: String,
    /// Messages on the branch.
    pub message_count: usize,
    /// Whether this is the active branch.
    pub active: bool,
}

/// Outcome of `merge_branch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    /// Branch merged from.
    pub source: String,
    /// Branch merged into.
    pub target: String,
    /// Messages appended to the target.
    pub merged_messages: usize,
}

/// A named marker on a branch's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Unique checkpoint id.
    pub id: String,
    /// Caller-supplied name.
    pub name: String,
    /// Branch the checkpoint was taken on.
    pub branch: String,
    /// Number of messages on the branch when taken.
    pub message_index: usize,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Arbitrary caller metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}
