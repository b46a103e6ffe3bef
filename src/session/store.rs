//! JSONL session files.
//!
//! One file per session, named `<timestamp>_<session-id>.jsonl`. The first
//! line is a [`SessionEntry::Session`] header; every following line is an
//! entry appended as the conversation changes. Replaying the entries in
//! order rebuilds the branches and checkpoints of the session.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::session::{AgentMessage, Checkpoint, SessionSummary};
use crate::{AppError, Result};

/// Name of the branch every session starts on.
pub const MAIN_BRANCH: &str = "main";

/// One line of a session file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum SessionEntry {
    /// File header.
    Session {
        /// Session id.
        id: String,
        /// Creation time.
        timestamp: DateTime<Utc>,
        /// Working directory of the server that created the file.
        cwd: String,
    },
    /// A message appended to a branch.
    Message {
        /// Branch the message belongs to.
        branch: String,
        /// The message.
        message: AgentMessage,
    },
    /// A branch forked from the first `from_index` messages of `from`.
    Branch {
        /// New branch name.
        name: String,
        /// Parent branch.
        from: String,
        /// Number of parent messages copied.
        from_index: usize,
    },
    /// Older history of `branch` folded into `summary`.
    Compaction {
        /// Compacted branch.
        branch: String,
        /// Messages kept verbatim after the summary.
        keep_recent: usize,
        /// Summary text.
        summary: String,
    },
    /// A checkpoint was recorded.
    Checkpoint {
        /// The checkpoint.
        checkpoint: Checkpoint,
    },
}

/// Session state rebuilt from a file.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayedSession {
    /// Session id from the header.
    pub id: String,
    /// Header timestamp.
    pub created_at: DateTime<Utc>,
    /// Messages per branch; always contains [`MAIN_BRANCH`].
    pub branches: BTreeMap<String, Vec<AgentMessage>>,
    /// Checkpoints in creation order.
    pub checkpoints: Vec<Checkpoint>,
}

/// Replace all but the last `keep_recent` messages with `summary`.
///
/// Returns the number of messages removed.
pub fn apply_compaction(
    messages: &mut Vec<AgentMessage>,
    keep_recent: usize,
    summary: AgentMessage,
) -> usize {
    let removed = messages.len().saturating_sub(keep_recent);
    if removed == 0 {
        return 0;
    }
    messages.drain(..removed);
    messages.insert(0, summary);
    removed
}

/// Directory of session files.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Store rooted at `dir`; the directory is created on first use.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the session files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create a new session file containing only its header.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory or file cannot be written.
    pub async fn create(&self, id: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|err| {
            AppError::Io(format!(
                "failed to create session dir {}: {err}",
                self.dir.display()
            ))
        })?;

        let now = Utc::now();
        let path = self
            .dir
            .join(format!("{}_{id}.jsonl", now.format("%Y-%m-%dT%H-%M-%S%.3fZ")));
        let cwd = std::env::current_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        append(
            &path,
            &SessionEntry::Session {
                id: id.to_owned(),
                timestamp: now,
                cwd,
            },
        )
        .await?;

        debug!(path = %path.display(), "session file created");
        Ok(path)
    }

    /// Every readable session in the directory, newest first.
    ///
    /// Files that cannot be parsed are skipped with a warning. A missing
    /// directory yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory path is not a valid pattern.
    pub async fn list(&self) -> Result<Vec<SessionSummary>> {
        let dir = glob::Pattern::escape(&self.dir.to_string_lossy());
        let pattern = format!("{dir}/*.jsonl");
        let paths = glob::glob(&pattern)
            .map_err(|err| AppError::Io(format!("invalid session pattern: {err}")))?;

        let mut sessions = Vec::new();
        for path in paths.flatten() {
            match load(&path).await {
                Ok(replayed) => sessions.push(SessionSummary {
                    path: path.to_string_lossy().into_owned(),
                    session_id: replayed.id,
                    created_at: replayed.created_at,
                    message_count: replayed.branches.values().map(Vec::len).sum(),
                }),
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping unreadable session file");
                }
            }
        }

        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }
}

/// Append one entry to the session file at `path`.
///
/// # Errors
///
/// Returns `AppError::Io` on write failure.
pub async fn append(path: &Path, entry: &SessionEntry) -> Result<()> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|err| AppError::Io(format!("failed to open {}: {err}", path.display())))?;
    file.write_all(&line)
        .await
        .map_err(|err| AppError::Io(format!("failed to append to {}: {err}", path.display())))?;
    file.flush()
        .await
        .map_err(|err| AppError::Io(format!("failed to flush {}: {err}", path.display())))?;
    Ok(())
}

/// Replay the session file at `path`.
///
/// # Errors
///
/// - `AppError::NotFound` if the file does not exist.
/// - `AppError::Protocol` if the header is missing or a line is not a
///   valid entry.
/// - `AppError::Io` on other read failures.
pub async fn load(path: &Path) -> Result<ReplayedSession> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            AppError::NotFound(format!("session file {}", path.display()))
        } else {
            AppError::Io(format!("failed to read {}: {err}", path.display()))
        }
    })?;

    let mut lines = raw.lines().filter(|line| !line.trim().is_empty());

    let header = lines
        .next()
        .ok_or_else(|| AppError::Protocol(format!("{} is empty", path.display())))?;
    let SessionEntry::Session { id, timestamp, .. } = parse_entry(path, header)? else {
        return Err(AppError::Protocol(format!(
            "{} does not start with a session header",
            path.display()
        )));
    };

    let mut replayed = ReplayedSession {
        id,
        created_at: timestamp,
        branches: BTreeMap::from([(MAIN_BRANCH.to_owned(), Vec::new())]),
        checkpoints: Vec::new(),
    };

    for line in lines {
        match parse_entry(path, line)? {
            SessionEntry::Session { .. } => {
                warn!(path = %path.display(), "ignoring repeated session header");
            }
            SessionEntry::Message { branch, message } => {
                replayed.branches.entry(branch).or_default().push(message);
            }
            SessionEntry::Branch {
                name,
                from,
                from_index,
            } => {
                let parent = replayed.branches.get(&from).cloned().unwrap_or_default();
                let forked = parent.into_iter().take(from_index).collect();
                replayed.branches.insert(name, forked);
            }
            SessionEntry::Compaction {
                branch,
                keep_recent,
                summary,
            } => {
                let messages = replayed.branches.entry(branch).or_default();
                apply_compaction(messages, keep_recent, AgentMessage::summary(summary));
            }
            SessionEntry::Checkpoint { checkpoint } => replayed.checkpoints.push(checkpoint),
        }
    }

    Ok(replayed)
}

fn parse_entry(path: &Path, line: &str) -> Result<SessionEntry> {
    serde_json::from_str(line).map_err(|err| {
        AppError::Protocol(format!("invalid entry in {}: {err}", path.display()))
    })
}
