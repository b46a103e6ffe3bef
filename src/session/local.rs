//! In-process reference agent.
//!
//! [`LocalSession`] implements [`AgentSession`] without any network model:
//! replies come from a [`Responder`], by default the deterministic
//! [`EchoResponder`]. Everything else (branches, queued messages,
//! compaction, checkpoints, persistence, HTML export) is real, so the
//! server binary behaves like a full agent from the protocol's point of
//! view.
//!
//! State lives behind a `std::sync::Mutex` that is never held across an
//! `.await`; file appends are serialised by a separate async lock.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{split_model_spec, RelayConfig};
use crate::rpc::types::RpcSessionState;
use crate::session::store::{self, apply_compaction, SessionEntry, SessionStore, MAIN_BRANCH};
use crate::session::{
    AgentEvent, AgentMessage, AgentSession, Attachment, BranchInfo, Checkpoint, CompactionResult,
    MergeResult, ModelInfo, QueueMode, Role, SessionFuture, SessionStats, SessionSummary,
    StopReason, ThinkingLevel,
};
use crate::{AppError, Result};

/// Characters of each message quoted in a compaction summary.
const SUMMARY_SNIPPET_CHARS: usize = 80;

// ── Responder ────────────────────────────────────────────────

/// Input handed to a [`Responder`] for one turn.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Model selected for the turn.
    pub model: ModelInfo,
    /// Effective thinking level.
    pub thinking_level: ThinkingLevel,
    /// Active branch including the turn's user message.
    pub history: Vec<AgentMessage>,
}

/// Text generator behind a [`LocalSession`].
pub trait Responder: Send + Sync + 'static {
    /// Produce the reply for one turn as a sequence of streamed chunks.
    ///
    /// # Errors
    ///
    /// Any error is recorded on the assistant message with
    /// `stopReason: "error"`; it never aborts the run.
    fn generate(&self, request: GenerateRequest) -> SessionFuture<'_, Vec<String>>;
}

/// Replies with `Echo: <last user message>`, one word per chunk.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoResponder;

impl Responder for EchoResponder {
    fn generate(&self, request: GenerateRequest) -> SessionFuture<'_, Vec<String>> {
        Box::pin(async move {
            let last_user = request
                .history
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .ok_or_else(|| AppError::Agent("no user message to answer".into()))?;

            let mut reply = format!("Echo: {}", last_user.content);
            if !last_user.attachments.is_empty() {
                let names: Vec<&str> = last_user
                    .attachments
                    .iter()
                    .map(|a| a.file_name.as_str())
                    .collect();
                reply.push_str(&format!(" [attachments: {}]", names.join(", ")));
            }

            Ok(reply.split_inclusive(' ').map(str::to_owned).collect())
        })
    }
}

// ── State ────────────────────────────────────────────────────

#[derive(Debug)]
struct ActiveRun {
    id: u64,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct Inner {
    session_id: String,
    session_file: Option<PathBuf>,
    model: Option<ModelInfo>,
    thinking_level: ThinkingLevel,
    queue_mode: QueueMode,
    branches: BTreeMap<String, Vec<AgentMessage>>,
    active_branch: String,
    queued: VecDeque<String>,
    checkpoints: Vec<Checkpoint>,
    run: Option<ActiveRun>,
    next_run_id: u64,
}

impl Inner {
    fn fresh(session_id: String, session_file: Option<PathBuf>, model: Option<ModelInfo>) -> Self {
        Self {
            session_id,
            session_file,
            model,
            thinking_level: ThinkingLevel::Off,
            queue_mode: QueueMode::default(),
            branches: BTreeMap::from([(MAIN_BRANCH.to_owned(), Vec::new())]),
            active_branch: MAIN_BRANCH.to_owned(),
            queued: VecDeque::new(),
            checkpoints: Vec::new(),
            run: None,
            next_run_id: 0,
        }
    }

    fn active_messages(&self) -> &[AgentMessage] {
        self.branches
            .get(&self.active_branch)
            .map_or(&[], Vec::as_slice)
    }

    fn active_messages_mut(&mut self) -> &mut Vec<AgentMessage> {
        self.branches.entry(self.active_branch.clone()).or_default()
    }

    fn is_run_current(&self, run_id: u64) -> bool {
        self.run.as_ref().is_some_and(|run| run.id == run_id)
    }

    fn branch_info(&self, name: &str) -> Option<BranchInfo> {
        self.branches.get(name).map(|messages| BranchInfo {
            name: name.to_owned(),
            message_count: messages.len(),
            active: name == self.active_branch,
        })
    }

    fn ensure_idle(&self, action: &str) -> Result<()> {
        if self.run.is_some() {
            return Err(AppError::Agent(format!(
                "Cannot {action} while the agent is streaming"
            )));
        }
        Ok(())
    }

    fn file_name(&self) -> Option<String> {
        self.session_file
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
    }
}

// ── LocalSession ─────────────────────────────────────────────

/// Reference [`AgentSession`] backed by a [`Responder`].
pub struct LocalSession {
    models: Vec<ModelInfo>,
    responder: Arc<dyn Responder>,
    store: Option<SessionStore>,
    keep_recent: usize,
    chunk_delay: Duration,
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<AgentEvent>>>,
    file_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for LocalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSession")
            .field("models", &self.models)
            .field("store", &self.store)
            .field("keep_recent", &self.keep_recent)
            .finish_non_exhaustive()
    }
}

impl LocalSession {
    /// Open a session configured by `config`, answering with `responder`.
    ///
    /// Selects `agent.default_model` (or the first registry entry) and,
    /// when `agent.session_dir` is set, creates a new session file.
    ///
    /// # Errors
    ///
    /// - `AppError::Config` if `default_model` is malformed or unknown.
    /// - `AppError::Io` if the session file cannot be created.
    pub async fn open(config: &RelayConfig, responder: Arc<dyn Responder>) -> Result<Self> {
        let models = config.model_infos();

        let model = match config.agent.default_model.as_deref() {
            Some(spec) => {
                let (provider, id) = split_model_spec(spec)?;
                let found = models
                    .iter()
                    .find(|m| m.provider == provider && m.model_id == id)
                    .cloned();
                Some(found.ok_or_else(|| {
                    AppError::Config(format!("default_model '{spec}' is not in the models registry"))
                })?)
            }
            None => models.first().cloned(),
        };

        let store = config.agent.session_dir.clone().map(SessionStore::new);
        let session_id = Uuid::new_v4().to_string();
        let session_file = match store {
            Some(ref store) => Some(store.create(&session_id).await?),
            None => None,
        };

        info!(
            session_id = %session_id,
            model = model.as_ref().map(ModelInfo::reference).as_deref(),
            persisted = session_file.is_some(),
            "local session opened"
        );

        Ok(Self {
            models,
            responder,
            store,
            keep_recent: config.agent.keep_recent,
            chunk_delay: Duration::from_millis(config.agent.chunk_delay_ms),
            inner: Mutex::new(Inner::fresh(session_id, session_file, model)),
            listeners: Mutex::new(Vec::new()),
            file_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: AgentEvent) {
        debug!(event = event.kind(), "session event");
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Append `entries` to the session file, if any. Failures are logged;
    /// the in-memory change stands.
    async fn persist(&self, file: Option<PathBuf>, entries: Vec<SessionEntry>) {
        let Some(file) = file else {
            return;
        };
        let _guard = self.file_lock.lock().await;
        for entry in &entries {
            if let Err(err) = store::append(&file, entry).await {
                warn!(%err, path = %file.display(), "failed to persist session entry");
                return;
            }
        }
    }

    /// Run one turn: record `user`, stream the reply, record it.
    ///
    /// Returns `false` when the run was superseded by `reset` or a session
    /// switch and must stop without touching state.
    async fn run_turn(
        &self,
        run_id: u64,
        cancel: &CancellationToken,
        user: AgentMessage,
        produced: &mut Vec<AgentMessage>,
    ) -> bool {
        let (branch, file, request) = {
            let mut inner = self.inner();
            if !inner.is_run_current(run_id) {
                return false;
            }
            let Some(model) = inner.model.clone() else {
                return false;
            };
            inner.active_messages_mut().push(user.clone());
            let request = GenerateRequest {
                model,
                thinking_level: inner.thinking_level,
                history: inner.active_messages().to_vec(),
            };
            (
                inner.active_branch.clone(),
                inner.session_file.clone(),
                request,
            )
        };

        self.emit(AgentEvent::TurnStart);
        self.emit(AgentEvent::MessageStart {
            message: user.clone(),
        });
        self.emit(AgentEvent::MessageEnd {
            message: user.clone(),
        });
        self.persist(
            file.clone(),
            vec![SessionEntry::Message {
                branch: branch.clone(),
                message: user.clone(),
            }],
        )
        .await;
        produced.push(user);

        let mut reply = AgentMessage::assistant(&request.model);
        self.emit(AgentEvent::MessageStart {
            message: reply.clone(),
        });

        let generated = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            result = self.responder.generate(request) => Some(result),
        };

        match generated {
            None => reply.stop_reason = Some(StopReason::Aborted),
            Some(Err(err)) => {
                warn!(%err, "responder failed");
                reply.stop_reason = Some(StopReason::Error);
                reply.error_message = Some(err.message().to_owned());
            }
            Some(Ok(chunks)) => {
                reply.stop_reason = Some(self.stream_chunks(cancel, &mut reply, chunks).await);
            }
        }

        {
            let mut inner = self.inner();
            if !inner.is_run_current(run_id) {
                return false;
            }
            match inner.branches.get_mut(&branch) {
                Some(messages) => messages.push(reply.clone()),
                None => return false,
            }
        }

        self.emit(AgentEvent::MessageEnd {
            message: reply.clone(),
        });
        self.emit(AgentEvent::TurnEnd {
            message: reply.clone(),
        });
        self.persist(
            file,
            vec![SessionEntry::Message {
                branch,
                message: reply.clone(),
            }],
        )
        .await;
        produced.push(reply);
        true
    }

    async fn stream_chunks(
        &self,
        cancel: &CancellationToken,
        reply: &mut AgentMessage,
        chunks: Vec<String>,
    ) -> StopReason {
        for chunk in chunks {
            if !self.chunk_delay.is_zero() {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {}
                    () = tokio::time::sleep(self.chunk_delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return StopReason::Aborted;
            }
            reply.content.push_str(&chunk);
            self.emit(AgentEvent::MessageUpdate {
                message: reply.clone(),
                delta: chunk,
            });
        }
        StopReason::Stop
    }

    /// Take the next batch of queued messages according to the queue mode.
    fn take_queued(&self, run_id: u64) -> Option<AgentMessage> {
        let (text, remaining) = {
            let mut inner = self.inner();
            if !inner.is_run_current(run_id) || inner.queued.is_empty() {
                return None;
            }
            let text = match inner.queue_mode {
                QueueMode::OneAtATime => inner.queued.pop_front()?,
                QueueMode::All => inner.queued.drain(..).collect::<Vec<_>>().join("\n\n"),
            };
            (text, inner.queued.iter().cloned().collect())
        };
        self.emit(AgentEvent::QueueUpdate { queued: remaining });
        Some(AgentMessage::user(text, Vec::new()))
    }

    fn find_model(&self, provider: &str, model_id: &str) -> Option<&ModelInfo> {
        self.models
            .iter()
            .find(|m| m.provider == provider && m.model_id == model_id)
    }

    fn default_export_path(session_id: &str) -> Result<PathBuf> {
        let cwd = std::env::current_dir()
            .map_err(|err| AppError::Io(format!("failed to resolve working directory: {err}")))?;
        Ok(cwd.join(format!("session-{session_id}.html")))
    }

    fn do_create_branch(
        &self,
        name: &str,
        from_index: Option<usize>,
    ) -> Result<(BranchInfo, SessionEntry, Option<PathBuf>)> {
        if name.trim().is_empty() {
            return Err(AppError::Agent("Branch name must not be empty".into()));
        }

        let mut inner = self.inner();
        if inner.branches.contains_key(name) {
            return Err(AppError::Agent(format!("Branch already exists: {name}")));
        }

        let parent = inner.active_branch.clone();
        let source = inner.active_messages();
        let from_index = from_index.unwrap_or(source.len());
        if from_index > source.len() {
            return Err(AppError::Agent(format!(
                "fromIndex {from_index} exceeds the {} messages on branch {parent}",
                source.len()
            )));
        }

        let forked = source[..from_index].to_vec();
        inner.branches.insert(name.to_owned(), forked);

        let info = BranchInfo {
            name: name.to_owned(),
            message_count: from_index,
            active: false,
        };
        let entry = SessionEntry::Branch {
            name: name.to_owned(),
            from: parent,
            from_index,
        };
        Ok((info, entry, inner.session_file.clone()))
    }

    fn do_switch_branch(&self, name: &str) -> Result<BranchInfo> {
        let info = {
            let mut inner = self.inner();
            inner.ensure_idle("switch branches")?;
            if !inner.branches.contains_key(name) {
                return Err(AppError::NotFound(format!("Branch not found: {name}")));
            }
            name.clone_into(&mut inner.active_branch);
            inner
                .branch_info(name)
                .ok_or_else(|| AppError::NotFound(format!("Branch not found: {name}")))?
        };
        self.emit(AgentEvent::BranchSwitched {
            branch: info.clone(),
        });
        Ok(info)
    }
}

impl AgentSession for LocalSession {
    fn prompt(&self, message: String, attachments: Vec<Attachment>) -> SessionFuture<'_, ()> {
        Box::pin(async move {
            if message.trim().is_empty() && attachments.is_empty() {
                return Err(AppError::Agent("Message must not be empty".into()));
            }

            let (run_id, cancel) = {
                let mut inner = self.inner();
                if inner.run.is_some() {
                    return Err(AppError::Agent(
                        "Agent is already processing a prompt".into(),
                    ));
                }
                if inner.model.is_none() {
                    return Err(AppError::Agent("No model selected".into()));
                }
                inner.next_run_id += 1;
                let run = ActiveRun {
                    id: inner.next_run_id,
                    cancel: CancellationToken::new(),
                };
                let handle = (run.id, run.cancel.clone());
                inner.run = Some(run);
                handle
            };

            self.emit(AgentEvent::AgentStart);

            let mut produced = Vec::new();
            let mut next = Some(AgentMessage::user(message, attachments));
            while let Some(user) = next.take() {
                if !self.run_turn(run_id, &cancel, user, &mut produced).await {
                    break;
                }
                if cancel.is_cancelled() {
                    break;
                }
                next = self.take_queued(run_id);
            }

            {
                let mut inner = self.inner();
                if inner.is_run_current(run_id) {
                    inner.run = None;
                }
            }
            self.emit(AgentEvent::AgentEnd { messages: produced });
            Ok(())
        })
    }

    fn queue_message(&self, message: String) -> SessionFuture<'_, ()> {
        Box::pin(async move {
            if message.trim().is_empty() {
                return Err(AppError::Agent("Message must not be empty".into()));
            }
            let queued = {
                let mut inner = self.inner();
                inner.queued.push_back(message);
                inner.queued.iter().cloned().collect()
            };
            self.emit(AgentEvent::QueueUpdate { queued });
            Ok(())
        })
    }

    fn abort(&self) -> SessionFuture<'_, ()> {
        Box::pin(async move {
            if let Some(ref run) = self.inner().run {
                debug!(run_id = run.id, "aborting run");
                run.cancel.cancel();
            }
            Ok(())
        })
    }

    fn reset(&self) -> SessionFuture<'_, ()> {
        Box::pin(async move {
            let session_id = Uuid::new_v4().to_string();
            let session_file = match self.store {
                Some(ref store) => Some(store.create(&session_id).await?),
                None => None,
            };

            {
                let mut inner = self.inner();
                if let Some(run) = inner.run.take() {
                    run.cancel.cancel();
                }
                let mut fresh = Inner::fresh(session_id.clone(), session_file, inner.model.clone());
                fresh.thinking_level = inner.thinking_level;
                fresh.queue_mode = inner.queue_mode;
                fresh.next_run_id = inner.next_run_id;
                *inner = fresh;
            }

            info!(session_id = %session_id, "session reset");
            self.emit(AgentEvent::SessionSwitched { session_id });
            Ok(())
        })
    }

    fn state(&self) -> RpcSessionState {
        let inner = self.inner();
        RpcSessionState {
            model: inner.model.clone(),
            thinking_level: inner.thinking_level,
            is_streaming: inner.run.is_some(),
            queue_mode: inner.queue_mode,
            session_file: inner.file_name(),
            session_id: inner.session_id.clone(),
            active_branch: inner.active_branch.clone(),
            branches: inner.branches.keys().cloned().collect(),
            message_count: inner.active_messages().len(),
            queued_message_count: inner.queued.len(),
        }
    }

    fn messages(&self) -> Vec<AgentMessage> {
        self.inner().active_messages().to_vec()
    }

    fn available_models(&self) -> Vec<ModelInfo> {
        self.models.clone()
    }

    fn change_model(&self, provider: String, model_id: String) -> SessionFuture<'_, ModelInfo> {
        Box::pin(async move {
            let model = self
                .find_model(&provider, &model_id)
                .cloned()
                .ok_or_else(|| {
                    AppError::NotFound(format!("Model not found: {provider}/{model_id}"))
                })?;

            let mut inner = self.inner();
            if !model.reasoning {
                inner.thinking_level = ThinkingLevel::Off;
            }
            inner.model = Some(model.clone());
            info!(model = %model.reference(), "model changed");
            Ok(model)
        })
    }

    fn update_thinking_level(&self, level: ThinkingLevel) -> Result<ThinkingLevel> {
        let mut inner = self.inner();
        let reasoning = inner
            .model
            .as_ref()
            .map(|m| m.reasoning)
            .ok_or_else(|| AppError::Agent("No model selected".into()))?;
        inner.thinking_level = if reasoning { level } else { ThinkingLevel::Off };
        Ok(inner.thinking_level)
    }

    fn set_queue_mode(&self, mode: QueueMode) {
        self.inner().queue_mode = mode;
    }

    fn compact_history(&self, keep_recent: Option<usize>) -> SessionFuture<'_, CompactionResult> {
        Box::pin(async move {
            let keep_recent = keep_recent.unwrap_or(self.keep_recent);

            let (result, branch, file) = {
                let mut inner = self.inner();
                inner.ensure_idle("compact")?;

                let branch = inner.active_branch.clone();
                let messages = inner.active_messages_mut();
                if messages.len() <= keep_recent {
                    return Err(AppError::Agent("Nothing to compact".into()));
                }

                let tokens_before: u64 = messages.iter().map(AgentMessage::estimated_tokens).sum();
                let older = &messages[..messages.len() - keep_recent];
                let summary = summarize(older);
                let removed =
                    apply_compaction(messages, keep_recent, AgentMessage::summary(summary.clone()));
                let tokens_after: u64 = messages.iter().map(AgentMessage::estimated_tokens).sum();

                let result = CompactionResult {
                    summary,
                    removed_messages: removed,
                    kept_messages: keep_recent,
                    tokens_before,
                    tokens_after,
                };
                (result, branch, inner.session_file.clone())
            };

            info!(
                branch = %branch,
                removed = result.removed_messages,
                "history compacted"
            );
            self.emit(AgentEvent::Compaction {
                branch: branch.clone(),
                removed_messages: result.removed_messages,
            });
            self.persist(
                file,
                vec![SessionEntry::Compaction {
                    branch,
                    keep_recent,
                    summary: result.summary.clone(),
                }],
            )
            .await;
            Ok(result)
        })
    }

    fn session_stats(&self) -> SessionStats {
        let inner = self.inner();
        let messages = inner.active_messages();
        let count = |role: Role| messages.iter().filter(|m| m.role == role).count();
        SessionStats {
            session_id: inner.session_id.clone(),
            session_file: inner.file_name(),
            user_messages: count(Role::User),
            assistant_messages: count(Role::Assistant),
            total_messages: messages.len(),
            branches: inner.branches.len(),
            checkpoints: inner.checkpoints.len(),
            estimated_tokens: messages.iter().map(AgentMessage::estimated_tokens).sum(),
        }
    }

    fn export_to_html(&self, path: Option<PathBuf>) -> SessionFuture<'_, PathBuf> {
        Box::pin(async move {
            let (session_id, branch, messages) = {
                let inner = self.inner();
                (
                    inner.session_id.clone(),
                    inner.active_branch.clone(),
                    inner.active_messages().to_vec(),
                )
            };

            let path = match path {
                Some(path) => path,
                None => Self::default_export_path(&session_id)?,
            };
            let html = render_html(&session_id, &branch, &messages);
            tokio::fs::write(&path, html).await.map_err(|err| {
                AppError::Io(format!("failed to write {}: {err}", path.display()))
            })?;

            info!(path = %path.display(), "session exported");
            Ok(path)
        })
    }

    fn switch_session(&self, path: PathBuf) -> SessionFuture<'_, ()> {
        Box::pin(async move {
            self.inner().ensure_idle("switch sessions")?;
            let replayed = store::load(&path).await?;

            let session_id = replayed.id.clone();
            {
                let mut inner = self.inner();
                inner.ensure_idle("switch sessions")?;
                let mut fresh = Inner::fresh(replayed.id, Some(path), inner.model.clone());
                fresh.thinking_level = inner.thinking_level;
                fresh.queue_mode = inner.queue_mode;
                fresh.next_run_id = inner.next_run_id;
                fresh.branches = replayed.branches;
                fresh.checkpoints = replayed.checkpoints;
                *inner = fresh;
            }

            info!(session_id = %session_id, "session switched");
            self.emit(AgentEvent::SessionSwitched { session_id });
            Ok(())
        })
    }

    fn list_sessions(&self) -> SessionFuture<'_, Vec<SessionSummary>> {
        Box::pin(async move {
            match self.store {
                Some(ref store) => store.list().await,
                None => Ok(Vec::new()),
            }
        })
    }

    fn create_branch(
        &self,
        name: String,
        from_index: Option<usize>,
    ) -> SessionFuture<'_, BranchInfo> {
        Box::pin(async move {
            let (info, entry, file) = self.do_create_branch(&name, from_index)?;
            info!(branch = %info.name, from_index = info.message_count, "branch created");
            self.persist(file, vec![entry]).await;
            Ok(info)
        })
    }

    fn switch_branch(&self, name: String) -> SessionFuture<'_, ()> {
        Box::pin(async move { self.do_switch_branch(&name).map(|_| ()) })
    }

    fn branch_and_switch(
        &self,
        name: String,
        from_index: Option<usize>,
    ) -> SessionFuture<'_, BranchInfo> {
        Box::pin(async move {
            self.inner().ensure_idle("switch branches")?;
            let (_, entry, file) = self.do_create_branch(&name, from_index)?;
            self.persist(file, vec![entry]).await;
            self.do_switch_branch(&name)
        })
    }

    fn list_branches(&self) -> Vec<BranchInfo> {
        let inner = self.inner();
        inner
            .branches
            .keys()
            .filter_map(|name| inner.branch_info(name))
            .collect()
    }

    fn smart_merge_branch(
        &self,
        source: String,
        target: Option<String>,
    ) -> SessionFuture<'_, MergeResult> {
        Box::pin(async move {
            let (result, entries, file) = {
                let mut inner = self.inner();
                inner.ensure_idle("merge branches")?;

                let target = target.unwrap_or_else(|| inner.active_branch.clone());
                if source == target {
                    return Err(AppError::Agent("Cannot merge a branch into itself".into()));
                }
                let source_messages = inner
                    .branches
                    .get(&source)
                    .cloned()
                    .ok_or_else(|| AppError::NotFound(format!("Branch not found: {source}")))?;
                let target_messages = inner
                    .branches
                    .get_mut(&target)
                    .ok_or_else(|| AppError::NotFound(format!("Branch not found: {target}")))?;

                let shared = source_messages
                    .iter()
                    .zip(target_messages.iter())
                    .take_while(|(a, b)| a == b)
                    .count();
                let tail = &source_messages[shared..];
                target_messages.extend_from_slice(tail);

                let entries = tail
                    .iter()
                    .map(|message| SessionEntry::Message {
                        branch: target.clone(),
                        message: message.clone(),
                    })
                    .collect::<Vec<_>>();
                let result = MergeResult {
                    source,
                    target,
                    merged_messages: tail.len(),
                };
                (result, entries, inner.session_file.clone())
            };

            info!(
                source = %result.source,
                target = %result.target,
                merged = result.merged_messages,
                "branches merged"
            );
            self.persist(file, entries).await;
            Ok(result)
        })
    }

    fn create_checkpoint(
        &self,
        name: String,
        metadata: Option<Value>,
    ) -> SessionFuture<'_, Checkpoint> {
        Box::pin(async move {
            if name.trim().is_empty() {
                return Err(AppError::Agent("Checkpoint name must not be empty".into()));
            }

            let (checkpoint, file) = {
                let mut inner = self.inner();
                let checkpoint = Checkpoint {
                    id: Uuid::new_v4().to_string(),
                    name,
                    branch: inner.active_branch.clone(),
                    message_index: inner.active_messages().len(),
                    created_at: Utc::now(),
                    metadata,
                };
                inner.checkpoints.push(checkpoint.clone());
                (checkpoint, inner.session_file.clone())
            };

            self.persist(
                file,
                vec![SessionEntry::Checkpoint {
                    checkpoint: checkpoint.clone(),
                }],
            )
            .await;
            Ok(checkpoint)
        })
    }

    fn list_checkpoints(&self) -> Vec<Checkpoint> {
        self.inner().checkpoints.clone()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<AgentEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }
}

// ── Rendering ────────────────────────────────────────────────

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Summary => "summary",
    }
}

fn summarize(messages: &[AgentMessage]) -> String {
    let mut summary = format!("Summary of {} earlier messages:", messages.len());
    for message in messages {
        let mut snippet: String = message.content.chars().take(SUMMARY_SNIPPET_CHARS).collect();
        if message.content.chars().count() > SUMMARY_SNIPPET_CHARS {
            snippet.push_str("...");
        }
        summary.push_str(&format!("\n- {}: {snippet}", role_label(message.role)));
    }
    summary
}

/// Escape text for inclusion in HTML element content or attributes.
#[must_use]
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn render_html(session_id: &str, branch: &str, messages: &[AgentMessage]) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n",
    );
    html.push_str(&format!(
        "<title>Session {}</title>\n",
        escape_html(session_id)
    ));
    html.push_str(
        "<style>\
         body{font-family:sans-serif;max-width:48rem;margin:2rem auto;}\
         .message{border-left:4px solid #ccc;margin:1rem 0;padding:0.5rem 1rem;}\
         .user{border-color:#3b82f6;}.assistant{border-color:#10b981;}.summary{border-color:#f59e0b;}\
         .role{font-weight:bold;text-transform:uppercase;font-size:0.75rem;}\
         pre{white-space:pre-wrap;}.error{color:#b91c1c;}\
         </style>\n</head>\n<body>\n",
    );
    html.push_str(&format!(
        "<h1>Session {}</h1>\n<p>Branch <code>{}</code>, exported {}</p>\n",
        escape_html(session_id),
        escape_html(branch),
        Utc::now().to_rfc3339()
    ));

    for message in messages {
        let role = role_label(message.role);
        html.push_str(&format!(
            "<div class=\"message {role}\">\n<div class=\"role\">{role}</div>\n<pre>{}</pre>\n",
            escape_html(&message.content)
        ));
        for attachment in &message.attachments {
            html.push_str(&format!(
                "<div class=\"attachment\">{}</div>\n",
                escape_html(&attachment.file_name)
            ));
        }
        if let Some(ref error) = message.error_message {
            html.push_str(&format!(
                "<div class=\"error\">{}</div>\n",
                escape_html(error)
            ));
        }
        html.push_str("</div>\n");
    }

    html.push_str("</body>\n</html>\n");
    html
}
