//! RPC client: spawns a headless server and drives it over stdio.
//!
//! Requests get a fresh `req_<n>` id and are written to the child's stdin.
//! A reader task (see [`crate::rpc::reader`]) routes each response line to
//! the request awaiting its id and fans every other line out to event
//! listeners. Each request has its own timeout; a timed-out request is
//! removed from the pending table so a late reply is delivered to the
//! listeners instead.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::rpc::reader::{run_reader, RpcEvent};
use crate::rpc::spawner::{self, SpawnConfig, StderrBuffer};
use crate::rpc::types::{
    BranchesData, CheckpointsData, Command, ExportData, MessagesData, ModelsData, RpcRequest,
    RpcResponse, RpcSessionState, SessionsData, ThinkingLevelData,
};
use crate::rpc::writer::encode_line;
use crate::session::{
    AgentMessage, Attachment, BranchInfo, Checkpoint, CompactionResult, MergeResult, ModelInfo,
    QueueMode, SessionStats, SessionSummary, ThinkingLevel,
};
use crate::{AppError, Result};

// ── Shared state ─────────────────────────────────────────────

/// A request written to the child and not yet answered.
#[derive(Debug)]
struct PendingRequest {
    command: &'static str,
    tx: oneshot::Sender<RpcResponse>,
}

/// State shared between the client handle and its reader task.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pending: Mutex<HashMap<String, PendingRequest>>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<RpcEvent>>>,
    stderr: StderrBuffer,
}

impl Shared {
    /// Complete the request waiting on `response.id`.
    ///
    /// Returns `false` when no request with that id is pending.
    pub(crate) async fn resolve(&self, response: RpcResponse) -> bool {
        let Some(id) = response.id.as_deref() else {
            return false;
        };
        let Some(pending) = self.pending.lock().await.remove(id) else {
            debug!(id, "rpc client: response for unknown id");
            return false;
        };
        if pending.tx.send(response).is_err() {
            debug!(command = pending.command, "rpc client: requester went away");
        }
        true
    }

    /// Deliver `event` to every live listener, pruning closed ones.
    pub(crate) async fn broadcast(&self, event: RpcEvent) {
        let mut listeners = self.listeners.lock().await;
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Fail every pending request with `message`.
    pub(crate) async fn fail_all_pending(&self, message: &str) {
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        for (id, pending) in drained {
            let response = RpcResponse::error(Some(id), pending.command, message);
            let _ = pending.tx.send(response);
        }
    }

    async fn subscribe(&self) -> mpsc::UnboundedReceiver<RpcEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().await.push(tx);
        rx
    }
}

// ── Client ───────────────────────────────────────────────────

/// What `drain_run` does with the events it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drain {
    /// Only wait for `agent_end`.
    Discard,
    /// Collect every event through `agent_end`.
    Keep,
    /// Collect, and end early on an id-less `prompt` failure, which can
    /// only mean the prompt this call just sent was refused.
    OwnPrompt,
}

/// Handles of a running child.
#[derive(Debug)]
struct Connection {
    child: Child,
    reader: JoinHandle<()>,
    stderr_collector: JoinHandle<()>,
}

/// Client for one headless child process.
///
/// All request methods take `&self`, so independent requests may be
/// awaited concurrently; each resolves with its own response.
#[derive(Debug)]
pub struct RpcClient {
    config: ClientConfig,
    shared: Arc<Shared>,
    stdin: Mutex<Option<ChildStdin>>,
    connection: Mutex<Option<Connection>>,
    reader_cancel: CancellationToken,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Create a client; nothing is spawned until [`start`](Self::start).
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
            stdin: Mutex::new(None),
            connection: Mutex::new(None),
            reader_cancel: CancellationToken::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Spawn the child and start routing its output.
    ///
    /// Waits the configured startup grace period and fails if the child
    /// has already exited by then.
    ///
    /// # Errors
    ///
    /// - `AppError::Process("client already started")` on a second call.
    /// - `AppError::Process("client was stopped")` after [`stop`](Self::stop).
    /// - `AppError::Process(…)` if the spawn fails or the child exits
    ///   during the grace period; the message includes its stderr.
    pub async fn start(&self) -> Result<()> {
        let mut connection = self.connection.lock().await;
        if connection.is_some() {
            return Err(AppError::Process("client already started".into()));
        }
        if self.reader_cancel.is_cancelled() {
            return Err(AppError::Process("client was stopped".into()));
        }

        let process = spawner::spawn_child(&SpawnConfig::from(&self.config))?;
        let mut child = process.child;

        let mut stderr_collector =
            spawner::capture_stderr(process.stderr, self.shared.stderr.clone());
        let reader = tokio::spawn(run_reader(
            process.stdout,
            Arc::clone(&self.shared),
            self.reader_cancel.clone(),
            self.config.fail_pending_on_exit,
        ));

        if let Err(err) = spawner::check_started(
            &mut child,
            self.config.startup_grace(),
            &self.shared.stderr,
            &mut stderr_collector,
        )
        .await
        {
            self.reader_cancel.cancel();
            reader.abort();
            return Err(err);
        }

        *self.stdin.lock().await = Some(process.stdin);
        *connection = Some(Connection {
            child,
            reader,
            stderr_collector,
        });

        info!(program = %self.config.program, "rpc client started");
        Ok(())
    }

    /// Stop the child and release every resource.
    ///
    /// Closes stdin, stops the reader, sends SIGTERM, and escalates to
    /// SIGKILL after the shutdown grace period. Requests still awaiting a
    /// response fail with `AppError::Process`; event listeners see their
    /// stream end. Calling `stop` on a stopped client is a no-op.
    pub async fn stop(&self) {
        drop(self.stdin.lock().await.take());
        self.reader_cancel.cancel();

        let connection = self.connection.lock().await.take();
        if let Some(mut connection) = connection {
            spawner::terminate(&mut connection.child, self.config.shutdown_grace()).await;
            if let Err(err) = connection.reader.await {
                warn!(%err, "rpc client: reader task failed");
            }
            connection.stderr_collector.abort();
        }

        self.shared.pending.lock().await.clear();
        self.shared.listeners.lock().await.clear();
        info!("rpc client stopped");
    }

    /// Register an event listener.
    ///
    /// The receiver sees every non-response line (and every response no
    /// request was waiting for) from the moment of subscription until the
    /// client stops or the receiver is dropped.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<RpcEvent> {
        self.shared.subscribe().await
    }

    /// Stderr text the child has written so far.
    pub async fn stderr(&self) -> String {
        self.shared.stderr.snapshot().await
    }

    /// Send `command` and wait for its response, whatever its `success`.
    ///
    /// The request timeout covers both writing the line and waiting for
    /// the reply, so a child that stops reading stdin cannot stall callers
    /// past their deadline.
    ///
    /// # Errors
    ///
    /// - `AppError::Process("client not started")` before [`start`](Self::start).
    /// - `AppError::Process(…)` if stdin cannot be written, or the client
    ///   is stopped while the request is in flight.
    /// - `AppError::Timeout("Timeout waiting for response to <type>. Stderr: …")`
    ///   if no response arrives within the request timeout.
    pub async fn send(&self, command: Command) -> Result<RpcResponse> {
        let name = command.name();
        let id = format!("req_{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let line = encode_line(&serde_json::to_value(RpcRequest::new(id.clone(), command))?)?;

        let mut written = false;
        let exchange = async {
            let rx = self.write_request(&id, name, &line).await?;
            written = true;
            debug!(id = %id, command = name, "rpc client: request sent");
            rx.await.map_err(|_| {
                AppError::Process(format!("request {id} ({name}) abandoned: client stopped"))
            })
        };

        let outcome = tokio::time::timeout(self.config.request_timeout(), exchange).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                if !written {
                    // A partial line may be in the pipe; nothing written
                    // after it could be framed correctly.
                    warn!(id = %id, command = name, "rpc client: write stalled, closing agent stdin");
                    drop(self.stdin.lock().await.take());
                }
                Err(AppError::Timeout(format!(
                    "Timeout waiting for response to {name}. Stderr: {}",
                    self.stderr().await
                )))
            }
        }
    }

    /// Register a pending entry for `id` and write `line` to the child.
    async fn write_request(
        &self,
        id: &str,
        name: &'static str,
        line: &[u8],
    ) -> Result<oneshot::Receiver<RpcResponse>> {
        let mut stdin = self.stdin.lock().await;
        let Some(stdin) = stdin.as_mut() else {
            return Err(AppError::Process("client not started".into()));
        };

        let (tx, rx) = oneshot::channel();
        // Registered before the write so a fast reply always finds it.
        self.shared
            .pending
            .lock()
            .await
            .insert(id.to_owned(), PendingRequest { command: name, tx });

        let written = match stdin.write_all(line).await {
            Ok(()) => stdin.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            self.shared.pending.lock().await.remove(id);
            return Err(AppError::Process(format!(
                "failed to write {name} request: {err}"
            )));
        }
        Ok(rx)
    }

    /// Send `command` and return the `data` of a successful response.
    ///
    /// # Errors
    ///
    /// Everything [`send`](Self::send) returns, plus `AppError::Rpc`
    /// carrying the server's message when the response has `success: false`.
    pub async fn request(&self, command: Command) -> Result<Option<Value>> {
        let response = self.send(command).await?;
        if response.success {
            Ok(response.data)
        } else {
            Err(AppError::Rpc(response.error.unwrap_or_else(|| {
                format!("{} failed without a message", response.command)
            })))
        }
    }

    async fn request_unit(&self, command: Command) -> Result<()> {
        self.request(command).await.map(|_| ())
    }

    async fn request_data<T: DeserializeOwned>(&self, command: Command) -> Result<T> {
        let name = command.name();
        let data = self
            .request(command)
            .await?
            .ok_or_else(|| AppError::Protocol(format!("{name} response carried no data")))?;
        serde_json::from_value(data)
            .map_err(|e| AppError::Protocol(format!("invalid {name} response data: {e}")))
    }

    // ── Typed commands ───────────────────────────────────────

    /// Start a run. Resolves on acknowledgement, not on completion.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn prompt(
        &self,
        message: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<()> {
        self.request_unit(Command::Prompt {
            message: message.into(),
            attachments,
        })
        .await
    }

    /// Queue a message for after the current turn.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn queue_message(&self, message: impl Into<String>) -> Result<()> {
        self.request_unit(Command::QueueMessage {
            message: message.into(),
        })
        .await
    }

    /// Cancel the in-flight run.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn abort(&self) -> Result<()> {
        self.request_unit(Command::Abort).await
    }

    /// Clear the conversation.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn reset(&self) -> Result<()> {
        self.request_unit(Command::Reset).await
    }

    /// Snapshot of the session.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn get_state(&self) -> Result<RpcSessionState> {
        self.request_data(Command::GetState).await
    }

    /// Messages on the active branch.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn get_messages(&self) -> Result<Vec<AgentMessage>> {
        let data: MessagesData = self.request_data(Command::GetMessages).await?;
        Ok(data.messages)
    }

    /// Models the server can switch to.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn get_available_models(&self) -> Result<Vec<ModelInfo>> {
        let data: ModelsData = self.request_data(Command::GetAvailableModels).await?;
        Ok(data.models)
    }

    /// Select a model; returns the server's description of it.
    ///
    /// # Errors
    ///
    /// `AppError::Rpc("Model not found: …")` for an unknown model; see
    /// [`request`](Self::request).
    pub async fn set_model(
        &self,
        provider: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Result<ModelInfo> {
        self.request_data(Command::SetModel {
            provider: provider.into(),
            model_id: model_id.into(),
        })
        .await
    }

    /// Change the thinking level; returns the level actually applied.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn set_thinking_level(&self, level: ThinkingLevel) -> Result<ThinkingLevel> {
        let data: ThinkingLevelData = self
            .request_data(Command::SetThinkingLevel { level })
            .await?;
        Ok(data.level)
    }

    /// Change the queued-message delivery mode.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn set_queue_mode(&self, mode: QueueMode) -> Result<()> {
        self.request_unit(Command::SetQueueMode { mode }).await
    }

    /// Summarise older history.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn compact(&self, keep_recent: Option<usize>) -> Result<CompactionResult> {
        self.request_data(Command::Compact { keep_recent }).await
    }

    /// Message and token counters.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn get_session_stats(&self) -> Result<SessionStats> {
        self.request_data(Command::GetSessionStats).await
    }

    /// Write the conversation as HTML; returns the written path.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn export_html(&self, output_path: Option<String>) -> Result<PathBuf> {
        let data: ExportData = self
            .request_data(Command::ExportHtml { output_path })
            .await?;
        Ok(PathBuf::from(data.path))
    }

    /// Load another persisted session.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn switch_session(&self, session_path: impl Into<String>) -> Result<()> {
        self.request_unit(Command::SwitchSession {
            session_path: session_path.into(),
        })
        .await
    }

    /// Persisted sessions, newest first.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let data: SessionsData = self.request_data(Command::ListSessions).await?;
        Ok(data.sessions)
    }

    /// Fork a branch without switching to it.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn create_branch(
        &self,
        name: impl Into<String>,
        from_index: Option<usize>,
    ) -> Result<BranchInfo> {
        self.request_data(Command::CreateBranch {
            name: name.into(),
            from_index,
        })
        .await
    }

    /// Make another branch active.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn switch_branch(&self, name: impl Into<String>) -> Result<()> {
        self.request_unit(Command::SwitchBranch { name: name.into() })
            .await
    }

    /// Fork a branch and switch to it.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn branch(
        &self,
        name: impl Into<String>,
        from_index: Option<usize>,
    ) -> Result<BranchInfo> {
        self.request_data(Command::Branch {
            name: name.into(),
            from_index,
        })
        .await
    }

    /// Every branch of the session.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn list_branches(&self) -> Result<Vec<BranchInfo>> {
        let data: BranchesData = self.request_data(Command::ListBranches).await?;
        Ok(data.branches)
    }

    /// Merge `source` into `target` (the active branch when `None`).
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn merge_branch(
        &self,
        source: impl Into<String>,
        target: Option<String>,
    ) -> Result<MergeResult> {
        self.request_data(Command::MergeBranch {
            source: source.into(),
            target,
        })
        .await
    }

    /// Record a named checkpoint.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn create_checkpoint(
        &self,
        name: impl Into<String>,
        metadata: Option<Value>,
    ) -> Result<Checkpoint> {
        self.request_data(Command::CreateCheckpoint {
            name: name.into(),
            metadata,
        })
        .await
    }

    /// Every checkpoint, oldest first.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let data: CheckpointsData = self.request_data(Command::ListCheckpoints).await?;
        Ok(data.checkpoints)
    }

    // ── Run helpers ──────────────────────────────────────────

    /// Wait for the next `agent_end`.
    ///
    /// Only events raised after this call are observed; to wait on a run
    /// you start yourself, prefer [`prompt_and_wait`](Self::prompt_and_wait).
    ///
    /// # Errors
    ///
    /// `AppError::Timeout` if `agent_end` does not arrive within `timeout`
    /// (the configured idle timeout when `None`); `AppError::Process` if
    /// the client stops first.
    pub async fn wait_for_idle(&self, timeout: Option<Duration>) -> Result<()> {
        let events = self.subscribe().await;
        self.drain_run(events, timeout, Drain::Discard).await.map(|_| ())
    }

    /// Collect every event up to and including the next `agent_end`.
    ///
    /// Id-less failed responses (such as a refused second prompt) are
    /// collected like any other event; they do not end the wait.
    ///
    /// # Errors
    ///
    /// As [`wait_for_idle`](Self::wait_for_idle).
    pub async fn collect_events(&self, timeout: Option<Duration>) -> Result<Vec<RpcEvent>> {
        let events = self.subscribe().await;
        self.drain_run(events, timeout, Drain::Keep).await
    }

    /// Send a prompt and collect its events through `agent_end`.
    ///
    /// Subscribes before sending, so no event of the run is missed. A
    /// failed start reported after the acknowledgement ends the wait with
    /// `AppError::Agent`.
    ///
    /// # Errors
    ///
    /// As [`prompt`](Self::prompt) and [`wait_for_idle`](Self::wait_for_idle).
    pub async fn prompt_and_wait(
        &self,
        message: impl Into<String>,
        attachments: Vec<Attachment>,
        timeout: Option<Duration>,
    ) -> Result<Vec<RpcEvent>> {
        let events = self.subscribe().await;
        self.prompt(message, attachments).await?;
        self.drain_run(events, timeout, Drain::OwnPrompt).await
    }

    async fn drain_run(
        &self,
        mut events: mpsc::UnboundedReceiver<RpcEvent>,
        timeout: Option<Duration>,
        mode: Drain,
    ) -> Result<Vec<RpcEvent>> {
        let timeout = timeout.unwrap_or_else(|| self.config.idle_timeout());
        let mut collected = Vec::new();

        let outcome = tokio::time::timeout(timeout, async {
            while let Some(event) = events.recv().await {
                if mode == Drain::OwnPrompt && event.is_failure_of("prompt") {
                    let message = event
                        .0
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("prompt failed")
                        .to_owned();
                    return Err(AppError::Agent(message));
                }
                let done = event.is_agent_end();
                if mode != Drain::Discard {
                    collected.push(event);
                }
                if done {
                    return Ok(());
                }
            }
            Err(AppError::Process("event stream closed: client stopped".into()))
        })
        .await;

        match outcome {
            Ok(Ok(())) => Ok(collected),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(AppError::Timeout(format!(
                "Timeout waiting for agent to become idle. Stderr: {}",
                self.stderr().await
            ))),
        }
    }
}
