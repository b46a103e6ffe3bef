//! Headless RPC server: the command dispatcher.
//!
//! Reads one JSON command per line from `input`, executes it against the
//! owned [`AgentSession`], and writes exactly one response line per
//! command to `output`. Every event the session raises is forwarded to
//! the same `output` for the lifetime of the server, independently of
//! command processing.
//!
//! ## Contracts
//!
//! - `prompt` is acknowledged as soon as it is accepted. The
//!   acknowledgement is queued *before* the run starts, so it always
//!   precedes the run's `agent_end`. If the run fails to start, an id-less
//!   failed `prompt` response follows later.
//! - Every other command is awaited before its response is written, in
//!   submission order.
//! - Handler errors become failed responses; malformed lines become
//!   `command: "parse"` responses. Nothing a peer sends can stop the loop.
//! - The server returns when `input` reaches EOF or `cancel` fires.

use std::path::PathBuf;
use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::rpc::codec::{Frame, RpcCodec};
use crate::rpc::types::{
    BranchesData, CheckpointsData, Command, ExportData, MessagesData, ModelsData, RpcRequest,
    RpcResponse, SessionsData, ThinkingLevelData, PARSE_COMMAND,
};
use crate::rpc::writer::run_writer;
use crate::session::{AgentEvent, AgentSession, Attachment};
use crate::{AppError, Result};

/// Capacity of the outbound line queue shared by responses and events.
const OUTBOUND_CAPACITY: usize = 256;

/// Outcome of decoding one inbound line.
#[derive(Debug)]
pub enum Inbound {
    /// A well-formed request.
    Request(RpcRequest),
    /// Nothing to do (blank line).
    Skip,
    /// The line was rejected; send this response.
    Rejected(RpcResponse),
}

/// Decode one inbound line into a request or a rejection response.
///
/// - Blank lines are skipped.
/// - Invalid JSON, or JSON without a string `type`, is rejected as
///   `command: "parse"` with no id.
/// - An unknown `type` is rejected with `command` set to that type and no id.
/// - A known `type` with an invalid payload is rejected for that command,
///   echoing the id when it can be read.
#[must_use]
pub fn decode_line(line: &str) -> Inbound {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Inbound::Skip;
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(e) => {
            return Inbound::Rejected(RpcResponse::error(
                None,
                PARSE_COMMAND,
                format!("Failed to parse command: {e}"),
            ));
        }
    };

    let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_owned) else {
        return Inbound::Rejected(RpcResponse::error(
            None,
            PARSE_COMMAND,
            "Failed to parse command: missing string field `type`",
        ));
    };

    if !Command::is_known(&kind) {
        return Inbound::Rejected(RpcResponse::error(
            None,
            kind.clone(),
            format!("Unknown command: {kind}"),
        ));
    }

    let id = value.get("id").and_then(Value::as_str).map(str::to_owned);
    match serde_json::from_value::<RpcRequest>(value) {
        Ok(request) => Inbound::Request(request),
        Err(e) => Inbound::Rejected(RpcResponse::error(
            id,
            kind.clone(),
            format!("Invalid {kind} command: {e}"),
        )),
    }
}

/// Run the dispatcher until `input` closes or `cancel` fires.
///
/// Spawns the outbound writer and the event forwarder, then processes
/// inbound lines one at a time. On exit the forwarder is stopped and every
/// queued line is flushed before returning.
///
/// # Errors
///
/// Returns [`AppError::Io`] if `input` fails with an unrecoverable read
/// error or the writer could not deliver queued lines.
pub async fn run_server<S, R, W>(
    session: Arc<S>,
    input: R,
    output: W,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AgentSession,
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::channel::<Value>(OUTBOUND_CAPACITY);
    let writer_cancel = CancellationToken::new();
    let writer = tokio::spawn(run_writer("server", output, out_rx, writer_cancel.clone()));

    let forward_cancel = CancellationToken::new();
    let forwarder = spawn_event_forwarder(
        session.subscribe(),
        out_tx.clone(),
        forward_cancel.clone(),
    );

    info!("rpc server ready");

    let read_result = read_loop(&session, input, &out_tx, &cancel).await;

    forward_cancel.cancel();
    if let Err(err) = forwarder.await {
        warn!(%err, "event forwarder task failed");
    }
    drop(out_tx);
    writer_cancel.cancel();

    let write_result = match writer.await {
        Ok(result) => result,
        Err(err) => Err(AppError::Io(format!("writer task failed: {err}"))),
    };

    info!("rpc server stopped");
    read_result.and(write_result)
}

async fn read_loop<S, R>(
    session: &Arc<S>,
    input: R,
    out_tx: &mpsc::Sender<Value>,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: AgentSession,
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(input, RpcCodec::new());

    loop {
        let frame = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("rpc server: cancellation received, stopping");
                return Ok(());
            }

            frame = framed.next() => frame,
        };

        let queued = match frame {
            None => {
                info!("rpc server: input closed");
                return Ok(());
            }
            Some(Err(e)) => {
                warn!(error = %e, "rpc server: input read failed");
                return Err(e);
            }
            Some(Ok(Frame::Oversized)) => {
                let response = RpcResponse::error(
                    None,
                    PARSE_COMMAND,
                    "Failed to parse command: line too long",
                );
                send_response(out_tx, &response).await
            }
            Some(Ok(Frame::Line(line))) => match decode_line(&line) {
                Inbound::Skip => true,
                Inbound::Rejected(response) => {
                    warn!(
                        command = %response.command,
                        error = response.error.as_deref().unwrap_or_default(),
                        "rpc server: rejected inbound line"
                    );
                    send_response(out_tx, &response).await
                }
                Inbound::Request(request) => handle_request(session, request, out_tx).await,
            },
        };

        if !queued {
            return Ok(());
        }
    }
}

/// Forward every session event to the outbound queue until cancelled.
fn spawn_event_forwarder(
    mut events: mpsc::UnboundedReceiver<AgentEvent>,
    out_tx: mpsc::Sender<Value>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                () = cancel.cancelled() => {
                    // Flush whatever was already raised before stopping.
                    events.close();
                    while let Ok(event) = events.try_recv() {
                        if forward(&out_tx, &event).await.is_err() {
                            return;
                        }
                    }
                    return;
                }
            };

            let Some(event) = event else {
                debug!("rpc server: session event stream ended");
                return;
            };

            if forward(&out_tx, &event).await.is_err() {
                debug!("rpc server: outbound queue closed, stopping event forwarder");
                return;
            }
        }
    })
}

async fn forward<T: Serialize>(out_tx: &mpsc::Sender<Value>, item: &T) -> Result<()> {
    let value = serde_json::to_value(item)?;
    out_tx
        .send(value)
        .await
        .map_err(|_| AppError::Io("outbound queue closed".into()))
}

async fn send_response(out_tx: &mpsc::Sender<Value>, response: &RpcResponse) -> bool {
    match forward(out_tx, response).await {
        Ok(()) => true,
        Err(err) => {
            warn!(%err, command = %response.command, "rpc server: failed to queue response");
            false
        }
    }
}

/// What a handler produced.
enum Outcome {
    /// The command completed; respond with this payload.
    Done(Option<Value>),
    /// A prompt was accepted; acknowledge, then start the run.
    Accepted {
        message: String,
        attachments: Vec<Attachment>,
    },
}

/// Execute one request and queue its response.
///
/// `received → executing → responded`: exactly one response carrying
/// `request.id` is queued. For `prompt` the acknowledgement is queued
/// before the run is spawned, so it precedes every event of that run.
///
/// Returns `false` once the outbound queue is closed.
pub async fn handle_request<S: AgentSession>(
    session: &Arc<S>,
    request: RpcRequest,
    out_tx: &mpsc::Sender<Value>,
) -> bool {
    let RpcRequest { id, command } = request;
    let name = command.name();
    let span = info_span!("rpc_command", command = name, id = id.as_deref().unwrap_or("-"));

    async move {
        debug!("executing");
        match dispatch(session, command).await {
            Ok(Outcome::Done(data)) => {
                send_response(out_tx, &RpcResponse::success(id, name, data)).await
            }
            Ok(Outcome::Accepted {
                message,
                attachments,
            }) => {
                let queued = send_response(out_tx, &RpcResponse::success(id, name, None)).await;
                spawn_prompt(session, message, attachments, out_tx.clone());
                queued
            }
            Err(err) => {
                warn!(%err, "command failed");
                send_response(out_tx, &RpcResponse::error(id, name, err.message())).await
            }
        }
    }
    .instrument(span)
    .await
}

/// Route a command to the session.
async fn dispatch<S: AgentSession>(session: &Arc<S>, command: Command) -> Result<Outcome> {
    let data = match command {
        Command::Prompt {
            message,
            attachments,
        } => {
            return Ok(Outcome::Accepted {
                message,
                attachments,
            });
        }
        Command::QueueMessage { message } => {
            session.queue_message(message).await?;
            None
        }
        Command::Abort => {
            session.abort().await?;
            None
        }
        Command::Reset => {
            session.reset().await?;
            None
        }
        Command::GetState => to_data(&session.state())?,
        Command::GetMessages => to_data(&MessagesData {
            messages: session.messages(),
        })?,
        Command::GetAvailableModels => to_data(&ModelsData {
            models: session.available_models(),
        })?,
        Command::SetModel { provider, model_id } => {
            to_data(&session.change_model(provider, model_id).await?)?
        }
        Command::SetThinkingLevel { level } => {
            let level = session.update_thinking_level(level)?;
            to_data(&ThinkingLevelData { level })?
        }
        Command::SetQueueMode { mode } => {
            session.set_queue_mode(mode);
            None
        }
        Command::Compact { keep_recent } => {
            to_data(&session.compact_history(keep_recent).await?)?
        }
        Command::GetSessionStats => to_data(&session.session_stats())?,
        Command::ExportHtml { output_path } => {
            let path = session
                .export_to_html(output_path.map(PathBuf::from))
                .await?;
            to_data(&ExportData {
                path: path.to_string_lossy().into_owned(),
            })?
        }
        Command::SwitchSession { session_path } => {
            session.switch_session(PathBuf::from(session_path)).await?;
            None
        }
        Command::ListSessions => to_data(&SessionsData {
            sessions: session.list_sessions().await?,
        })?,
        Command::CreateBranch { name, from_index } => {
            to_data(&session.create_branch(name, from_index).await?)?
        }
        Command::SwitchBranch { name } => {
            session.switch_branch(name).await?;
            None
        }
        Command::Branch { name, from_index } => {
            to_data(&session.branch_and_switch(name, from_index).await?)?
        }
        Command::ListBranches => to_data(&BranchesData {
            branches: session.list_branches(),
        })?,
        Command::MergeBranch { source, target } => {
            to_data(&session.smart_merge_branch(source, target).await?)?
        }
        Command::CreateCheckpoint { name, metadata } => {
            to_data(&session.create_checkpoint(name, metadata).await?)?
        }
        Command::ListCheckpoints => to_data(&CheckpointsData {
            checkpoints: session.list_checkpoints(),
        })?,
    };

    Ok(Outcome::Done(data))
}

fn to_data<T: Serialize>(value: &T) -> Result<Option<Value>> {
    Ok(Some(serde_json::to_value(value)?))
}

/// Start a prompt run in the background.
///
/// A failure to start is reported as an id-less `prompt` response, since
/// the acknowledgement already consumed the id.
fn spawn_prompt<S: AgentSession>(
    session: &Arc<S>,
    message: String,
    attachments: Vec<Attachment>,
    out_tx: mpsc::Sender<Value>,
) {
    let session = Arc::clone(session);
    tokio::spawn(
        async move {
            if let Err(err) = session.prompt(message, attachments).await {
                warn!(%err, "prompt failed");
                let response = RpcResponse::error(None, "prompt", err.message());
                send_response(&out_tx, &response).await;
            }
        }
        .instrument(info_span!("rpc_prompt")),
    );
}
