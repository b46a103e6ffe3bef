//! Client-side reader task.
//!
//! Reads newline-delimited JSON from the child's stdout and splits the
//! stream into its two logical channels:
//!
//! | Line shape                                   | Routed to                       |
//! |----------------------------------------------|---------------------------------|
//! | `type: "response"` with an id that is pending | that request's responder       |
//! | any other JSON value                         | every event listener            |
//! | not JSON                                     | discarded; logged at `DEBUG`    |
//!
//! Responses whose id is not pending (late replies after a timeout, or the
//! id-less failure of a fire-and-forget prompt) fall through to the
//! listeners like events.

use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::rpc::client::Shared;
use crate::rpc::codec::{Frame, RpcCodec};
use crate::rpc::types::{RpcResponse, RESPONSE_TYPE};

/// An unsolicited value from the server, kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RpcEvent(pub Value);

impl RpcEvent {
    /// The event's `type` tag, if it has one.
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    /// Whether this is the `agent_end` event that closes a run.
    #[must_use]
    pub fn is_agent_end(&self) -> bool {
        self.kind() == Some("agent_end")
    }

    /// Whether this is an id-less failed response for `command`, the shape
    /// used to report a fire-and-forget command that failed after its
    /// acknowledgement.
    #[must_use]
    pub fn is_failure_of(&self, command: &str) -> bool {
        self.kind() == Some(RESPONSE_TYPE)
            && self.0.get("command").and_then(Value::as_str) == Some(command)
            && self.0.get("success").and_then(Value::as_bool) == Some(false)
    }
}

/// Classification of one line of server output.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerLine {
    /// A response envelope carrying a correlation id.
    Response {
        /// The decoded response.
        response: RpcResponse,
        /// The line as parsed, forwarded verbatim if nobody is waiting.
        raw: Value,
    },
    /// Anything else that parsed as JSON.
    Event(RpcEvent),
}

/// Classify one line of server output.
///
/// Returns `None` for blank lines and lines that are not JSON. A line is a
/// [`ServerLine::Response`] only when its `type` is `"response"`, it has an
/// `id`, and it matches the response shape; every other JSON value is an
/// event.
#[must_use]
pub fn classify_line(line: &str) -> Option<ServerLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "rpc reader: discarding non-JSON line");
            return None;
        }
    };

    let is_correlated_response = value.get("type").and_then(Value::as_str) == Some(RESPONSE_TYPE)
        && value.get("id").and_then(Value::as_str).is_some();

    if is_correlated_response {
        if let Ok(response) = serde_json::from_value::<RpcResponse>(value.clone()) {
            return Some(ServerLine::Response {
                response,
                raw: value,
            });
        }
    }

    Some(ServerLine::Event(RpcEvent(value)))
}

/// Reader task: drives `stdout` until EOF or cancellation, routing every
/// line through `shared`.
///
/// On EOF the pending table is left alone unless `fail_pending_on_exit`
/// is set, in which case every outstanding request is failed at once.
pub(crate) async fn run_reader<R>(
    stdout: R,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    fail_pending_on_exit: bool,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, RpcCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("rpc reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!("rpc reader: EOF detected");
                        if fail_pending_on_exit {
                            shared.fail_all_pending("agent process exited before responding").await;
                        }
                        break;
                    }

                    Some(Err(e)) => {
                        warn!(error = %e, "rpc reader: IO error, stopping");
                        if fail_pending_on_exit {
                            shared.fail_all_pending(&format!("agent stream error: {e}")).await;
                        }
                        break;
                    }

                    Some(Ok(Frame::Oversized)) => {
                        warn!("rpc reader: oversized line discarded");
                    }

                    Some(Ok(Frame::Line(line))) => {
                        match classify_line(&line) {
                            Some(ServerLine::Response { response, raw }) => {
                                if !shared.resolve(response).await {
                                    shared.broadcast(RpcEvent(raw)).await;
                                }
                            }
                            Some(ServerLine::Event(event)) => shared.broadcast(event).await,
                            None => {}
                        }
                    }
                }
            }
        }
    }
}
