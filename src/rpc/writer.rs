//! Outbound line writer task.
//!
//! Receives JSON values from a tokio [`mpsc`] channel, serialises each one
//! to a single line, and writes it to the given stream followed by `\n`.
//! Every outbound line of a process goes through one writer, so lines
//! from concurrent producers (responses, forwarded events, late prompt
//! failures) never interleave byte-wise and keep their enqueue order.

use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Serialise `value` as one newline-terminated JSON line.
///
/// # Errors
///
/// Returns [`AppError::Protocol`] if serialisation fails.
pub fn encode_line(value: &Value) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(value)
        .map_err(|e| AppError::Protocol(format!("failed to serialise outbound message: {e}")))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Writer task: drains `msg_rx` into `sink` until the channel closes.
///
/// Each line is flushed immediately so the peer observes it without
/// waiting for buffer pressure.
///
/// The task exits cleanly when:
/// - `msg_rx` is closed and drained (all senders dropped), or
/// - `cancel` is triggered; already-queued messages are still flushed.
///
/// # Errors
///
/// Returns [`AppError::Io`]`("write failed: …")` if the stream rejects a
/// write (e.g. the peer closed its end).
pub async fn run_writer<W>(
    label: &'static str,
    sink: W,
    mut msg_rx: mpsc::Receiver<Value>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut sink = sink;
    let mut draining = false;

    loop {
        let msg = if draining {
            msg_rx.recv().await
        } else {
            tokio::select! {
                biased;

                msg = msg_rx.recv() => msg,

                () = cancel.cancelled() => {
                    debug!(label, "writer: cancellation received, draining");
                    draining = true;
                    msg_rx.close();
                    continue;
                }
            }
        };

        let Some(value) = msg else {
            debug!(label, "writer: message channel closed, stopping");
            break;
        };

        let bytes = match encode_line(&value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(label, error = %e, "writer: dropping unserialisable message");
                continue;
            }
        };

        sink.write_all(&bytes).await.map_err(|e| {
            warn!(label, error = %e, "writer: write failed");
            AppError::Io(format!("write failed: {e}"))
        })?;
        sink.flush()
            .await
            .map_err(|e| AppError::Io(format!("flush failed: {e}")))?;
    }

    Ok(())
}
