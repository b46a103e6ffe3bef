//! Unit tests for the outbound writer task.

use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agent_relay::rpc::writer::{encode_line, run_writer};

/// `encode_line` produces compact JSON and one newline.
#[test]
fn encode_line_is_newline_terminated() {
    let bytes = encode_line(&json!({"type": "agent_start"})).expect("encode");
    assert_eq!(bytes, b"{\"type\":\"agent_start\"}\n");
}

/// Queued values are written one per line, in order, and the task ends
/// when the channel closes.
#[tokio::test]
async fn writes_each_value_as_one_line() {
    let (sink, source) = tokio::io::duplex(4096);
    let (tx, rx) = mpsc::channel(8);
    let writer = tokio::spawn(run_writer("test", sink, rx, CancellationToken::new()));

    tx.send(json!({"n": 1})).await.expect("send first");
    tx.send(json!({"n": 2})).await.expect("send second");
    drop(tx);

    writer
        .await
        .expect("writer task must not panic")
        .expect("writer must finish cleanly");

    let mut lines = BufReader::new(source).lines();
    assert_eq!(lines.next_line().await.expect("read"), Some("{\"n\":1}".into()));
    assert_eq!(lines.next_line().await.expect("read"), Some("{\"n\":2}".into()));
    assert_eq!(lines.next_line().await.expect("read"), None);
}

/// Cancellation still flushes what was already queued.
#[tokio::test]
async fn cancellation_drains_queued_values() {
    let (sink, source) = tokio::io::duplex(4096);
    let (tx, rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();

    tx.send(json!({"n": 1})).await.expect("send");
    tx.send(json!({"n": 2})).await.expect("send");
    cancel.cancel();

    run_writer("test", sink, rx, cancel)
        .await
        .expect("writer must finish cleanly");
    drop(tx);

    let mut lines = BufReader::new(source).lines();
    assert_eq!(lines.next_line().await.expect("read"), Some("{\"n\":1}".into()));
    assert_eq!(lines.next_line().await.expect("read"), Some("{\"n\":2}".into()));
}
