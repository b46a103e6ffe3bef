//! Unit tests for the in-process reference session.
//!
//! Covers the event sequence of a run, queued-message delivery, error
//! embedding, abort, model and thinking-level rules, compaction, branches,
//! checkpoints, export, and reset.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use agent_relay::config::{AgentConfig, ModelEntry};
use agent_relay::session::local::{EchoResponder, GenerateRequest, LocalSession, Responder};
use agent_relay::session::{
    AgentEvent, AgentSession, QueueMode, Role, SessionFuture, StopReason, ThinkingLevel,
};
use agent_relay::{AppError, RelayConfig};

fn config_with(chunk_delay_ms: u64) -> RelayConfig {
    RelayConfig {
        agent: AgentConfig {
            chunk_delay_ms,
            keep_recent: 2,
            ..AgentConfig::default()
        },
        models: vec![
            ModelEntry {
                provider: "local".into(),
                id: "echo".into(),
                name: Some("Echo".into()),
                reasoning: false,
            },
            ModelEntry {
                provider: "local".into(),
                id: "thinker".into(),
                name: None,
                reasoning: true,
            },
        ],
        ..RelayConfig::default()
    }
}

async fn echo_session() -> LocalSession {
    LocalSession::open(&config_with(0), Arc::new(EchoResponder))
        .await
        .expect("session should open")
}

fn drain(rx: &mut mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

struct FailingResponder;

impl Responder for FailingResponder {
    fn generate(&self, _request: GenerateRequest) -> SessionFuture<'_, Vec<String>> {
        Box::pin(async { Err(AppError::Agent("model unavailable".into())) })
    }
}

// ── Runs ────────────────────────────────────────────────────────────────────

/// A prompt produces the full lifecycle in order.
#[tokio::test]
async fn prompt_emits_lifecycle_events_in_order() {
    let session = echo_session().await;
    let mut rx = session.subscribe();

    session
        .prompt("hello".into(), Vec::new())
        .await
        .expect("prompt should run");

    let events = drain(&mut rx);
    let kinds: Vec<&str> = events.iter().map(AgentEvent::kind).collect();
    assert_eq!(
        kinds,
        vec![
            "agent_start",
            "turn_start",
            "message_start",
            "message_end",
            "message_start",
            "message_update",
            "message_update",
            "message_end",
            "turn_end",
            "agent_end",
        ]
    );

    let Some(AgentEvent::AgentEnd { messages }) = events.last() else {
        panic!("last event must be agent_end");
    };
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "Echo: hello");
    assert_eq!(messages[1].stop_reason, Some(StopReason::Stop));
    assert_eq!(messages[1].model.as_deref(), Some("local/echo"));

    assert_eq!(session.messages(), messages.clone());
    assert!(!session.state().is_streaming);
}

/// Every subscriber sees every event.
#[tokio::test]
async fn events_fan_out_to_every_subscriber() {
    let session = echo_session().await;
    let mut first = session.subscribe();
    let mut second = session.subscribe();

    session
        .prompt("hi".into(), Vec::new())
        .await
        .expect("prompt should run");

    assert_eq!(drain(&mut first), drain(&mut second));
}

/// Empty prompts are refused before the run starts.
#[tokio::test]
async fn empty_prompt_is_rejected() {
    let session = echo_session().await;
    let mut rx = session.subscribe();

    let err = session
        .prompt("   ".into(), Vec::new())
        .await
        .expect_err("empty prompt must fail");

    assert_eq!(err.message(), "Message must not be empty");
    assert!(drain(&mut rx).is_empty(), "no events for a refused prompt");
}

/// Responder failures end up on the assistant message, not as an error.
#[tokio::test]
async fn responder_failure_is_embedded_in_message() {
    let session = LocalSession::open(&config_with(0), Arc::new(FailingResponder))
        .await
        .expect("session should open");

    session
        .prompt("hello".into(), Vec::new())
        .await
        .expect("a failing responder must not fail the prompt");

    let messages = session.messages();
    let reply = messages.last().expect("assistant message");
    assert_eq!(reply.role, Role::Assistant);
    assert_eq!(reply.stop_reason, Some(StopReason::Error));
    assert_eq!(reply.error_message.as_deref(), Some("model unavailable"));
}

// ── Queued messages ─────────────────────────────────────────────────────────

/// In one-at-a-time mode each queued message gets its own turn.
#[tokio::test]
async fn queued_messages_are_delivered_one_per_turn() {
    let session = echo_session().await;
    session.queue_message("second".into()).await.expect("queue");
    session.queue_message("third".into()).await.expect("queue");
    assert_eq!(session.state().queued_message_count, 2);

    session
        .prompt("first".into(), Vec::new())
        .await
        .expect("prompt should run");

    let users: Vec<String> = session
        .messages()
        .into_iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content)
        .collect();
    assert_eq!(users, vec!["first", "second", "third"]);
    assert_eq!(session.state().queued_message_count, 0);
}

/// In `all` mode every queued message is delivered in a single turn.
#[tokio::test]
async fn queued_messages_are_batched_in_all_mode() {
    let session = echo_session().await;
    session.set_queue_mode(QueueMode::All);
    session.queue_message("second".into()).await.expect("queue");
    session.queue_message("third".into()).await.expect("queue");

    session
        .prompt("first".into(), Vec::new())
        .await
        .expect("prompt should run");

    let users: Vec<String> = session
        .messages()
        .into_iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content)
        .collect();
    assert_eq!(users, vec!["first".to_owned(), "second\n\nthird".to_owned()]);
}

/// Queue changes are announced.
#[tokio::test]
async fn queue_message_emits_queue_update() {
    let session = echo_session().await;
    let mut rx = session.subscribe();

    session.queue_message("later".into()).await.expect("queue");

    assert_eq!(
        drain(&mut rx),
        vec![AgentEvent::QueueUpdate {
            queued: vec!["later".into()]
        }]
    );
}

// ── Abort ───────────────────────────────────────────────────────────────────

/// Aborting mid-stream stops the reply and marks it aborted.
#[tokio::test]
async fn abort_stops_streaming_reply() {
    let session = Arc::new(
        LocalSession::open(&config_with(200), Arc::new(EchoResponder))
            .await
            .expect("session should open"),
    );
    let mut rx = session.subscribe();

    let runner = Arc::clone(&session);
    let run = tokio::spawn(async move {
        runner
            .prompt("one two three four five".into(), Vec::new())
            .await
    });

    // Wait until the assistant message has started streaming.
    let mut starts = 0;
    while starts < 2 {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event before timeout")
            .expect("stream open");
        if matches!(event, AgentEvent::MessageStart { .. }) {
            starts += 1;
        }
    }
    assert!(session.state().is_streaming);

    let busy = session
        .prompt("again".into(), Vec::new())
        .await
        .expect_err("a second prompt must be refused while streaming");
    assert_eq!(busy.message(), "Agent is already processing a prompt");

    session.abort().await.expect("abort");
    run.await
        .expect("run task must not panic")
        .expect("aborted run still completes");

    let reply = session.messages().pop().expect("assistant message");
    assert_eq!(reply.stop_reason, Some(StopReason::Aborted));
    assert!(!session.state().is_streaming);
}

/// Abort while idle does nothing.
#[tokio::test]
async fn abort_when_idle_is_a_noop() {
    let session = echo_session().await;
    session.abort().await.expect("abort when idle");
    session.abort().await.expect("second abort when idle");
    assert!(session.messages().is_empty());
}

// ── Models and thinking ─────────────────────────────────────────────────────

/// Unknown models are reported with their full reference.
#[tokio::test]
async fn unknown_model_is_not_found() {
    let session = echo_session().await;

    let err = session
        .change_model("google".into(), "missing".into())
        .await
        .expect_err("unknown model must fail");

    assert!(matches!(err, AppError::NotFound(_)));
    assert_eq!(err.message(), "Model not found: google/missing");
}

/// Non-reasoning models clamp the thinking level to `off`.
#[tokio::test]
async fn thinking_level_follows_model_capability() {
    let session = echo_session().await;

    assert_eq!(
        session
            .update_thinking_level(ThinkingLevel::High)
            .expect("set level"),
        ThinkingLevel::Off
    );

    let model = session
        .change_model("local".into(), "thinker".into())
        .await
        .expect("known model");
    assert!(model.reasoning);
    assert_eq!(
        session
            .update_thinking_level(ThinkingLevel::High)
            .expect("set level"),
        ThinkingLevel::High
    );

    session
        .change_model("local".into(), "echo".into())
        .await
        .expect("known model");
    assert_eq!(session.state().thinking_level, ThinkingLevel::Off);
}

// ── Compaction ──────────────────────────────────────────────────────────────

/// Older messages collapse into one summary; recent ones stay.
#[tokio::test]
async fn compaction_keeps_recent_messages() {
    let session = echo_session().await;
    for text in ["one", "two", "three"] {
        session
            .prompt(text.into(), Vec::new())
            .await
            .expect("prompt should run");
    }
    let mut rx = session.subscribe();

    let result = session.compact_history(None).await.expect("compact");

    assert_eq!(result.removed_messages, 4);
    assert_eq!(result.kept_messages, 2);
    assert!(result.tokens_before > 0);
    assert!(result.summary.starts_with("Summary of 4 earlier messages:"));

    let messages = session.messages();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].role, Role::Summary);
    assert_eq!(messages[0].content, result.summary);
    assert_eq!(messages[1].content, "three");

    assert_eq!(
        drain(&mut rx),
        vec![AgentEvent::Compaction {
            branch: "main".into(),
            removed_messages: 4
        }]
    );
}

/// Compacting a short history fails.
#[tokio::test]
async fn compaction_of_short_history_fails() {
    let session = echo_session().await;

    let err = session
        .compact_history(Some(10))
        .await
        .expect_err("nothing to compact");

    assert_eq!(err.message(), "Nothing to compact");
}

// ── Branches ────────────────────────────────────────────────────────────────

/// Branches fork from a prefix and can be switched to.
#[tokio::test]
async fn branches_fork_and_switch() {
    let session = echo_session().await;
    session
        .prompt("hello".into(), Vec::new())
        .await
        .expect("prompt should run");

    let info = session
        .create_branch("alt".into(), Some(1))
        .await
        .expect("create branch");
    assert_eq!(info.message_count, 1);
    assert!(!info.active);

    let names: Vec<String> = session.list_branches().into_iter().map(|b| b.name).collect();
    assert_eq!(names, vec!["alt", "main"]);

    session.switch_branch("alt".into()).await.expect("switch");
    assert_eq!(session.state().active_branch, "alt");
    assert_eq!(session.messages().len(), 1);

    let missing = session
        .switch_branch("nope".into())
        .await
        .expect_err("unknown branch");
    assert_eq!(missing.message(), "Branch not found: nope");

    let duplicate = session
        .create_branch("main".into(), None)
        .await
        .expect_err("duplicate branch");
    assert!(duplicate.message().contains("already exists"));

    let out_of_range = session
        .create_branch("far".into(), Some(5))
        .await
        .expect_err("index past the end");
    assert!(out_of_range.message().contains("fromIndex 5"));
}

/// `branch` creates and switches in one step.
#[tokio::test]
async fn branch_and_switch_activates_new_branch() {
    let session = echo_session().await;
    let mut rx = session.subscribe();

    let info = session
        .branch_and_switch("draft".into(), None)
        .await
        .expect("branch");

    assert!(info.active);
    assert_eq!(session.state().active_branch, "draft");
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, AgentEvent::BranchSwitched { branch } if branch.name == "draft")));
}

/// Merging appends only the messages after the common prefix.
#[tokio::test]
async fn merge_appends_divergent_tail() {
    let session = echo_session().await;
    session
        .prompt("shared".into(), Vec::new())
        .await
        .expect("prompt should run");
    session
        .branch_and_switch("feature".into(), None)
        .await
        .expect("branch");
    session
        .prompt("feature work".into(), Vec::new())
        .await
        .expect("prompt should run");

    let result = session
        .smart_merge_branch("feature".into(), Some("main".into()))
        .await
        .expect("merge");
    assert_eq!(result.merged_messages, 2);
    assert_eq!(result.target, "main");

    session.switch_branch("main".into()).await.expect("switch");
    let contents: Vec<String> = session.messages().into_iter().map(|m| m.content).collect();
    assert_eq!(
        contents,
        vec!["shared", "Echo: shared", "feature work", "Echo: feature work"]
    );

    let again = session
        .smart_merge_branch("feature".into(), Some("main".into()))
        .await
        .expect("second merge");
    assert_eq!(again.merged_messages, 0, "nothing new to merge");

    let itself = session
        .smart_merge_branch("main".into(), None)
        .await
        .expect_err("self merge");
    assert_eq!(itself.message(), "Cannot merge a branch into itself");
}

// ── Checkpoints, stats, export, reset ───────────────────────────────────────

/// Checkpoints record the branch position and metadata.
#[tokio::test]
async fn checkpoints_record_position() {
    let session = echo_session().await;
    session
        .prompt("hello".into(), Vec::new())
        .await
        .expect("prompt should run");

    let checkpoint = session
        .create_checkpoint("before-refactor".into(), Some(json!({"ticket": 42})))
        .await
        .expect("checkpoint");

    assert_eq!(checkpoint.branch, "main");
    assert_eq!(checkpoint.message_index, 2);
    assert_eq!(checkpoint.metadata, Some(json!({"ticket": 42})));
    assert_eq!(session.list_checkpoints(), vec![checkpoint]);

    assert!(session
        .create_checkpoint(String::new(), None)
        .await
        .is_err());
}

/// Stats count the active branch.
#[tokio::test]
async fn stats_count_messages_by_role() {
    let session = echo_session().await;
    session
        .prompt("hello".into(), Vec::new())
        .await
        .expect("prompt should run");

    let stats = session.session_stats();

    assert_eq!(stats.user_messages, 1);
    assert_eq!(stats.assistant_messages, 1);
    assert_eq!(stats.total_messages, 2);
    assert_eq!(stats.branches, 1);
    assert_eq!(stats.session_file, None);
    assert!(stats.estimated_tokens > 0);
}

/// The HTML transcript escapes message content.
#[tokio::test]
async fn export_writes_escaped_html() {
    let dir = tempfile::tempdir().expect("tempdir");
    let session = echo_session().await;
    session
        .prompt("<b>bold</b> & more".into(), Vec::new())
        .await
        .expect("prompt should run");

    let target = dir.path().join("transcript.html");
    let path = session
        .export_to_html(Some(target.clone()))
        .await
        .expect("export");
    assert_eq!(path, target);

    let html = std::fs::read_to_string(&path).expect("read export");
    assert!(html.contains("&lt;b&gt;bold&lt;/b&gt; &amp; more"));
    assert!(!html.contains("<b>bold</b>"));
}

/// Reset clears history and starts a new session id.
#[tokio::test]
async fn reset_starts_fresh_session() {
    let session = echo_session().await;
    session
        .prompt("hello".into(), Vec::new())
        .await
        .expect("prompt should run");
    session
        .create_branch("alt".into(), None)
        .await
        .expect("branch");
    let before = session.state().session_id;

    session.reset().await.expect("reset");

    let state = session.state();
    assert_ne!(state.session_id, before);
    assert_eq!(state.message_count, 0);
    assert_eq!(state.branches, vec!["main"]);
    assert!(session.list_checkpoints().is_empty());

    session.reset().await.expect("reset of an empty session");
}

/// Without a session directory there is nothing to list.
#[tokio::test]
async fn list_sessions_without_store_is_empty() {
    let session = echo_session().await;
    assert!(session.list_sessions().await.expect("list").is_empty());
}
