//! Client tests against real child processes.
//!
//! Most tests spawn the `agent-relay` binary; the unix-only tests use small
//! `sh` scripts to play a misbehaving server.

use std::time::Duration;

use agent_relay::config::ClientConfig;
use agent_relay::rpc::client::RpcClient;
use agent_relay::rpc::types::Command;
use agent_relay::AppError;

use super::test_helpers::{binary_client_config, write_server_config};

async fn started(config: ClientConfig) -> RpcClient {
    let client = RpcClient::new(config);
    client.start().await.expect("client should start");
    client
}

/// The spawned server answers a state query.
#[tokio::test]
async fn get_state_from_spawned_server() {
    let client = started(binary_client_config(&[])).await;

    let state = client.get_state().await.expect("get_state");

    assert!(!state.is_streaming);
    assert_eq!(state.active_branch, "main");
    assert_eq!(
        state.model.expect("default model").reference(),
        "local/echo"
    );
    assert_eq!(state.session_file, None);

    client.stop().await;
}

/// `prompt_and_wait` returns the run's events through `agent_end`.
#[tokio::test]
async fn prompt_and_wait_collects_the_run() {
    let client = started(binary_client_config(&[])).await;

    let events = client
        .prompt_and_wait("hello", Vec::new(), None)
        .await
        .expect("run should complete");

    assert_eq!(events.first().and_then(|e| e.kind()), Some("agent_start"));
    let end = events.last().expect("agent_end");
    assert!(end.is_agent_end());
    assert_eq!(end.0["messages"][1]["content"], "Echo: hello");

    let messages = client.get_messages().await.expect("get_messages");
    assert_eq!(messages.len(), 2);

    client.stop().await;
}

/// Concurrent requests each get their own response.
#[tokio::test]
async fn concurrent_requests_resolve_independently() {
    let client = started(binary_client_config(&[])).await;

    let (state, branches, models) = tokio::join!(
        client.get_state(),
        client.list_branches(),
        client.get_available_models()
    );

    assert_eq!(state.expect("get_state").active_branch, "main");
    assert_eq!(branches.expect("list_branches").len(), 1);
    assert_eq!(models.expect("get_available_models")[0].model_id, "echo");

    client.stop().await;
}

/// Server-side failures surface as `AppError::Rpc` with the server's text.
#[tokio::test]
async fn unknown_model_is_an_rpc_error() {
    let client = started(binary_client_config(&[])).await;

    let err = client
        .set_model("google", "missing")
        .await
        .expect_err("unknown model");

    assert!(
        matches!(err, AppError::Rpc(ref msg) if msg == "Model not found: google/missing"),
        "got {err:?}"
    );

    client.stop().await;
}

/// A model selected over the wire is reported by `get_state`.
#[tokio::test]
async fn set_model_round_trips_through_get_state() {
    let client = started(binary_client_config(&[])).await;

    let model = client.set_model("local", "thinker").await;
    // The default registry has only the echo model.
    assert!(
        matches!(model, Err(AppError::Rpc(ref msg)) if msg == "Model not found: local/thinker"),
        "got {model:?}"
    );

    client.stop().await;

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("relay.toml");
    std::fs::write(
        &path,
        "[[models]]\nprovider = \"local\"\nid = \"echo\"\n\n\
         [[models]]\nprovider = \"local\"\nid = \"thinker\"\nreasoning = true\n",
    )
    .expect("write server config");
    let path = path.to_string_lossy().into_owned();
    let client = started(binary_client_config(&["--config", &path])).await;

    let model = client.set_model("local", "thinker").await.expect("set_model");
    assert_eq!(model.model_id, "thinker");
    assert!(model.reasoning);

    let state = client.get_state().await.expect("get_state");
    let selected = state.model.expect("selected model");
    assert_eq!(selected.provider, "local");
    assert_eq!(selected.model_id, "thinker");

    client.stop().await;
}

/// `collect_events` returns a run's events in order through `agent_end`.
#[tokio::test]
async fn collect_events_returns_the_ordered_run() {
    let client = started(binary_client_config(&[])).await;

    let (events, ack) = tokio::join!(
        client.collect_events(Some(Duration::from_secs(5))),
        client.prompt("hello", Vec::new())
    );
    ack.expect("prompt acknowledged");
    let events = events.expect("run should complete");

    let kinds: Vec<&str> = events.iter().filter_map(|e| e.kind()).collect();
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
    assert_eq!(events[9].0["messages"][1]["content"], "Echo: hello");

    client.stop().await;
}

/// A refused second prompt does not end a wait on the first run.
#[tokio::test]
async fn wait_for_idle_outlasts_a_refused_prompt() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server_config = write_server_config(dir.path(), 200);
    let path = server_config.to_string_lossy().into_owned();
    let client = started(binary_client_config(&["--config", &path])).await;

    client
        .prompt("one two three four five", Vec::new())
        .await
        .expect("prompt acknowledged");

    let (idle, second) = tokio::join!(
        client.wait_for_idle(Some(Duration::from_secs(8))),
        async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            client.prompt("again", Vec::new()).await
        }
    );
    second.expect("second prompt is acknowledged before it is refused");
    idle.expect("wait ends on agent_end, not on the refusal");

    let state = client.get_state().await.expect("get_state");
    assert!(!state.is_streaming);

    client.stop().await;
}

/// `collect_events` keeps a refused prompt's failure as an event.
#[tokio::test]
async fn collect_events_keeps_refusals_as_events() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server_config = write_server_config(dir.path(), 200);
    let path = server_config.to_string_lossy().into_owned();
    let client = started(binary_client_config(&["--config", &path])).await;

    let (events, _) = tokio::join!(
        client.collect_events(Some(Duration::from_secs(8))),
        async {
            client
                .prompt("one two three four five", Vec::new())
                .await
                .expect("prompt acknowledged");
            tokio::time::sleep(Duration::from_millis(300)).await;
            client.prompt("again", Vec::new()).await
        }
    );
    let events = events.expect("run should complete");

    assert!(events.last().is_some_and(|e| e.is_agent_end()));
    let refusal = events
        .iter()
        .find(|e| e.is_failure_of("prompt"))
        .expect("refusal collected");
    assert_eq!(refusal.0["error"], "Agent is already processing a prompt");

    client.stop().await;
}

/// `prompt_and_wait` fails fast when its own prompt is refused.
#[tokio::test]
async fn prompt_and_wait_reports_its_own_refusal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server_config = write_server_config(dir.path(), 200);
    let path = server_config.to_string_lossy().into_owned();
    let client = started(binary_client_config(&["--config", &path])).await;

    client
        .prompt("one two three four five", Vec::new())
        .await
        .expect("prompt acknowledged");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let err = client
        .prompt_and_wait("again", Vec::new(), Some(Duration::from_secs(8)))
        .await
        .expect_err("second prompt is refused");
    assert!(
        matches!(err, AppError::Agent(ref msg) if msg == "Agent is already processing a prompt"),
        "got {err:?}"
    );

    client.stop().await;
}

/// `wait_for_idle` returns once a slow run ends.
#[tokio::test]
async fn wait_for_idle_observes_agent_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let server_config = write_server_config(dir.path(), 100);
    let path = server_config.to_string_lossy().into_owned();
    let client = started(binary_client_config(&["--config", &path])).await;

    client
        .prompt("one two three", Vec::new())
        .await
        .expect("prompt acknowledged");
    client
        .wait_for_idle(Some(Duration::from_secs(5)))
        .await
        .expect("run should end");

    let state = client.get_state().await.expect("get_state");
    assert!(!state.is_streaming);
    assert_eq!(state.message_count, 2);

    client.stop().await;
}

/// Branch and checkpoint commands round-trip through the process.
#[tokio::test]
async fn branch_commands_over_the_wire() {
    let client = started(binary_client_config(&[])).await;
    client
        .prompt_and_wait("base", Vec::new(), None)
        .await
        .expect("run should complete");

    let info = client.branch("alt", Some(1)).await.expect("branch");
    assert!(info.active);
    assert_eq!(info.message_count, 1);

    let checkpoint = client
        .create_checkpoint("cp", None)
        .await
        .expect("checkpoint");
    assert_eq!(checkpoint.branch, "alt");
    assert_eq!(
        client.list_checkpoints().await.expect("list checkpoints"),
        vec![checkpoint]
    );

    let err = client
        .switch_branch("nope")
        .await
        .expect_err("unknown branch");
    assert!(matches!(err, AppError::Rpc(ref msg) if msg == "Branch not found: nope"));

    client.stop().await;
}

/// A program that cannot be spawned fails `start`.
#[tokio::test]
async fn missing_program_fails_to_start() {
    let client = RpcClient::new(ClientConfig {
        program: "/definitely/not/an/agent".into(),
        ..ClientConfig::default()
    });

    let err = client.start().await.expect_err("spawn must fail");

    assert!(
        matches!(err, AppError::Process(ref msg) if msg.contains("failed to spawn")),
        "got {err:?}"
    );
}

/// Requests before start, and anything after stop, fail cleanly.
#[tokio::test]
async fn requests_outside_the_running_window_fail() {
    let client = RpcClient::new(binary_client_config(&[]));
    let before = client.get_state().await.expect_err("not started");
    assert!(matches!(before, AppError::Process(ref msg) if msg == "client not started"));

    client.start().await.expect("client should start");
    client.stop().await;

    let after = client.get_state().await.expect_err("stopped");
    assert!(matches!(after, AppError::Process(_)));

    let restart = client.start().await.expect_err("no restart");
    assert!(matches!(restart, AppError::Process(ref msg) if msg == "client was stopped"));

    client.stop().await;
}

#[cfg(unix)]
mod scripted {
    use std::time::Duration;

    use agent_relay::config::ClientConfig;
    use agent_relay::rpc::client::RpcClient;
    use agent_relay::rpc::types::Command;
    use agent_relay::AppError;

    use super::super::test_helpers::script_client_config;

    /// A child that dies during the grace period fails `start` with its stderr.
    #[tokio::test]
    async fn immediate_exit_reports_stderr() {
        let client = RpcClient::new(ClientConfig {
            startup_grace_ms: 300,
            ..script_client_config("echo boom >&2; exit 3")
        });

        let err = client.start().await.expect_err("child exits");

        match err {
            AppError::Process(msg) => {
                assert!(msg.contains("exited immediately"), "got {msg}");
                assert!(msg.contains("boom"), "got {msg}");
            }
            other => panic!("expected a process error, got {other:?}"),
        }
    }

    /// A silent child times the request out and names the command.
    #[tokio::test]
    async fn silent_child_times_out() {
        let client = RpcClient::new(ClientConfig {
            request_timeout_seconds: 1,
            ..script_client_config("cat > /dev/null")
        });
        client.start().await.expect("client should start");

        let err = client.get_state().await.expect_err("no reply");

        match err {
            AppError::Timeout(msg) => {
                assert!(
                    msg.starts_with("Timeout waiting for response to get_state"),
                    "got {msg}"
                );
            }
            other => panic!("expected a timeout, got {other:?}"),
        }

        client.stop().await;
    }

    /// Responses are matched by id whatever order they arrive in; other
    /// JSON lines become events and garbage is dropped.
    #[tokio::test]
    async fn out_of_order_responses_are_correlated() {
        let script = r#"
read first
read second
field() { printf '%s' "$1" | sed -n "s/.*\"$2\":\"\([^\"]*\)\".*/\1/p"; }
echo '{"type":"custom_event","n":1}'
echo 'not json at all'
printf '{"id":"%s","type":"response","command":"%s","success":true}\n' "$(field "$second" id)" "$(field "$second" type)"
printf '{"id":"%s","type":"response","command":"%s","success":true}\n' "$(field "$first" id)" "$(field "$first" type)"
cat > /dev/null
"#;
        let client = RpcClient::new(script_client_config(script));
        client.start().await.expect("client should start");
        let mut events = client.subscribe().await;

        let (state, messages) = tokio::join!(
            client.send(Command::GetState),
            client.send(Command::GetMessages)
        );

        let state = state.expect("get_state response");
        let messages = messages.expect("get_messages response");
        assert_eq!(state.command, "get_state");
        assert_eq!(messages.command, "get_messages");
        assert_ne!(state.id, messages.id);

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event before timeout")
            .expect("event stream open");
        assert_eq!(event.kind(), Some("custom_event"));

        client.stop().await;
    }

    /// A child that stops reading stdin cannot hold a request past its
    /// timeout, and later requests do not hang behind it.
    #[tokio::test]
    async fn stalled_stdin_write_still_times_out() {
        let client = RpcClient::new(ClientConfig {
            request_timeout_seconds: 1,
            ..script_client_config("exec sleep 30")
        });
        client.start().await.expect("client should start");

        // Larger than any pipe buffer, so the write blocks.
        let message = "x".repeat(512 * 1024);
        let err = tokio::time::timeout(Duration::from_secs(5), client.prompt(message, Vec::new()))
            .await
            .expect("request must respect its own timeout")
            .expect_err("nobody reads stdin");
        assert!(
            matches!(err, AppError::Timeout(ref msg) if msg.starts_with("Timeout waiting for response to prompt")),
            "got {err:?}"
        );

        let next = tokio::time::timeout(Duration::from_secs(5), client.get_state())
            .await
            .expect("later requests must not hang")
            .expect_err("stdin was abandoned");
        assert!(matches!(next, AppError::Process(_)), "got {next:?}");

        client.stop().await;
    }

    /// With `fail_pending_on_exit`, a dying child fails in-flight requests
    /// without waiting for the timeout.
    #[tokio::test]
    async fn child_exit_fails_pending_requests() {
        let client = RpcClient::new(ClientConfig {
            fail_pending_on_exit: true,
            request_timeout_seconds: 30,
            ..script_client_config("read line; exit 0")
        });
        client.start().await.expect("client should start");

        let err = tokio::time::timeout(Duration::from_secs(5), client.get_state())
            .await
            .expect("must not wait for the request timeout")
            .expect_err("child exited");

        assert!(
            matches!(err, AppError::Rpc(ref msg) if msg.contains("exited before responding")),
            "got {err:?}"
        );

        client.stop().await;
    }
}

/// Raw `send` returns failed responses instead of an error.
#[tokio::test]
async fn send_returns_failed_responses() {
    let client = started(binary_client_config(&[])).await;

    let response = client
        .send(Command::SwitchBranch {
            name: "nope".into(),
        })
        .await
        .expect("a response arrives");

    assert!(!response.success);
    assert_eq!(response.command, "switch_branch");
    assert_eq!(response.error.as_deref(), Some("Branch not found: nope"));

    client.stop().await;
}
