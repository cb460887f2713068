//! Integration tests for the daemon, driven through the mock runtime
//!
//! Every test runs on tokio's paused clock, so batching and backoff timers
//! advance only when the test sleeps.

use agent_relay_core::config::DaemonConfig;
use agent_relay_core::feature_flags::{FEATURE_FLAGS_ENV, FeatureFlags};
use agent_relay_core::protocol::SessionKey;
use agent_relay_core::retry::RetryConfig;
use agent_relay_daemon::daemon::{self, Daemon, DispatchOutcome, SessionState};
use agent_relay_daemon::runtime::{DaemonRuntime, MockCall, MockRuntime, ProcessExit};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

const HELLO: &str = r#"{"type":"assistant","message":{"content":"Hello"}}"#;

fn test_config() -> DaemonConfig {
    DaemonConfig {
        api_url: "http://api.test".to_string(),
        socket_path: PathBuf::from("/nonexistent/agent-relay-test.sock"),
        retry: RetryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            max_attempts: 3,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        },
        ..Default::default()
    }
}

fn start_frame(thread: &str, chat: &str) -> Vec<u8> {
    serde_json::json!({
        "type": "start-agent",
        "threadId": thread,
        "threadChatId": chat,
        "agent": "claudeCode",
        "agentVersion": 1,
        "model": "sonnet",
        "token": format!("token-{thread}"),
        "prompt": "Say hello",
    })
    .to_string()
    .into_bytes()
}

fn stop_frame(thread: &str, chat: &str) -> Vec<u8> {
    serde_json::json!({
        "type": "stop-agent",
        "threadId": thread,
        "threadChatId": chat,
        "token": format!("token-{thread}"),
    })
    .to_string()
    .into_bytes()
}

async fn start_daemon(rt: &MockRuntime, config: DaemonConfig) -> Daemon {
    let runtime: Arc<dyn DaemonRuntime> = Arc::new(rt.clone());
    Daemon::start(runtime, config, FeatureFlags::empty(), &CancellationToken::new())
        .await
        .unwrap()
}

/// Let spawned tasks run without moving the clock meaningfully.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_hello_line_is_posted_once_after_idle_window() {
    let rt = MockRuntime::new();
    let daemon = start_daemon(&rt, test_config()).await;

    assert!(rt.send_frame(start_frame("T1", "C1")).await);
    settle().await;
    let key = SessionKey::new("T1", "C1");
    assert_eq!(daemon.session(&key), Some((SessionState::Running, Some(1000))));

    rt.emit_line(1000, HELLO).await;
    tokio::time::sleep(Duration::from_millis(249)).await;
    assert!(rt.posts().is_empty(), "flushed before the idle window elapsed");

    tokio::time::sleep(Duration::from_millis(2)).await;
    let posts = rt.posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].url, "http://api.test/api/daemon-event");
    assert_eq!(posts[0].token, "token-T1");
    assert_eq!(posts[0].body["threadId"], "T1");
    assert_eq!(posts[0].body["threadChatId"], "C1");
    assert_eq!(
        posts[0].body["messages"],
        serde_json::json!([serde_json::from_str::<serde_json::Value>(HELLO).unwrap()])
    );

    // Nothing else trickles out later.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(rt.posts().len(), 1);

    daemon.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_distinct_pairs_get_distinct_processes() {
    let rt = MockRuntime::new();
    let daemon = start_daemon(&rt, test_config()).await;

    for (thread, chat) in [("T1", "C1"), ("T1", "C2"), ("T2", "C1")] {
        assert!(matches!(
            daemon.handle_frame(&start_frame(thread, chat)),
            DispatchOutcome::Started(_)
        ));
    }
    settle().await;

    assert_eq!(daemon.session_count(), 3);
    let mut pids: Vec<u32> = daemon
        .session_keys()
        .iter()
        .filter_map(|k| daemon.session(k).and_then(|(_, pid)| pid))
        .collect();
    pids.sort();
    pids.dedup();
    assert_eq!(pids.len(), 3);

    daemon.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frames_leave_registry_untouched() {
    let rt = MockRuntime::new();
    let daemon = start_daemon(&rt, test_config()).await;
    daemon.handle_frame(&start_frame("T1", "C1"));
    settle().await;

    for frame in [
        b"{".to_vec(),
        b"[]".to_vec(),
        br#"{"type":"stop-agent","threadId":"T1"}"#.to_vec(),
        br#"{"type":"start-agent","threadId":"T1","threadChatId":"C1","agent":"claudeCode","token":"","prompt":"x"}"#.to_vec(),
        vec![0xff, 0xfe, 0x00],
    ] {
        assert!(rt.send_frame(frame).await);
    }
    settle().await;

    assert_eq!(daemon.session_count(), 1);
    assert!(rt.killed_pids().is_empty());
    assert_eq!(rt.spawned_pids(), vec![1000]);

    // Still responsive.
    rt.send_frame(start_frame("T2", "C1")).await;
    settle().await;
    assert_eq!(daemon.session_count(), 2);

    daemon.teardown().await;
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_stop_kills_group_and_second_stop_is_noop() {
    let rt = MockRuntime::new();
    let daemon = start_daemon(&rt, test_config()).await;
    daemon.handle_frame(&start_frame("T1", "C1"));
    settle().await;

    let key = SessionKey::new("T1", "C1");
    assert_eq!(daemon.handle_frame(&stop_frame("T1", "C1")), DispatchOutcome::Stopped(key.clone()));
    assert_eq!(rt.killed_pids(), vec![1000]);
    assert_eq!(daemon.session_count(), 0);

    assert_eq!(daemon.handle_frame(&stop_frame("T1", "C1")), DispatchOutcome::StopIgnored(key));
    assert_eq!(rt.killed_pids(), vec![1000]);
    assert!(logs_contain("No session to stop"));

    daemon.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_flushes_lines_already_received() {
    let rt = MockRuntime::new();
    let daemon = start_daemon(&rt, test_config()).await;
    daemon.handle_frame(&start_frame("T1", "C1"));
    settle().await;

    rt.emit_line(1000, r#"{"n":1}"#).await;
    rt.emit_line(1000, r#"{"n":2}"#).await;
    daemon.handle_frame(&stop_frame("T1", "C1"));
    assert!(daemon.drain_deliveries(Duration::from_secs(5)).await);

    let bodies = rt.delivered_bodies();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["messages"], serde_json::json!([{"n":1},{"n":2}]));

    daemon.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_same_key_replaces_process() {
    let rt = MockRuntime::new();
    let daemon = start_daemon(&rt, test_config()).await;
    daemon.handle_frame(&start_frame("T1", "C1"));
    settle().await;
    daemon.handle_frame(&start_frame("T1", "C1"));
    settle().await;

    assert_eq!(rt.killed_pids(), vec![1000]);
    assert_eq!(daemon.session_count(), 1);
    assert_eq!(
        daemon.session(&SessionKey::new("T1", "C1")),
        Some((SessionState::Running, Some(1001)))
    );

    daemon.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_spawn_failure_is_contained() {
    let rt = MockRuntime::new();
    rt.fail_next_spawn("claude: command not found");
    let daemon = start_daemon(&rt, test_config()).await;

    daemon.handle_frame(&start_frame("T1", "C1"));
    settle().await;
    assert_eq!(daemon.session_count(), 0);
    assert!(rt.posts().is_empty());

    // The next start for the same key works normally.
    daemon.handle_frame(&start_frame("T1", "C1"));
    settle().await;
    assert_eq!(daemon.session_count(), 1);

    daemon.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_agent_exit_reports_error_and_evicts() {
    let rt = MockRuntime::new();
    let daemon = start_daemon(&rt, test_config()).await;
    daemon.handle_frame(&start_frame("T1", "C1"));
    settle().await;

    rt.emit_line(1000, HELLO).await;
    rt.exit_process(
        1000,
        ProcessExit {
            code: Some(1),
            signal: None,
            stderr_tail: vec!["rate limited".to_string()],
        },
    )
    .await;
    settle().await;

    assert_eq!(daemon.session_count(), 0);
    assert!(daemon.drain_deliveries(Duration::from_secs(5)).await);
    let bodies = rt.delivered_bodies();
    assert_eq!(bodies.len(), 1);
    let messages = bodies[0]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["type"], "assistant");
    assert_eq!(messages[1]["type"], "daemon-error");
    assert_eq!(messages[1]["stderr"], "rate limited");

    daemon.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_then_success_delivers_exactly_once() {
    let rt = MockRuntime::new();
    rt.push_http_status(500);
    rt.push_http_error("connection reset");
    let daemon = start_daemon(&rt, test_config()).await;
    daemon.handle_frame(&start_frame("T1", "C1"));
    settle().await;

    rt.emit_line(1000, HELLO).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let posts = rt.posts();
    assert_eq!(posts.len(), 3);
    assert_eq!(rt.delivered_bodies().len(), 1);
    assert_eq!(posts[1].at - posts[0].at, Duration::from_millis(100));
    assert_eq!(posts[2].at - posts[1].at, Duration::from_millis(200));
    assert_eq!(daemon.delivery_stats().delivered, 1);

    daemon.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_batch_is_dropped_and_daemon_continues() {
    let rt = MockRuntime::new();
    for _ in 0..3 {
        rt.push_http_status(503);
    }
    let daemon = start_daemon(&rt, test_config()).await;
    daemon.handle_frame(&start_frame("T1", "C1"));
    settle().await;

    rt.emit_line(1000, r#"{"batch":1}"#).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(daemon.delivery_stats().dropped, 1);
    assert!(rt.delivered_bodies().is_empty());

    rt.emit_line(1000, r#"{"batch":2}"#).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    let bodies = rt.delivered_bodies();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["messages"][0]["batch"], 2);

    daemon.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_sessions_deliver_independently() {
    let rt = MockRuntime::new();
    // First post (whichever session flushes first) fails once.
    rt.push_http_status(500);
    let daemon = start_daemon(&rt, test_config()).await;
    daemon.handle_frame(&start_frame("T1", "C1"));
    daemon.handle_frame(&start_frame("T2", "C1"));
    settle().await;

    rt.emit_line(1000, r#"{"from":"T1"}"#).await;
    rt.emit_line(1001, r#"{"from":"T2"}"#).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let mut threads: Vec<String> = rt
        .delivered_bodies()
        .iter()
        .map(|b| b["threadId"].as_str().unwrap().to_string())
        .collect();
    threads.sort();
    assert_eq!(threads, vec!["T1", "T2"]);

    daemon.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_teardown_kills_sessions_and_is_idempotent() {
    let rt = MockRuntime::new();
    let config = DaemonConfig {
        pid_file: Some(PathBuf::from("/run/agent-relay.pid")),
        ..test_config()
    };
    let daemon = start_daemon(&rt, config).await;
    assert_eq!(
        rt.file(&PathBuf::from("/run/agent-relay.pid")),
        Some(std::process::id().to_string())
    );

    daemon.handle_frame(&start_frame("T1", "C1"));
    daemon.handle_frame(&start_frame("T2", "C1"));
    settle().await;

    daemon.teardown().await;
    assert!(daemon.is_torn_down());
    assert_eq!(daemon.session_count(), 0);
    let mut killed = rt.killed_pids();
    killed.sort();
    assert_eq!(killed, vec![1000, 1001]);
    assert!(rt.file(&PathBuf::from("/run/agent-relay.pid")).is_none());

    // Frames after teardown go nowhere.
    assert!(!rt.send_frame(start_frame("T3", "C1")).await);

    let calls_before = rt.calls().len();
    daemon.teardown().await;
    assert_eq!(rt.calls().len(), calls_before);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_startup_log_order() {
    let rt = MockRuntime::new();
    rt.set_file("/etc/agent-relay/mcp.json", r#"{"mcpServers":{}}"#);
    let config = DaemonConfig {
        mcp_config_path: Some(PathBuf::from("/etc/agent-relay/mcp.json")),
        ..test_config()
    };
    let daemon = start_daemon(&rt, config).await;

    logs_assert(|lines: &[&str]| {
        let markers = [
            "Agent relay daemon starting",
            "Daemon version",
            "Remote API",
            "IPC endpoint",
            "MCP config",
            "Daemon ready",
        ];
        let mut last = 0;
        for marker in markers {
            let pos = lines
                .iter()
                .position(|l| l.contains(marker))
                .ok_or_else(|| format!("missing startup log '{marker}'"))?;
            if pos < last {
                return Err(format!("'{marker}' logged out of order"));
            }
            last = pos;
        }
        Ok(())
    });

    // A valid MCP config reaches the claude command line.
    daemon.handle_frame(&start_frame("T1", "C1"));
    settle().await;
    let spec = rt.spec_of(1000).unwrap();
    assert!(spec.args.iter().any(|a| a == "--mcp-config"));

    daemon.teardown().await;
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_invalid_mcp_config_is_omitted() {
    let rt = MockRuntime::new();
    rt.set_file("/etc/agent-relay/mcp.json", "not json");
    let config = DaemonConfig {
        mcp_config_path: Some(PathBuf::from("/etc/agent-relay/mcp.json")),
        ..test_config()
    };
    let daemon = start_daemon(&rt, config).await;
    assert!(logs_contain("MCP config is not valid JSON"));

    daemon.handle_frame(&start_frame("T1", "C1"));
    settle().await;
    let spec = rt.spec_of(1000).unwrap();
    assert!(!spec.args.iter().any(|a| a == "--mcp-config"));

    daemon.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_listen_failure_is_fatal_and_leaves_no_pid_file() {
    let rt = MockRuntime::new();
    rt.fail_listen("address in use");
    let runtime: Arc<dyn DaemonRuntime> = Arc::new(rt.clone());
    let pid_file = PathBuf::from("/run/agent-relay-test.pid");
    let config = DaemonConfig {
        pid_file: Some(pid_file.clone()),
        ..test_config()
    };
    let result = Daemon::start(runtime, config, FeatureFlags::empty(), &CancellationToken::new()).await;

    let err = result.err().expect("start should fail");
    assert!(format!("{err:#}").contains("Failed to listen on IPC endpoint"));
    assert!(rt.calls().iter().all(|c| !matches!(c, MockCall::Listen { .. })));
    assert!(rt.file(&pid_file).is_none());
    assert!(rt.calls().iter().all(|c| !matches!(c, MockCall::WriteFile { .. })));
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_malformed_feature_flags_do_not_block_startup() {
    let flags = FeatureFlags::from_env_value(Some("not json"));
    assert!(flags.is_empty());
    assert!(logs_contain("Failed to parse feature flags"));
    assert!(logs_contain("not json"));

    let rt = MockRuntime::new();
    let runtime: Arc<dyn DaemonRuntime> = Arc::new(rt.clone());
    let daemon = Daemon::start(runtime, test_config(), flags, &CancellationToken::new())
        .await
        .unwrap();
    assert!(daemon.flags().is_empty());

    daemon.handle_frame(&start_frame("T1", "C1"));
    settle().await;
    let spec = rt.spec_of(1000).unwrap();
    let forwarded = spec
        .env
        .iter()
        .find(|(k, _)| k == FEATURE_FLAGS_ENV)
        .map(|(_, v)| v.clone());
    assert_eq!(forwarded.as_deref(), Some("{}"));

    daemon.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_event_loop_runs_until_cancelled() {
    let rt = MockRuntime::new();
    let runtime: Arc<dyn DaemonRuntime> = Arc::new(rt.clone());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(daemon::run(
        runtime,
        test_config(),
        FeatureFlags::empty(),
        cancel.clone(),
    ));

    settle().await;
    assert!(rt.send_frame(start_frame("T1", "C1")).await);
    settle().await;
    rt.emit_line(1000, HELLO).await;

    cancel.cancel();
    task.await.unwrap().unwrap();

    // Shutdown flushed the pending line and killed the session.
    assert_eq!(rt.killed_pids(), vec![1000]);
    assert_eq!(rt.delivered_bodies().len(), 1);
}
