//! End-to-end tests of the bridge against a shell-script child.
#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use pob_bridge::{BridgeError, BridgeState, ErrorKind, JsonMap};
use pob_test_utils::{FakeBridge, Startup};
use serde_json::{Value, json};

fn params(value: Value) -> Option<JsonMap> {
    match value {
        Value::Object(map) => Some(map),
        _ => panic!("params must be an object"),
    }
}

fn pid_is_alive(pid: u32) -> bool {
    // Signal 0 only checks that the process exists.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

// -- Startup ----------------------------------------------------------------

#[tokio::test]
async fn start_completes_handshake() {
    let fake = FakeBridge::ready();
    let bridge = fake.bridge();

    bridge.start(None).await.unwrap();
    assert!(bridge.is_running());
    assert_eq!(bridge.state(), BridgeState::Ready);
    assert_eq!(bridge.pid(), fake.child_pid());

    bridge.shutdown().await;
}

#[tokio::test]
async fn start_twice_keeps_the_same_child() {
    let fake = FakeBridge::ready();
    let bridge = fake.bridge();

    bridge.start(None).await.unwrap();
    let first = bridge.pid();
    bridge.start(None).await.unwrap();
    assert_eq!(bridge.pid(), first);

    bridge.shutdown().await;
}

#[tokio::test]
async fn silent_child_times_out_and_is_killed() {
    let fake = FakeBridge::builder()
        .startup(Startup::Silent)
        .startup_timeout(Duration::from_millis(300))
        .build();
    let bridge = fake.bridge();

    let started = std::time::Instant::now();
    let err = bridge.start(None).await.unwrap_err();
    assert!(matches!(err, BridgeError::StartupTimeout { .. }), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Startup);
    assert!(started.elapsed() >= Duration::from_millis(300));

    assert!(!bridge.is_running());
    assert_eq!(bridge.state(), BridgeState::Idle);

    let pid = fake.child_pid().expect("child wrote its pid");
    assert!(!pid_is_alive(pid), "child {pid} survived a failed start");
}

#[tokio::test]
async fn garbage_ready_line_is_rejected() {
    let fake = FakeBridge::builder().startup(Startup::Garbage).build();
    let bridge = fake.bridge();

    let err = bridge.start(None).await.unwrap_err();
    assert!(matches!(err, BridgeError::InvalidReady { .. }), "{err:?}");
    assert!(err.to_string().contains("LuaJIT 2.1 banner"));
    assert!(!bridge.is_running());
}

#[tokio::test]
async fn falsy_ready_is_rejected() {
    let fake = FakeBridge::builder().startup(Startup::NotReady).build();
    let bridge = fake.bridge();

    let err = bridge.start(None).await.unwrap_err();
    assert!(matches!(err, BridgeError::UnexpectedReady(_)), "{err:?}");
    assert!(err.to_string().starts_with("unexpected ready message"));
}

#[tokio::test]
async fn child_exiting_before_ready_reports_no_output() {
    let fake = FakeBridge::builder()
        .startup(Startup::ExitImmediately)
        .build();
    let bridge = fake.bridge();

    let err = bridge.start(None).await.unwrap_err();
    assert!(matches!(err, BridgeError::NoOutput), "{err:?}");
    assert_eq!(err.to_string(), "bridge subprocess did not produce any output");
}

#[tokio::test]
async fn missing_layout_fails_before_spawning() {
    let tmp = tempfile::tempdir().unwrap();
    let bridge = pob_bridge::Bridge::new(pob_bridge::BridgeConfig::new(tmp.path()));

    let err = bridge.start(None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(err.to_string().contains("not found"), "{err}");
}

#[tokio::test]
async fn noisy_stderr_does_not_block_startup_or_commands() {
    // Well past a pipe buffer's worth of output.
    let fake = FakeBridge::builder().stderr_noise(5000).build();
    let bridge = fake.bridge();

    bridge.start(None).await.unwrap();
    let result = bridge.call("get_stats", None).await.unwrap();
    assert!(result.is_empty());

    bridge.shutdown().await;
}

// -- Commands ---------------------------------------------------------------

#[tokio::test]
async fn send_command_starts_on_demand() {
    let fake = FakeBridge::ready();
    let bridge = fake.bridge();

    let result = bridge
        .call("alloc_node", params(json!({"node_id": 123})))
        .await
        .unwrap();
    assert_eq!(result["echo"], json!({"node_id": 123}));
    assert!(bridge.is_running());
    assert_eq!(bridge.state(), BridgeState::Ready);

    assert_eq!(
        fake.requests(),
        vec![r#"{"command":"alloc_node","params":{"node_id":123}}"#]
    );
    bridge.shutdown().await;
}

#[tokio::test]
async fn empty_params_are_omitted_on_the_wire() {
    let fake = FakeBridge::ready();
    let bridge = fake.bridge();

    bridge.call("new_build", Some(JsonMap::new())).await.unwrap();
    assert_eq!(fake.requests(), vec![r#"{"command":"new_build"}"#]);

    bridge.shutdown().await;
}

#[tokio::test]
async fn engine_error_is_a_protocol_error() {
    let fake = FakeBridge::builder()
        .respond_err("alloc_node", "bad node id")
        .build();
    let bridge = fake.bridge();

    let err = bridge
        .call("alloc_node", params(json!({"node_id": -1})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(err.to_string(), "bad node id");

    // The bridge keeps serving after an engine error.
    assert!(bridge.is_running());
    assert_eq!(bridge.state(), BridgeState::Ready);
    bridge.call("get_stats", None).await.unwrap();

    bridge.shutdown().await;
}

#[tokio::test]
async fn invalid_response_is_reported_with_the_line() {
    let fake = FakeBridge::builder()
        .respond("get_tree", "tree goes here")
        .build();
    let bridge = fake.bridge();

    let err = bridge.call("get_tree", None).await.unwrap_err();
    assert!(matches!(err, BridgeError::InvalidResponse { .. }), "{err:?}");
    assert!(err.to_string().contains("tree goes here"));
    assert!(bridge.is_running());

    bridge.shutdown().await;
}

#[tokio::test]
async fn concurrent_commands_are_serialized() {
    let fake = FakeBridge::ready();
    let bridge = Arc::new(fake.bridge());
    bridge.start(None).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..20 {
        let bridge = Arc::clone(&bridge);
        tasks.push(tokio::spawn(async move {
            let result = bridge
                .call("echo", params(json!({"i": i})))
                .await
                .unwrap();
            (i, result)
        }));
    }
    for task in tasks {
        let (i, result) = task.await.unwrap();
        assert_eq!(result["echo"], json!({"i": i}), "response for request {i} was mismatched");
    }

    let requests = fake.requests();
    assert_eq!(requests.len(), 20);
    for line in &requests {
        let parsed: Value = serde_json::from_str(line).expect("each request is one whole line");
        assert_eq!(parsed["command"], "echo");
    }

    bridge.shutdown().await;
}

#[tokio::test]
async fn timeout_then_recovery() {
    let fake = FakeBridge::builder()
        .respond_after("calc_with", 1.0, r#"{"ok":true,"result":{"late":true}}"#)
        .build();
    let bridge = fake.bridge();
    bridge.start(None).await.unwrap();

    let err = bridge
        .send_command("calc_with", None, Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.to_string().contains("calc_with"));
    assert!(bridge.is_running());

    // Let the late response land, then make sure it is not handed to the
    // next caller.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let result = bridge
        .call("echo", params(json!({"n": 2})))
        .await
        .unwrap();
    assert_eq!(result["echo"], json!({"n": 2}));

    bridge.shutdown().await;
}

#[tokio::test]
async fn child_dying_mid_command_marks_bridge_crashed() {
    let fake = FakeBridge::builder().die_on("load_build", 3).build();
    let bridge = fake.bridge();
    bridge.start(None).await.unwrap();

    let err = bridge.call("load_build", None).await.unwrap_err();
    assert!(matches!(err, BridgeError::ChildExited { .. }), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(bridge.state(), BridgeState::Crashed);
    assert!(wait_until(|| !bridge.is_running()).await);

    // No automatic restart: the dead session keeps failing fast.
    let err = bridge.call("get_stats", None).await.unwrap_err();
    assert!(matches!(err, BridgeError::NotRunning), "{err:?}");

    bridge.shutdown().await;
    assert_eq!(bridge.state(), BridgeState::Idle);
}

#[tokio::test]
async fn ensure_running_replaces_a_dead_child() {
    let fake = FakeBridge::builder().die_on("load_build", 3).build();
    let bridge = fake.bridge();
    bridge.start(None).await.unwrap();
    let first = bridge.pid();

    let _ = bridge.call("load_build", None).await;
    assert!(wait_until(|| !bridge.is_running()).await);

    bridge.ensure_running().await.unwrap();
    assert!(bridge.is_running());
    assert_ne!(bridge.pid(), first);
    assert_eq!(bridge.state(), BridgeState::Ready);
    bridge.call("get_stats", None).await.unwrap();

    bridge.shutdown().await;
}

#[tokio::test]
async fn is_running_does_not_wait_for_an_in_flight_command() {
    let fake = FakeBridge::builder()
        .respond_after("calc_with", 1.0, r#"{"ok":true,"result":{}}"#)
        .build();
    let bridge = Arc::new(fake.bridge());
    bridge.start(None).await.unwrap();

    let busy = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move { bridge.call("calc_with", None).await })
    };
    assert!(wait_until(|| bridge.state() == BridgeState::Running).await);

    let started = std::time::Instant::now();
    assert!(bridge.is_running());
    assert!(started.elapsed() < Duration::from_millis(100));

    busy.await.unwrap().unwrap();
    assert_eq!(bridge.state(), BridgeState::Ready);
    bridge.shutdown().await;
}

#[tokio::test]
async fn cancelled_command_returns_state_to_ready() {
    let fake = FakeBridge::builder()
        .respond_after("calc_with", 1.0, r#"{"ok":true,"result":{"late":true}}"#)
        .build();
    let bridge = Arc::new(fake.bridge());
    bridge.start(None).await.unwrap();

    let busy = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move { bridge.call("calc_with", None).await })
    };
    assert!(wait_until(|| bridge.state() == BridgeState::Running).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    busy.abort();
    assert!(busy.await.unwrap_err().is_cancelled());

    assert_eq!(bridge.state(), BridgeState::Ready);
    assert!(bridge.is_running());

    // The orphaned answer lands later and is not handed to the next caller.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let result = bridge
        .call("echo", params(json!({"n": 3})))
        .await
        .unwrap();
    assert_eq!(result["echo"], json!({"n": 3}));
    assert_eq!(bridge.state(), BridgeState::Ready);

    bridge.shutdown().await;
}

#[tokio::test]
async fn cancelled_start_returns_state_to_idle() {
    let fake = FakeBridge::builder().startup(Startup::Silent).build();
    let bridge = Arc::new(fake.bridge());

    let starting = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move { bridge.start(None).await })
    };
    assert!(wait_until(|| fake.child_pid().is_some()).await);
    assert_eq!(bridge.state(), BridgeState::Starting);
    starting.abort();
    assert!(starting.await.unwrap_err().is_cancelled());

    assert_eq!(bridge.state(), BridgeState::Idle);
    assert!(!bridge.is_running());
    let pid = fake.child_pid().unwrap();
    assert!(
        wait_until(|| !pid_is_alive(pid)).await,
        "child {pid} survived a cancelled start"
    );
}

#[tokio::test]
async fn cancelled_write_forces_a_fresh_child() {
    let fake = FakeBridge::builder()
        .respond_after("calc_with", 2.0, r#"{"ok":true,"result":{}}"#)
        .build();
    let bridge = Arc::new(fake.bridge());
    bridge.start(None).await.unwrap();
    let first = bridge.pid();

    // While the child sleeps it stops reading stdin.
    let err = bridge
        .send_command("calc_with", None, Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "{err:?}");

    // Far larger than a pipe buffer, so the write blocks part-way.
    let xml = "x".repeat(1 << 20);
    let writing = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move {
            bridge
                .call("load_build_xml", params(json!({"xml": xml})))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    writing.abort();
    assert!(writing.await.unwrap_err().is_cancelled());
    assert_eq!(bridge.state(), BridgeState::Ready);

    let err = bridge.call("get_stats", None).await.unwrap_err();
    assert!(matches!(err, BridgeError::PartialWrite), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(bridge.state(), BridgeState::Crashed);
    assert!(!bridge.is_running());

    bridge.ensure_running().await.unwrap();
    assert_ne!(bridge.pid(), first);
    bridge.call("get_stats", None).await.unwrap();

    bridge.shutdown().await;
}

// -- Shutdown ---------------------------------------------------------------

#[tokio::test]
async fn shutdown_before_start_does_nothing() {
    let fake = FakeBridge::ready();
    let bridge = fake.bridge();

    let report = bridge.shutdown().await;
    assert!(!report.was_started);
    assert!(fake.child_pid().is_none(), "shutdown must not spawn a child");
}

#[tokio::test]
async fn shutdown_is_graceful_and_idempotent() {
    let fake = FakeBridge::ready();
    let bridge = fake.bridge();
    bridge.start(None).await.unwrap();
    let pid = bridge.pid().unwrap();

    let report = bridge.shutdown().await;
    assert!(report.was_started);
    assert!(report.acknowledged);
    assert!(report.exited_gracefully);
    assert!(!report.forced_kill);
    assert_eq!(fake.requests(), vec![r#"{"command":"shutdown"}"#]);

    assert!(!bridge.is_running());
    assert!(bridge.pid().is_none());
    assert_eq!(bridge.state(), BridgeState::Idle);
    assert!(!pid_is_alive(pid));

    let again = bridge.shutdown().await;
    assert!(!again.was_started);
}

#[tokio::test]
async fn shutdown_kills_a_child_that_ignores_it() {
    let fake = FakeBridge::builder()
        .respond("shutdown", r#"{"ok":true,"result":{}}"#)
        .build();
    let bridge = fake.bridge();
    bridge.start(None).await.unwrap();
    let pid = bridge.pid().unwrap();

    let report = bridge.shutdown().await;
    assert!(report.acknowledged);
    assert!(report.forced_kill);
    assert!(!report.exited_gracefully);
    assert!(!pid_is_alive(pid));
    assert_eq!(bridge.state(), BridgeState::Idle);
}

#[tokio::test]
async fn restart_spawns_a_fresh_child() {
    let fake = FakeBridge::ready();
    let bridge = fake.bridge();
    bridge.start(None).await.unwrap();
    let first = bridge.pid();

    let report = bridge.restart().await.unwrap();
    assert!(report.was_started);
    assert!(bridge.is_running());
    assert_ne!(bridge.pid(), first);

    bridge.shutdown().await;
}

#[tokio::test]
async fn command_after_shutdown_starts_again() {
    let fake = FakeBridge::ready();
    let bridge = fake.bridge();
    bridge.start(None).await.unwrap();
    bridge.shutdown().await;

    let result = bridge
        .call("echo", params(json!({"again": true})))
        .await
        .unwrap();
    assert_eq!(result["echo"], json!({"again": true}));

    bridge.shutdown().await;
}
