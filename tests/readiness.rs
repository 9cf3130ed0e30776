//! End-to-end readiness gating against real subprocesses
//!
//! The launched "servers" are throwaway shell scripts: one that hangs
//! without ever opening its port, and one that exits with a known code.

use inference_sidecar::config::{ReadinessConfig, ServerConfig, ServerRole};
use inference_sidecar::{Launcher, ReadinessGate, ServerGuard, SidecarError, ServerState};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn write_script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");

    let mut perms = std::fs::metadata(&path).expect("stat script").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod script");

    path.to_string_lossy().into_owned()
}

fn server_config(binary: String, port: u16) -> ServerConfig {
    ServerConfig {
        role: ServerRole::Embedding,
        binary_path: Some(binary),
        model_id: "BAAI/bge-base-en-v1.5".to_string(),
        port,
        ..Default::default()
    }
}

fn fast_gate(max_attempts: Option<u32>) -> ReadinessGate {
    ReadinessGate::new(&ReadinessConfig {
        poll_interval_ms: 25,
        connect_timeout_ms: 250,
        max_attempts,
    })
}

/// Bind then drop a listener to get a loopback port that refuses connections
fn refused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr").port()
}

#[tokio::test]
async fn gate_opens_when_listener_accepts() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "fake-server.sh", "sleep 30");

    // The subprocess hangs; the test owns the listener the gate probes
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let launcher = Launcher::new();
    let handle = launcher.spawn(server_config(script, port)).await.unwrap();
    assert_eq!(handle.state().await, ServerState::Starting);

    fast_gate(None).wait(&handle).await.unwrap();
    assert_eq!(handle.state().await, ServerState::Ready);

    handle.terminate(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn gate_reports_exit_code_of_dead_subprocess() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "fake-server.sh", "exit 7");

    let launcher = Launcher::new();
    let handle = launcher
        .spawn(server_config(script, refused_port()))
        .await
        .unwrap();

    let err = fast_gate(None).wait(&handle).await.unwrap_err();
    assert!(
        matches!(err, SidecarError::StartupFailure { code: Some(7) }),
        "unexpected error: {err:?}"
    );
    assert_eq!(handle.state().await, ServerState::Failed);
}

#[tokio::test]
async fn gate_times_out_after_attempt_budget_on_hung_subprocess() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "fake-server.sh", "sleep 30");

    let launcher = Launcher::new();
    let handle = launcher
        .spawn(server_config(script, refused_port()))
        .await
        .unwrap();

    let err = fast_gate(Some(5)).wait(&handle).await.unwrap_err();
    assert!(
        matches!(err, SidecarError::ProbeTimeout { attempts: 5 }),
        "unexpected error: {err:?}"
    );

    // The subprocess is left running; teardown is the guard's job
    assert_eq!(handle.state().await, ServerState::Starting);
    assert!(handle.try_wait().await.is_none());

    handle.terminate(Duration::from_secs(2)).await.unwrap();
    assert_eq!(handle.state().await, ServerState::Terminated);
}

#[tokio::test]
async fn guard_shutdown_terminates_subprocess() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "fake-server.sh", "sleep 30");

    let launcher = Launcher::new();
    let handle = launcher
        .spawn(server_config(script, refused_port()))
        .await
        .unwrap();

    let guard = ServerGuard::new(handle.clone(), Duration::from_secs(2));
    guard.shutdown().await.unwrap();
    assert_eq!(handle.state().await, ServerState::Terminated);

    // Idempotent on an already-terminated handle
    guard.shutdown().await.unwrap();
    assert_eq!(handle.state().await, ServerState::Terminated);
}

#[tokio::test]
async fn spawn_fails_fast_on_missing_binary() {
    let launcher = Launcher::new();
    let config = server_config("/nonexistent/fake-server".to_string(), refused_port());

    let err = launcher.spawn(config).await.unwrap_err();
    assert!(matches!(err, SidecarError::Spawn(_)));
}

#[tokio::test]
async fn ready_handle_returned_as_is_without_probing() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "fake-server.sh", "sleep 30");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let launcher = Launcher::new();
    let handle: Arc<_> = launcher.spawn(server_config(script, port)).await.unwrap();

    let gate = fast_gate(Some(1));
    gate.wait(&handle).await.unwrap();

    // The listener is gone, but a Ready handle never re-probes
    drop(listener);
    gate.wait(&handle).await.unwrap();
    assert_eq!(handle.state().await, ServerState::Ready);

    handle.terminate(Duration::from_secs(2)).await.unwrap();
}
