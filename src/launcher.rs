//! Inference server process lifecycle

use crate::config::ServerConfig;
use crate::error::{SidecarError, SidecarResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Configuration for spawning an inference server process
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub binary_path: String,
    pub model_id: String,
    pub revision: Option<String>,
    pub quantize: Option<String>,
    pub port: u16,
    pub extra_args: Vec<String>,
}

impl SpawnConfig {
    fn from_server_config(config: &ServerConfig) -> Self {
        Self {
            binary_path: config.binary().to_string(),
            model_id: config.model_id.clone(),
            revision: config.revision.clone(),
            quantize: config.quantize.clone(),
            port: config.port,
            extra_args: config.extra_args.clone(),
        }
    }
}

/// Opaque handle to a spawned process
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub(crate) id: String,
}

/// Exit status of a finished process. `code` is None when the process was
/// killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

/// Trait for managing process lifecycle
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Spawn a new server process
    async fn spawn(&self, config: SpawnConfig) -> SidecarResult<ProcessHandle>;

    /// Request graceful termination (SIGTERM), escalating to SIGKILL after
    /// the grace timeout
    async fn terminate(&self, handle: ProcessHandle, grace: Duration) -> SidecarResult<()>;

    /// Non-blocking exit check. Returns the exit status once the process
    /// has finished, None while it is still running.
    async fn try_wait(&self, handle: &ProcessHandle) -> Option<ProcessExit>;

    /// Get process ID
    async fn pid(&self, handle: &ProcessHandle) -> Option<u32>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production process manager using tokio::process
pub struct SystemProcessManager {
    processes: Arc<RwLock<std::collections::HashMap<String, Child>>>,
}

impl SystemProcessManager {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(RwLock::new(std::collections::HashMap::new())),
        }
    }
}

impl Default for SystemProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessManager for SystemProcessManager {
    async fn spawn(&self, config: SpawnConfig) -> SidecarResult<ProcessHandle> {
        let mut cmd = Command::new(&config.binary_path);

        cmd.arg("--model-id").arg(&config.model_id);
        cmd.arg("--port").arg(config.port.to_string());

        if let Some(revision) = &config.revision {
            cmd.arg("--revision").arg(revision);
        }
        if let Some(quantize) = &config.quantize {
            cmd.arg("--quantize").arg(quantize);
        }

        for arg in &config.extra_args {
            cmd.arg(arg);
        }

        // stdout/stderr stay attached to the container's log stream
        let child = cmd.kill_on_drop(true).spawn()?;

        let pid = child
            .id()
            .ok_or_else(|| SidecarError::StartupFailure { code: None })?;
        let handle_id = format!("process_{}", pid);

        tracing::info!(
            binary = %config.binary_path,
            model = %config.model_id,
            port = config.port,
            pid = pid,
            "server process spawned"
        );

        let handle = ProcessHandle {
            id: handle_id.clone(),
        };

        self.processes.write().await.insert(handle_id, child);

        Ok(handle)
    }

    async fn terminate(&self, handle: ProcessHandle, grace: Duration) -> SidecarResult<()> {
        let mut processes = self.processes.write().await;

        if let Some(mut child) = processes.remove(&handle.id) {
            if let Some(pid) = child.id() {
                #[cfg(unix)]
                {
                    use nix::sys::signal::{Signal, kill};
                    use nix::unistd::Pid;

                    let pid = Pid::from_raw(pid as i32);
                    let _ = kill(pid, Signal::SIGTERM);

                    tokio::select! {
                        _ = child.wait() => {
                            tracing::info!("server process stopped gracefully");
                        }
                        _ = tokio::time::sleep(grace) => {
                            tracing::warn!("graceful shutdown timeout, sending SIGKILL");
                            let _ = kill(pid, Signal::SIGKILL);
                            let _ = child.wait().await;
                        }
                    }
                }

                #[cfg(not(unix))]
                {
                    let _ = child.kill().await;
                }
            }
        }

        Ok(())
    }

    async fn try_wait(&self, handle: &ProcessHandle) -> Option<ProcessExit> {
        let mut processes = self.processes.write().await;
        let child = processes.get_mut(&handle.id)?;

        match child.try_wait() {
            Ok(Some(status)) => Some(ProcessExit {
                code: status.code(),
            }),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "failed to poll process exit status");
                None
            }
        }
    }

    async fn pid(&self, handle: &ProcessHandle) -> Option<u32> {
        let processes = self.processes.read().await;
        processes.get(&handle.id).and_then(|p| p.id())
    }
}

// ============================================================================
// Server Handle
// ============================================================================

/// Lifecycle state of the spawned server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Starting,
    Ready,
    Failed,
    Terminated,
}

/// In-process record of the one inference server subprocess owned by this
/// container instance.
pub struct ServerHandle {
    pub config: ServerConfig,
    manager: Arc<dyn ProcessManager>,
    process: RwLock<Option<ProcessHandle>>,
    state: RwLock<ServerState>,
    last_pid: AtomicU32,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("config", &self.config)
            .field(
                "state",
                &self.state.try_read().map(|s| *s).ok(),
            )
            .field(
                "last_pid",
                &self.last_pid.load(Ordering::SeqCst),
            )
            .finish_non_exhaustive()
    }
}

impl ServerHandle {
    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Refuse requests against a handle that is not Ready
    pub async fn ensure_ready(&self) -> SidecarResult<()> {
        let state = self.state().await;
        if state != ServerState::Ready {
            return Err(SidecarError::NotReady { state });
        }
        Ok(())
    }

    /// Transition Starting -> Ready. Later calls are no-ops, so the gate
    /// flips the state exactly once.
    pub(crate) async fn mark_ready(&self) {
        let mut state = self.state.write().await;
        if *state == ServerState::Starting {
            *state = ServerState::Ready;
        }
    }

    pub(crate) async fn mark_failed(&self) {
        *self.state.write().await = ServerState::Failed;
    }

    /// Loopback port the server listens on
    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Non-blocking exit check against the underlying process
    pub async fn try_wait(&self) -> Option<ProcessExit> {
        let process = self.process.read().await;
        let handle = process.as_ref()?;
        self.manager.try_wait(handle).await
    }

    pub async fn pid(&self) -> Option<u32> {
        let process = self.process.read().await;
        let handle = process.as_ref()?;
        self.manager.pid(handle).await
    }

    /// Last observed pid, usable without awaiting (e.g. from Drop)
    pub fn last_pid(&self) -> Option<u32> {
        match self.last_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Request graceful termination regardless of current state.
    /// Idempotent: a handle that is already Terminated is left alone.
    pub async fn terminate(&self, grace: Duration) -> SidecarResult<()> {
        {
            let state = self.state.read().await;
            if *state == ServerState::Terminated {
                return Ok(());
            }
        }

        let taken = self.process.write().await.take();
        if let Some(handle) = taken {
            self.manager.terminate(handle, grace).await?;
            tracing::info!(model = %self.config.model_id, "server process terminated");
        }

        *self.state.write().await = ServerState::Terminated;
        self.last_pid.store(0, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Launcher
// ============================================================================

/// Starts the inference server subprocess and hands back a ServerHandle in
/// Starting state.
pub struct Launcher {
    manager: Arc<dyn ProcessManager>,
}

impl Launcher {
    pub fn new() -> Self {
        Self::with_manager(Arc::new(SystemProcessManager::new()))
    }

    pub fn with_manager(manager: Arc<dyn ProcessManager>) -> Self {
        Self { manager }
    }

    /// Spawn the server process. Fails immediately on OS-level errors
    /// (missing executable, exec failure); inference-level startup problems
    /// surface later through the readiness gate.
    pub async fn spawn(&self, config: ServerConfig) -> SidecarResult<Arc<ServerHandle>> {
        let spawn_config = SpawnConfig::from_server_config(&config);
        let process = self.manager.spawn(spawn_config).await?;
        let pid = self.manager.pid(&process).await;

        let handle = Arc::new(ServerHandle {
            config,
            manager: self.manager.clone(),
            process: RwLock::new(Some(process)),
            state: RwLock::new(ServerState::Starting),
            last_pid: AtomicU32::new(pid.unwrap_or(0)),
        });

        Ok(handle)
    }
}

impl Default for Launcher {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Teardown Guard
// ============================================================================

/// Scoped teardown for the server subprocess.
///
/// `shutdown()` is the normal path (SIGTERM, then SIGKILL after the grace
/// period). If the guard is dropped without it, Drop sends a synchronous
/// SIGTERM and the child's kill_on_drop covers the rest, so the subprocess
/// does not outlive the container on any exit path.
pub struct ServerGuard {
    handle: Arc<ServerHandle>,
    grace: Duration,
    released: AtomicBool,
}

impl ServerGuard {
    pub fn new(handle: Arc<ServerHandle>, grace: Duration) -> Self {
        Self {
            handle,
            grace,
            released: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> Arc<ServerHandle> {
        self.handle.clone()
    }

    /// Gracefully stop the subprocess. Safe to call more than once.
    pub async fn shutdown(&self) -> SidecarResult<()> {
        self.released.store(true, Ordering::SeqCst);
        self.handle.terminate(self.grace).await
    }
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        if self.released.load(Ordering::SeqCst) {
            return;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = self.handle.last_pid() {
                tracing::warn!(pid = pid, "guard dropped without shutdown, sending SIGTERM");
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::collections::HashMap;

    /// Mock process manager for testing
    pub struct MockProcessManager {
        processes: Arc<RwLock<HashMap<String, ProcessState>>>,
        next_id: Arc<RwLock<u32>>,
    }

    #[derive(Debug, Clone)]
    struct ProcessState {
        pid: u32,
        exit: Option<ProcessExit>,
        config: SpawnConfig,
    }

    impl Default for MockProcessManager {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockProcessManager {
        pub fn new() -> Self {
            Self {
                processes: Arc::new(RwLock::new(HashMap::new())),
                next_id: Arc::new(RwLock::new(1000)),
            }
        }

        /// Get the number of tracked processes
        pub async fn process_count(&self) -> usize {
            self.processes.read().await.len()
        }

        /// Check if a process was spawned with specific config
        pub async fn was_spawned_with(&self, model_id: &str, port: u16) -> bool {
            let processes = self.processes.read().await;
            processes
                .values()
                .any(|p| p.config.model_id == model_id && p.config.port == port)
        }

        /// Get spawn config for a handle
        pub async fn get_config(&self, handle: &ProcessHandle) -> Option<SpawnConfig> {
            let processes = self.processes.read().await;
            processes.get(&handle.id).map(|p| p.config.clone())
        }

        /// Simulate every tracked process exiting with the given code
        pub async fn exit_all(&self, code: i32) {
            let mut processes = self.processes.write().await;
            for state in processes.values_mut() {
                state.exit = Some(ProcessExit { code: Some(code) });
            }
        }
    }

    #[async_trait]
    impl ProcessManager for MockProcessManager {
        async fn spawn(&self, config: SpawnConfig) -> SidecarResult<ProcessHandle> {
            let mut next_id = self.next_id.write().await;
            let pid = *next_id;
            *next_id += 1;

            let handle_id = format!("mock_process_{}", pid);
            let handle = ProcessHandle {
                id: handle_id.clone(),
            };

            let state = ProcessState {
                pid,
                exit: None,
                config,
            };

            self.processes.write().await.insert(handle_id, state);

            Ok(handle)
        }

        async fn terminate(&self, handle: ProcessHandle, _grace: Duration) -> SidecarResult<()> {
            let mut processes = self.processes.write().await;
            processes.remove(&handle.id);
            Ok(())
        }

        async fn try_wait(&self, handle: &ProcessHandle) -> Option<ProcessExit> {
            let processes = self.processes.read().await;
            processes.get(&handle.id).and_then(|p| p.exit)
        }

        async fn pid(&self, handle: &ProcessHandle) -> Option<u32> {
            let processes = self.processes.read().await;
            processes.get(&handle.id).map(|p| p.pid)
        }
    }
}
