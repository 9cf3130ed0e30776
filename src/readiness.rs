//! Readiness gating for the launched server
//!
//! The launcher binary takes anywhere from seconds to minutes to bring its
//! HTTP listener up (weights may still be downloading). Until then the only
//! signals available are "the port accepts a TCP connection" and "the
//! process is still alive", and this gate turns those two into a single
//! blocking wait.

use crate::config::ReadinessConfig;
use crate::error::{SidecarError, SidecarResult};
use crate::launcher::{ServerHandle, ServerState};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

/// Polls the server's loopback port until it accepts connections, failing
/// fast if the subprocess exits first.
pub struct ReadinessGate {
    host: IpAddr,
    poll_interval: Duration,
    connect_timeout: Duration,
    max_attempts: Option<u32>,
}

impl ReadinessGate {
    pub fn new(config: &ReadinessConfig) -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            max_attempts: config.max_attempts,
        }
    }

    /// Block until the server accepts a TCP connection on its port.
    ///
    /// On success the handle transitions to Ready exactly once; a handle
    /// that is already Ready returns immediately without re-probing. If the
    /// subprocess exits before the port opens, the handle transitions to
    /// Failed and the exit code is surfaced. With no attempt limit the loop
    /// is unbounded, terminated only by the exit check.
    pub async fn wait(&self, handle: &ServerHandle) -> SidecarResult<()> {
        match handle.state().await {
            ServerState::Ready => return Ok(()),
            ServerState::Starting => {}
            state => return Err(SidecarError::NotReady { state }),
        }

        let addr = (self.host, handle.port());
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(probe)) => {
                    // Probe connections carry no payload
                    drop(probe);
                    handle.mark_ready().await;
                    crate::metrics::update_runner_count(1);

                    tracing::info!(
                        port = handle.port(),
                        attempts = attempts,
                        "server ready"
                    );
                    return Ok(());
                }
                Ok(Err(_)) | Err(_) => {
                    // Refused or timed out. If the launcher process has
                    // exited, a connection can never be made.
                    if let Some(exit) = handle.try_wait().await {
                        handle.mark_failed().await;
                        tracing::error!(
                            port = handle.port(),
                            code = ?exit.code,
                            "server process exited before becoming ready"
                        );
                        return Err(SidecarError::StartupFailure { code: exit.code });
                    }

                    if let Some(max) = self.max_attempts
                        && attempts >= max
                    {
                        tracing::error!(
                            port = handle.port(),
                            attempts = attempts,
                            "readiness probe budget exhausted"
                        );
                        return Err(SidecarError::ProbeTimeout { attempts });
                    }

                    sleep(self.poll_interval).await;
                }
            }
        }
    }
}
