//! Daemon lifecycle: startup sequence, frame pump, heartbeat, teardown.

use super::agent_command::AgentCommandContext;
use super::batcher::BatchTiming;
use super::delivery::{DeliveryQueue, DeliveryStats};
use super::heartbeat::heartbeat_loop;
use super::router::{DispatchOutcome, MessageRouter};
use super::session_registry::SessionState;
use super::sessions::SessionManager;
use crate::runtime::{DaemonRuntime, Frame, ListenerHandle};
use agent_relay_core::config::DaemonConfig;
use agent_relay_core::feature_flags::FeatureFlags;
use agent_relay_core::protocol::SessionKey;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Version reported in the startup log.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Capacity of the listener → router frame channel.
const FRAME_CHANNEL_CAPACITY: usize = 256;

/// A started daemon.
///
/// Built by [`Daemon::start`], which runs the whole startup sequence. Drop
/// it only after [`Daemon::teardown`]; teardown is idempotent.
pub struct Daemon {
    runtime: Arc<dyn DaemonRuntime>,
    config: Arc<DaemonConfig>,
    flags: Arc<FeatureFlags>,
    sessions: SessionManager,
    router: MessageRouter,
    delivery: DeliveryQueue,
    started_at: Instant,
    shutdown: CancellationToken,
    listener: Mutex<Option<ListenerHandle>>,
    pump: Mutex<Option<JoinHandle<u64>>>,
    heartbeat: Mutex<Option<JoinHandle<u64>>>,
    torn_down: AtomicBool,
}

impl Daemon {
    /// Run the startup sequence and return the running daemon.
    ///
    /// Logs the banner, version, API URL, socket path and MCP config path (in
    /// that order), checks the MCP config, starts listening, writes the PID
    /// file, logs readiness and starts the heartbeat. Only a failure to listen
    /// is an error, and it leaves no PID file behind.
    pub async fn start(
        runtime: Arc<dyn DaemonRuntime>,
        config: DaemonConfig,
        flags: FeatureFlags,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let started_at = Instant::now();
        let config = Arc::new(config);
        let flags = Arc::new(flags);

        info!("Agent relay daemon starting");
        info!(version = VERSION, "Daemon version");
        info!(api_url = %config.api_url, "Remote API");
        info!(socket = %config.socket_path.display(), "IPC endpoint");
        if let Some(path) = &config.mcp_config_path {
            info!(path = %path.display(), "MCP config");
        }
        if !flags.is_empty() {
            info!(count = flags.len(), "Feature flags loaded");
        }

        let mcp_config_path = match &config.mcp_config_path {
            Some(path) => check_mcp_config(runtime.as_ref(), path).await,
            None => None,
        };

        let delivery = DeliveryQueue::new(runtime.clone(), config.daemon_event_url(), config.retry);
        let sessions = SessionManager::new(
            runtime.clone(),
            AgentCommandContext {
                mcp_config_path,
                flags: flags.as_ref().clone(),
            },
            BatchTiming {
                handle_delay: config.message_handle_delay,
                flush_delay: config.message_flush_delay,
            },
            delivery.clone(),
        );
        let router = MessageRouter::new(sessions.clone());
        let shutdown = cancel.child_token();

        let (frames_tx, frames_rx) = mpsc::channel::<Frame>(FRAME_CHANNEL_CAPACITY);
        let listener = runtime
            .listen_on_channel(&config.socket_path, frames_tx, shutdown.clone())
            .await
            .with_context(|| {
                format!("Failed to listen on IPC endpoint {}", config.socket_path.display())
            })?;

        if let Some(pid_file) = &config.pid_file {
            let pid = std::process::id().to_string();
            match runtime.write_file(pid_file, &pid).await {
                Ok(()) => debug!(path = %pid_file.display(), pid = %pid, "Wrote PID file"),
                Err(e) => warn!(error = %e, "Failed to write PID file"),
            }
        }

        let pump = {
            let router = router.clone();
            let cancel = shutdown.clone();
            tokio::spawn(async move { router.run(frames_rx, cancel).await })
        };

        info!("Daemon ready");

        let heartbeat = tokio::spawn(heartbeat_loop(
            started_at,
            config.uptime_interval,
            shutdown.clone(),
        ));

        Ok(Self {
            runtime,
            config,
            flags,
            sessions,
            router,
            delivery,
            started_at,
            shutdown,
            listener: Mutex::new(Some(listener)),
            pump: Mutex::new(Some(pump)),
            heartbeat: Mutex::new(Some(heartbeat)),
            torn_down: AtomicBool::new(false),
        })
    }

    /// Stop the heartbeat, stop listening, kill every session's process
    /// group, remove the socket and PID file. Safe to call more than once.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            debug!("Teardown already done");
            return;
        }
        info!("Tearing down daemon");

        self.shutdown.cancel();
        let heartbeat = take(&self.heartbeat);
        if let Some(handle) = heartbeat
            && let Ok(beats) = handle.await
        {
            debug!(beats, "Heartbeat stopped");
        }

        let listener = take(&self.listener);
        if let Some(mut listener) = listener {
            listener.close();
            info!(socket = %listener.socket_path().display(), "Stopped listening");
        }
        let pump = take(&self.pump);
        if let Some(handle) = pump {
            let _ = handle.await;
        }

        let terminated = self.sessions.terminate_all();
        info!(sessions = terminated, "Terminated live sessions");

        if let Some(pid_file) = &self.config.pid_file
            && let Err(e) = self.runtime.remove_file(pid_file).await
        {
            warn!(error = %e, "Failed to remove PID file");
        }
    }

    /// Give supervisors and in-flight deliveries up to `grace` to finish.
    pub async fn drain_deliveries(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        let sessions_done = self.sessions.wait_idle(grace).await;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let deliveries_done = self.delivery.drain(remaining).await;
        sessions_done && deliveries_done
    }

    /// Apply one frame directly, bypassing the socket.
    pub fn handle_frame(&self, frame: &[u8]) -> DispatchOutcome {
        self.router.dispatch(frame)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_keys(&self) -> Vec<SessionKey> {
        self.sessions.keys()
    }

    /// State and PID of a live session.
    pub fn session(&self, key: &SessionKey) -> Option<(SessionState, Option<u32>)> {
        self.sessions.snapshot(key)
    }

    pub fn delivery_stats(&self) -> DeliveryStats {
        self.delivery.stats()
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn flags(&self) -> &FeatureFlags {
        &self.flags
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

/// Return `path` if it holds a readable JSON document, else warn and `None`.
async fn check_mcp_config(runtime: &dyn DaemonRuntime, path: &Path) -> Option<PathBuf> {
    let raw = match runtime.read_file(path).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "MCP config unreadable; agents will start without it");
            return None;
        }
    };
    match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(_) => Some(path.to_path_buf()),
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "MCP config is not valid JSON; agents will start without it"
            );
            None
        }
    }
}
