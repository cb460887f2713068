//! Main daemon event loop

use super::orchestrator::Daemon;
use super::shutdown::graceful_shutdown;
use crate::runtime::DaemonRuntime;
use agent_relay_core::config::DaemonConfig;
use agent_relay_core::feature_flags::FeatureFlags;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Grace period for in-flight deliveries at shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Run the daemon until `cancel` fires.
///
/// This function:
/// 1. Runs the startup sequence (fails only if the IPC endpoint cannot be opened)
/// 2. Waits for cancellation signal
/// 3. Tears down and drains deliveries for up to [`SHUTDOWN_GRACE`]
pub async fn run(
    runtime: Arc<dyn DaemonRuntime>,
    config: DaemonConfig,
    flags: FeatureFlags,
    cancel: CancellationToken,
) -> Result<()> {
    let daemon = Daemon::start(runtime, config, flags, &cancel).await?;

    cancel.cancelled().await;
    info!("Cancellation signal received. Beginning shutdown...");

    graceful_shutdown(&daemon, SHUTDOWN_GRACE).await;

    info!("Daemon event loop shutdown complete");
    Ok(())
}
