//! Graceful shutdown coordination

use super::orchestrator::Daemon;
use std::time::Duration;
use tracing::{info, warn};

/// Tear the daemon down, then give in-flight work a bounded grace period.
///
/// Teardown itself never fails. Deliveries still retrying when `grace` runs
/// out are abandoned and reported in the summary.
pub async fn graceful_shutdown(daemon: &Daemon, grace: Duration) {
    info!(grace_ms = grace.as_millis() as u64, "Beginning graceful shutdown");

    daemon.teardown().await;

    let drained = daemon.drain_deliveries(grace).await;
    if !drained {
        warn!(
            grace_ms = grace.as_millis() as u64,
            "Some deliveries did not finish before the grace period ended"
        );
    }

    let stats = daemon.delivery_stats();
    info!(
        delivered = stats.delivered,
        dropped = stats.dropped,
        retries = stats.retries,
        "Graceful shutdown complete"
    );
}
