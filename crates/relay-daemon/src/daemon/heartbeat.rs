//! Periodic liveness log.

use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Uptime as seconds with millisecond precision, e.g. `"61.250s"`.
pub fn format_uptime(uptime: Duration) -> String {
    format!("{:.3}s", uptime.as_secs_f64())
}

/// Log a heartbeat every `period` until cancelled. The first beat comes one
/// full period after the call. Returns the number of beats logged.
pub async fn heartbeat_loop(started_at: Instant, period: Duration, cancel: CancellationToken) -> u64 {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut beats = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(beats, "Heartbeat stopped");
                break;
            }
            _ = ticker.tick() => {
                beats += 1;
                info!(uptime = %format_uptime(started_at.elapsed()), "heartbeat");
            }
        }
    }

    beats
}
