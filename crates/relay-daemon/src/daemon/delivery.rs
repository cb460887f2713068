//! Delivery of output batches to the remote API.
//!
//! Every batch handed to [`DeliveryQueue::submit`] gets its own tracked task,
//! so a batch stuck in backoff never holds up later batches from the same or
//! any other session. Failed posts are retried with exponential backoff and
//! jitter; once `max_attempts` is used up the batch is logged and dropped.

use super::batcher::OutputBatch;
use crate::runtime::{DaemonRuntime, RuntimeError};
use agent_relay_core::protocol::AuthToken;
use agent_relay_core::retry::{RetryConfig, RetryDecision, RetryState};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Why a single delivery attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Transport(#[from] RuntimeError),

    #[error("remote API answered {status}: {body}")]
    Status { status: u16, body: String },
}

/// Final result for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    Dropped { attempts: u32 },
}

/// Counters across all batches since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub dropped: u64,
    /// Failed attempts that were followed by another try.
    pub retries: u64,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    retries: AtomicU64,
}

/// Posts batches to `{api}/api/daemon-event`, one task per batch.
#[derive(Clone)]
pub struct DeliveryQueue {
    runtime: Arc<dyn DaemonRuntime>,
    url: Arc<str>,
    retry: RetryConfig,
    tracker: TaskTracker,
    counters: Arc<Counters>,
}

impl DeliveryQueue {
    pub fn new(runtime: Arc<dyn DaemonRuntime>, url: impl Into<String>, retry: RetryConfig) -> Self {
        let url: String = url.into();
        Self {
            runtime,
            url: Arc::from(url),
            retry,
            tracker: TaskTracker::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Hand a batch off for delivery. Never blocks.
    pub fn submit(&self, batch: OutputBatch) {
        debug!(
            session = %batch.key,
            seq = batch.seq,
            messages = batch.messages.len(),
            "Queued batch for delivery"
        );
        let queue = self.clone();
        self.tracker.spawn(async move {
            queue.deliver(batch).await;
        });
    }

    /// Deliver one batch, retrying until it succeeds or attempts run out.
    pub async fn deliver(&self, batch: OutputBatch) -> DeliveryOutcome {
        let body = batch.to_payload();
        let mut retry = RetryState::new(self.retry);

        loop {
            let attempt = retry.begin_attempt();
            let error = match self.attempt(&batch.token, &body).await {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    if attempt > 1 {
                        info!(
                            session = %batch.key,
                            seq = batch.seq,
                            attempts = attempt,
                            "Batch delivered after retry"
                        );
                    } else {
                        debug!(
                            session = %batch.key,
                            seq = batch.seq,
                            messages = batch.messages.len(),
                            "Batch delivered"
                        );
                    }
                    return DeliveryOutcome::Delivered { attempts: attempt };
                }
                Err(e) => e,
            };

            let decision = retry.record_failure(Instant::now().into_std(), &mut rand::thread_rng());
            match decision {
                RetryDecision::RetryAfter(delay) => {
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        session = %batch.key,
                        seq = batch.seq,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Batch delivery failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    error!(
                        session = %batch.key,
                        seq = batch.seq,
                        messages = batch.messages.len(),
                        attempts = attempt,
                        error = %error,
                        "Dropping batch after exhausting delivery attempts"
                    );
                    return DeliveryOutcome::Dropped { attempts: attempt };
                }
            }
        }
    }

    async fn attempt(&self, token: &AuthToken, body: &serde_json::Value) -> Result<(), DeliveryError> {
        let response = self.runtime.post_json(&self.url, token, body).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Status {
                status: response.status,
                body: response.body,
            })
        }
    }

    /// Wait up to `grace` for in-flight deliveries. Returns `true` if all
    /// finished. The queue keeps accepting batches afterwards.
    pub async fn drain(&self, grace: Duration) -> bool {
        let pending = self.tracker.len();
        if pending == 0 {
            return true;
        }
        info!(pending, grace_ms = grace.as_millis() as u64, "Draining in-flight deliveries");
        self.tracker.close();
        let finished = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        self.tracker.reopen();
        if !finished {
            warn!(pending = self.tracker.len(), "Deliveries still in flight after grace period");
        }
        finished
    }

    /// Deliveries currently running or waiting to retry.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
        }
    }
}
