//! Per-session supervisor task.
//!
//! One supervisor runs for every session that reached `Running`. It owns the
//! session's [`OutputBatcher`], turns the process's stdout into batches, and
//! notices when the process exits. It ends when:
//!
//! - the session's cancel token fires (stop command, replacement, shutdown):
//!   lines already received are flushed and the task returns
//! - the process exits on its own: remaining lines are flushed (with a
//!   diagnostic line for an abnormal exit), the process group is killed to
//!   reap stragglers, and the session is evicted

use super::batcher::{BatchTiming, FlushTrigger, OutputBatcher};
use super::delivery::DeliveryQueue;
use super::session_registry::{SessionState, SharedSessionRegistry, lock_registry};
use crate::runtime::{DaemonRuntime, ProcessEvent, ProcessExit, ProcessHandle};
use agent_relay_core::protocol::{AgentKind, AuthToken, SessionKey};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a supervisor returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    Cancelled,
    ProcessExited(ProcessExit),
}

/// Everything a supervisor needs for one session.
pub struct Supervisor {
    pub key: SessionKey,
    pub generation: u64,
    pub agent: AgentKind,
    pub process: ProcessHandle,
    pub token: AuthToken,
    pub cancel: CancellationToken,
    pub timing: BatchTiming,
    pub registry: SharedSessionRegistry,
    pub runtime: Arc<dyn DaemonRuntime>,
    pub delivery: DeliveryQueue,
}

impl Supervisor {
    /// Supervise until the session is cancelled or the process exits.
    pub async fn run(self, mut events: mpsc::Receiver<ProcessEvent>) -> SupervisorExit {
        let mut batcher = OutputBatcher::new(self.key.clone(), self.token.clone(), self.timing);
        debug!(session = %self.key, pid = self.process.pid, "Supervisor started");

        let exit = loop {
            let deadline = batcher.next_deadline();
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    // Keep whatever the process already wrote.
                    while let Ok(event) = events.try_recv() {
                        if let ProcessEvent::Stdout(line) = event {
                            batcher.push_line(&line, Instant::now());
                        }
                    }
                    self.flush(&mut batcher, FlushTrigger::Final);
                    break SupervisorExit::Cancelled;
                }

                event = events.recv() => match event {
                    Some(ProcessEvent::Stdout(line)) => {
                        let now = Instant::now();
                        batcher.push_line(&line, now);
                        if let Some(trigger) = batcher.due(now) {
                            self.flush(&mut batcher, trigger);
                        }
                    }
                    Some(ProcessEvent::Exited(exit)) => {
                        break self.on_exit(&mut batcher, exit);
                    }
                    None => {
                        warn!(session = %self.key, pid = self.process.pid, "Process output closed without an exit status");
                        break self.on_exit(&mut batcher, ProcessExit::default());
                    }
                },

                _ = wait_until(deadline) => {
                    if let Some(trigger) = batcher.due(Instant::now()) {
                        self.flush(&mut batcher, trigger);
                    }
                }
            }
        };

        debug!(
            session = %self.key,
            batches = batcher.batches(),
            skipped = batcher.skipped(),
            "Supervisor finished"
        );
        exit
    }

    fn on_exit(&self, batcher: &mut OutputBatcher, exit: ProcessExit) -> SupervisorExit {
        if self.cancel.is_cancelled() {
            // Stopped by the daemon; the exit is the kill we issued.
            self.flush(batcher, FlushTrigger::Final);
            return SupervisorExit::Cancelled;
        }

        if exit.success() {
            info!(session = %self.key, pid = self.process.pid, agent = %self.agent, "Agent process exited");
        } else {
            warn!(
                session = %self.key,
                pid = self.process.pid,
                agent = %self.agent,
                status = %exit.describe(),
                stderr = %exit.stderr_tail.join(" | "),
                "Agent process exited abnormally"
            );
            batcher.push_exit_error(self.agent, &exit, Instant::now());
        }
        self.flush(batcher, FlushTrigger::Final);

        let evicted = lock_registry(&self.registry).remove_generation(&self.key, self.generation);
        if let Some(mut record) = evicted {
            record.transition(SessionState::Stopping);
            if let Err(e) = self.runtime.kill_process_group(&self.process) {
                debug!(session = %self.key, error = %e, "Failed to reap process group after exit");
            }
            record.transition(SessionState::Terminated);
            info!(session = %self.key, "Session terminated");
        }
        SupervisorExit::ProcessExited(exit)
    }

    fn flush(&self, batcher: &mut OutputBatcher, trigger: FlushTrigger) {
        if let Some(batch) = batcher.take_batch() {
            debug!(
                session = %self.key,
                seq = batch.seq,
                messages = batch.messages.len(),
                trigger = trigger.as_str(),
                "Flushing output batch"
            );
            self.delivery.submit(batch);
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
