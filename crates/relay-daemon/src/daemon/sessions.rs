//! Start and stop of supervised sessions.
//!
//! Registry mutations happen synchronously inside [`SessionManager::start`]
//! and [`SessionManager::stop`], in the order commands arrive. Only the spawn
//! itself and the supervision that follows run on spawned tasks. Two commands
//! for the same key therefore always take effect in order, and a stop that
//! lands while the spawn is still in flight is honoured once the process
//! handle appears.

use super::agent_command::{AgentCommandContext, build_agent_command};
use super::batcher::BatchTiming;
use super::delivery::DeliveryQueue;
use super::session_registry::{
    SessionRecord, SessionState, SharedSessionRegistry, lock_registry, new_session_registry,
};
use super::supervisor::Supervisor;
use crate::runtime::{DaemonRuntime, PROCESS_EVENT_CAPACITY, ProcessSpec};
use agent_relay_core::protocol::{SessionKey, StartAgent, StopAgent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Result of a stop command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// No session existed for the key.
    NotFound,
}

/// Owns the session registry and every session task.
#[derive(Clone)]
pub struct SessionManager {
    runtime: Arc<dyn DaemonRuntime>,
    registry: SharedSessionRegistry,
    command_ctx: Arc<AgentCommandContext>,
    timing: BatchTiming,
    delivery: DeliveryQueue,
    tasks: TaskTracker,
}

impl SessionManager {
    pub fn new(
        runtime: Arc<dyn DaemonRuntime>,
        command_ctx: AgentCommandContext,
        timing: BatchTiming,
        delivery: DeliveryQueue,
    ) -> Self {
        Self {
            runtime,
            registry: new_session_registry(),
            command_ctx: Arc::new(command_ctx),
            timing,
            delivery,
            tasks: TaskTracker::new(),
        }
    }

    pub fn registry(&self) -> &SharedSessionRegistry {
        &self.registry
    }

    /// Begin a session for `request`, replacing any session on the same key.
    pub fn start(&self, request: StartAgent) -> SessionKey {
        let key = request.key();
        let spec = build_agent_command(&request, &self.command_ctx);

        let (record, displaced) = lock_registry(&self.registry).reserve(key.clone(), request.agent);
        if let Some(old) = displaced {
            info!(session = %key, "Replacing existing session");
            self.terminate(old);
        }

        info!(
            session = %key,
            agent = %request.agent,
            agent_version = request.agent_version,
            command = %spec.display_command_line(),
            "Spawning agent"
        );

        let manager = self.clone();
        self.tasks.spawn(async move {
            manager.launch(request, record, spec).await;
        });
        key
    }

    async fn launch(&self, request: StartAgent, record: SessionRecord, spec: ProcessSpec) {
        let key = record.key.clone();
        let (tx, rx) = mpsc::channel(PROCESS_EVENT_CAPACITY);

        let process = match self.runtime.spawn_process(&spec, tx).await {
            Ok(process) => process,
            Err(e) => {
                error!(session = %key, agent = %request.agent, error = %e, "Failed to spawn agent");
                if let Some(mut failed) =
                    lock_registry(&self.registry).remove_generation(&key, record.generation)
                {
                    failed.transition(SessionState::Terminated);
                }
                return;
            }
        };

        if !lock_registry(&self.registry).mark_running(&key, record.generation, process) {
            warn!(
                session = %key,
                pid = process.pid,
                "Session was stopped while spawning; killing new process"
            );
            if let Err(e) = self.runtime.kill_process_group(&process) {
                error!(session = %key, pid = process.pid, error = %e, "Failed to kill process group");
            }
            return;
        }
        info!(session = %key, pid = process.pid, agent = %request.agent, "Agent process started");

        let supervisor = Supervisor {
            key,
            generation: record.generation,
            agent: request.agent,
            process,
            token: request.token,
            cancel: record.cancel,
            timing: self.timing,
            registry: self.registry.clone(),
            runtime: self.runtime.clone(),
            delivery: self.delivery.clone(),
        };
        supervisor.run(rx).await;
    }

    /// Stop the session for `request`'s key. Stopping an unknown key is a
    /// logged no-op.
    pub fn stop(&self, request: &StopAgent) -> StopOutcome {
        let key = request.key();
        let removed = lock_registry(&self.registry).remove(&key);
        match removed {
            Some(record) => {
                info!(session = %key, "Stopping session");
                self.terminate(record);
                StopOutcome::Stopped
            }
            None => {
                info!(session = %key, "No session to stop");
                StopOutcome::NotFound
            }
        }
    }

    /// Terminate every live session. Returns how many there were.
    pub fn terminate_all(&self) -> usize {
        let records = lock_registry(&self.registry).drain();
        let count = records.len();
        for record in records {
            self.terminate(record);
        }
        count
    }

    /// Cancel the supervisor and kill the process group of an evicted record.
    fn terminate(&self, mut record: SessionRecord) {
        record.transition(SessionState::Stopping);
        record.cancel.cancel();
        if let Some(process) = record.process {
            match self.runtime.kill_process_group(&process) {
                Ok(()) => info!(session = %record.key, pid = process.pid, "Killed agent process group"),
                Err(e) => error!(
                    session = %record.key,
                    pid = process.pid,
                    error = %e,
                    "Failed to kill process group"
                ),
            }
        }
        record.transition(SessionState::Terminated);
    }

    /// Wait up to `grace` for session tasks (spawns and supervisors) to end.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        self.tasks.close();
        let finished = tokio::time::timeout(grace, self.tasks.wait()).await.is_ok();
        self.tasks.reopen();
        finished
    }

    pub fn len(&self) -> usize {
        lock_registry(&self.registry).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<SessionKey> {
        lock_registry(&self.registry).keys()
    }

    /// State and PID of the session for `key`, if one is live.
    pub fn snapshot(&self, key: &SessionKey) -> Option<(SessionState, Option<u32>)> {
        lock_registry(&self.registry)
            .get(key)
            .map(|r| (r.state, r.process.map(|p| p.pid)))
    }
}
