//! Session registry for supervised agent processes.
//!
//! The registry maps a [`SessionKey`] (thread ID + thread chat ID) to the one
//! session currently allowed to run for it. It is the only state shared
//! between the message router and the per-session supervisors.
//!
//! ## Generations
//!
//! Every reservation gets a fresh generation number. Asynchronous work for a
//! session (the spawn, the supervisor noticing an exit) only mutates the entry
//! if the generation still matches, so a replaced or stopped session can never
//! evict or resurrect its successor.
//!
//! ## Thread safety
//!
//! The registry itself is not `Sync`. Callers share it as
//! [`SharedSessionRegistry`] and never hold the lock across an `.await`.

use crate::runtime::ProcessHandle;
use agent_relay_core::protocol::{AgentKind, SessionKey};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lifecycle state of a supervised session.
///
/// `Idle → Spawning → Running → Stopping → Terminated`; a failed spawn goes
/// straight from `Spawning` to `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Spawning,
    Running,
    Stopping,
    Terminated,
}

impl SessionState {
    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Spawning)
                | (Spawning, Running)
                | (Spawning, Stopping)
                | (Spawning, Terminated)
                | (Running, Stopping)
                | (Stopping, Terminated)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Spawning => "spawning",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// A single supervised session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub key: SessionKey,
    pub agent: AgentKind,
    pub generation: u64,
    pub state: SessionState,
    /// Set once the subprocess has been launched.
    pub process: Option<ProcessHandle>,
    pub spawned_at: Option<SystemTime>,
    /// Cancels the session's supervisor.
    pub cancel: CancellationToken,
}

impl SessionRecord {
    pub fn new(key: SessionKey, agent: AgentKind, generation: u64) -> Self {
        Self {
            key,
            agent,
            generation,
            state: SessionState::Idle,
            process: None,
            spawned_at: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Move to `next`, logging the transition. Invalid transitions are
    /// ignored and return `false`.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            debug!(
                session = %self.key,
                from = %self.state,
                to = %next,
                "Ignoring invalid session transition"
            );
            return false;
        }
        debug!(session = %self.key, from = %self.state, to = %next, "Session transition");
        self.state = next;
        true
    }
}

/// Registry mapping session keys to their live session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionKey, SessionRecord>,
    next_generation: u64,
}

impl SessionRegistry {
    /// Create a new, empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` for a new session in the `Spawning` state.
    ///
    /// Returns the new record (a clone, for the caller's launch task) and the
    /// session it displaced, if any. The caller must terminate the displaced
    /// session; it is no longer reachable through the registry.
    pub fn reserve(
        &mut self,
        key: SessionKey,
        agent: AgentKind,
    ) -> (SessionRecord, Option<SessionRecord>) {
        self.next_generation += 1;
        let mut record = SessionRecord::new(key.clone(), agent, self.next_generation);
        record.transition(SessionState::Spawning);
        let displaced = self.sessions.insert(key, record.clone());
        (record, displaced)
    }

    /// Record that the subprocess for generation `generation` is running.
    ///
    /// Returns `false` if the session was stopped or replaced while spawning.
    pub fn mark_running(&mut self, key: &SessionKey, generation: u64, process: ProcessHandle) -> bool {
        match self.sessions.get_mut(key) {
            Some(record) if record.generation == generation => {
                record.process = Some(process);
                record.spawned_at = Some(SystemTime::now());
                record.transition(SessionState::Running)
            }
            _ => false,
        }
    }

    /// Evict the session for `key`, whatever its generation.
    pub fn remove(&mut self, key: &SessionKey) -> Option<SessionRecord> {
        self.sessions.remove(key)
    }

    /// Evict the session for `key` only if it is still generation `generation`.
    pub fn remove_generation(&mut self, key: &SessionKey, generation: u64) -> Option<SessionRecord> {
        match self.sessions.get(key) {
            Some(record) if record.generation == generation => self.sessions.remove(key),
            _ => None,
        }
    }

    /// Evict every session, for shutdown.
    pub fn drain(&mut self) -> Vec<SessionRecord> {
        self.sessions.drain().map(|(_, record)| record).collect()
    }

    pub fn get(&self, key: &SessionKey) -> Option<&SessionRecord> {
        self.sessions.get(key)
    }

    /// Keys of all live sessions, sorted.
    pub fn keys(&self) -> Vec<SessionKey> {
        let mut keys: Vec<SessionKey> = self.sessions.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Shared, thread-safe session registry handle.
pub type SharedSessionRegistry = Arc<Mutex<SessionRegistry>>;

/// Create a new empty [`SharedSessionRegistry`].
pub fn new_session_registry() -> SharedSessionRegistry {
    Arc::new(Mutex::new(SessionRegistry::new()))
}

/// Lock the registry, recovering from poisoning.
pub fn lock_registry(registry: &SharedSessionRegistry) -> MutexGuard<'_, SessionRegistry> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}
