//! Per-session output batching.
//!
//! An [`OutputBatcher`] buffers the JSON lines one agent writes to stdout and
//! decides when they should leave as an [`OutputBatch`]. Two deadlines drive
//! a flush:
//!
//! - **idle**: `handle_delay` after the most recent line, so a burst of
//!   lines coalesces into one batch
//! - **ceiling**: `flush_delay` after the first line of the current buffer,
//!   so continuous output still makes progress
//!
//! The batcher never reads the clock itself. Callers pass `now` in, which
//! keeps flush timing testable under tokio's paused clock.

use crate::runtime::ProcessExit;
use agent_relay_core::protocol::{AgentKind, AuthToken, SessionKey};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Why a batch left the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Idle,
    Ceiling,
    /// The session stopped or its process exited.
    Final,
}

impl FlushTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Ceiling => "ceiling",
            Self::Final => "final",
        }
    }
}

/// Flush timing shared by every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchTiming {
    pub handle_delay: Duration,
    pub flush_delay: Duration,
}

/// One session's lines between two flushes, ready for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputBatch {
    pub key: SessionKey,
    pub token: AuthToken,
    /// 1-based position of this batch within its session.
    pub seq: u64,
    pub messages: Vec<Value>,
}

impl OutputBatch {
    /// Request body posted to the remote API.
    pub fn to_payload(&self) -> Value {
        json!({
            "threadId": self.key.thread_id,
            "threadChatId": self.key.thread_chat_id,
            "messages": self.messages,
        })
    }
}

/// Buffer and flush deadlines for one session.
#[derive(Debug)]
pub struct OutputBatcher {
    key: SessionKey,
    token: AuthToken,
    timing: BatchTiming,
    buffer: Vec<Value>,
    idle_deadline: Option<Instant>,
    ceiling_deadline: Option<Instant>,
    seq: u64,
    skipped: u64,
}

impl OutputBatcher {
    pub fn new(key: SessionKey, token: AuthToken, timing: BatchTiming) -> Self {
        Self {
            key,
            token,
            timing,
            buffer: Vec::new(),
            idle_deadline: None,
            ceiling_deadline: None,
            seq: 0,
            skipped: 0,
        }
    }

    /// Parse and buffer one stdout line received at `now`.
    ///
    /// Blank lines are ignored. Lines that are not JSON are logged and
    /// skipped. Returns whether the line was buffered.
    pub fn push_line(&mut self, line: &str, now: Instant) -> bool {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return false;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => {
                self.push_value(value, now);
                true
            }
            Err(e) => {
                self.skipped += 1;
                warn!(
                    session = %self.key,
                    error = %e,
                    line = %truncate(trimmed, 200),
                    "Skipping non-JSON agent output line"
                );
                false
            }
        }
    }

    fn push_value(&mut self, value: Value, now: Instant) {
        if self.buffer.is_empty() {
            self.ceiling_deadline = Some(now + self.timing.flush_delay);
        }
        self.buffer.push(value);
        self.idle_deadline = Some(now + self.timing.handle_delay);
    }

    /// Append the diagnostic line reported when an agent exits abnormally.
    pub fn push_exit_error(&mut self, agent: AgentKind, exit: &ProcessExit, now: Instant) {
        let line = json!({
            "type": "daemon-error",
            "error": format!("{agent} exited with {}", exit.describe()),
            "exitCode": exit.code,
            "stderr": exit.stderr_tail.join("\n"),
        });
        self.push_value(line, now);
    }

    /// Earliest pending flush deadline, if anything is buffered.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.idle_deadline, self.ceiling_deadline) {
            (Some(idle), Some(ceiling)) => Some(idle.min(ceiling)),
            (idle, ceiling) => idle.or(ceiling),
        }
    }

    /// Which trigger, if any, has fired by `now`.
    pub fn due(&self, now: Instant) -> Option<FlushTrigger> {
        if self.buffer.is_empty() {
            return None;
        }
        if self.ceiling_deadline.is_some_and(|d| d <= now) {
            return Some(FlushTrigger::Ceiling);
        }
        if self.idle_deadline.is_some_and(|d| d <= now) {
            return Some(FlushTrigger::Idle);
        }
        None
    }

    /// Swap the buffer for an empty one and wrap its lines as a batch.
    pub fn take_batch(&mut self) -> Option<OutputBatch> {
        self.idle_deadline = None;
        self.ceiling_deadline = None;
        if self.buffer.is_empty() {
            return None;
        }
        self.seq += 1;
        Some(OutputBatch {
            key: self.key.clone(),
            token: self.token.clone(),
            seq: self.seq,
            messages: std::mem::take(&mut self.buffer),
        })
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Batches handed off so far.
    pub fn batches(&self) -> u64 {
        self.seq
    }

    /// Non-JSON lines dropped so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars).collect();
        format!("{head}…")
    }
}
