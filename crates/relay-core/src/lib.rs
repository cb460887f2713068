//! Core types for agent-relay
//!
//! This crate holds the pieces of the agent relay daemon that do not touch
//! processes, sockets, or the network:
//! - The command envelope accepted on the IPC channel ([`protocol`])
//! - Daemon configuration and its environment variable names ([`config`])
//! - The process-wide feature flag map ([`feature_flags`])
//! - Exponential backoff with jitter for output delivery ([`retry`])
//! - Text/JSON logging initialisation ([`logging`])

pub mod config;
pub mod feature_flags;
pub mod logging;
pub mod protocol;
pub mod retry;

pub use config::{ConfigError, DaemonConfig, LogFormat};
pub use feature_flags::FeatureFlags;
pub use protocol::{AgentKind, Command, ProtocolError, SessionKey, StartAgent, StopAgent};
pub use retry::{RetryConfig, RetryState};
