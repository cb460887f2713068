//! Agent relay daemon
//!
//! Accepts start/stop commands on a Unix socket, runs one coding-agent
//! subprocess per conversation, batches each agent's JSON output and posts
//! the batches to the remote API.
//!
//! - [`runtime`]: the OS seam ([`runtime::DaemonRuntime`]) with a tokio
//!   implementation and a recording mock
//! - [`daemon`]: registry, router, supervisors, delivery, heartbeat and the
//!   startup/teardown sequence

pub mod daemon;
pub mod runtime;
