//! Runtime seam between the daemon's orchestration logic and the OS.
//!
//! Everything with a side effect outside the process (spawning agents,
//! signalling process groups, the IPC socket, outbound HTTP, file I/O) goes
//! through [`DaemonRuntime`]. The daemon holds it as `Arc<dyn DaemonRuntime>`
//! so tests can substitute [`MockRuntime`] and drive sessions without real
//! subprocesses or sockets.
//!
//! ## Components
//!
//! - `process.rs`: tokio-backed implementation ([`TokioRuntime`])
//! - `mock.rs`: recording fake for tests ([`MockRuntime`])

pub mod mock;
pub mod process;

pub use mock::{MockCall, MockRuntime, RecordedPost};
pub use process::TokioRuntime;

use agent_relay_core::protocol::AuthToken;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Header carrying the session's auth token on every delivery.
pub const DAEMON_TOKEN_HEADER: &str = "X-Daemon-Token";

/// One raw inbound frame from the IPC channel, newline stripped.
pub type Frame = Vec<u8>;

/// Sender half for a spawned process's output.
pub type ProcessEventSender = mpsc::Sender<ProcessEvent>;

/// Capacity of each session's process event channel.
pub const PROCESS_EVENT_CAPACITY: usize = 1024;

/// Errors surfaced by runtime operations. None of these are process-fatal on
/// their own; callers decide.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal process group {pid}: {source}")]
    Kill {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to listen on {path}: {source}")]
    Listen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP request to {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

/// Description of an agent subprocess to launch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment variables layered over the daemon's own.
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Command line for logs. Long arguments (prompts) are elided.
    pub fn display_command_line(&self) -> String {
        const MAX_ARG_CHARS: usize = 60;
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            let shown: String = if arg.chars().count() > MAX_ARG_CHARS {
                let head: String = arg.chars().take(MAX_ARG_CHARS).collect();
                format!("{head}…")
            } else {
                arg.clone()
            };
            if shown.contains(char::is_whitespace) || shown.is_empty() {
                line.push_str(&format!("{shown:?}"));
            } else {
                line.push_str(&shown);
            }
        }
        line
    }
}

/// Handle to a launched subprocess. The PID is also its process-group ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    pub pid: u32,
}

/// How a subprocess ended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Last lines the process wrote to stderr.
    pub stderr_tail: Vec<String>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(signal)) => format!("signal {signal}"),
            (None, None) => "unknown status".to_string(),
        }
    }
}

/// Output from a supervised subprocess, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One line of standard output, newline stripped.
    Stdout(String),
    /// The process has exited and its stdout is fully drained.
    Exited(ProcessExit),
}

/// Status and body of an outbound HTTP call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Handle to the listening IPC endpoint.
///
/// Closing (or dropping) the handle stops the accept loop and removes the
/// socket file from disk. Closing twice is harmless.
#[derive(Debug)]
pub struct ListenerHandle {
    socket_path: PathBuf,
    cancel: CancellationToken,
    closed: bool,
}

impl ListenerHandle {
    pub fn new(socket_path: PathBuf, cancel: CancellationToken) -> Self {
        Self {
            socket_path,
            cancel,
            closed: false,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancel.cancel();
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(path = %self.socket_path.display(), error = %e, "Failed to remove socket file");
            } else {
                debug!(path = %self.socket_path.display(), "Removed socket file");
            }
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// OS and network primitives the daemon depends on.
#[async_trait::async_trait]
pub trait DaemonRuntime: Send + Sync + 'static {
    /// Launch `spec` in its own process group.
    ///
    /// Each stdout line is sent to `events` as [`ProcessEvent::Stdout`],
    /// followed by exactly one [`ProcessEvent::Exited`] once the process has
    /// ended and its output is drained.
    async fn spawn_process(
        &self,
        spec: &ProcessSpec,
        events: ProcessEventSender,
    ) -> Result<ProcessHandle, RuntimeError>;

    /// Terminate the process and every descendant in its group. Signalling a
    /// group that no longer exists is not an error.
    fn kill_process_group(&self, handle: &ProcessHandle) -> Result<(), RuntimeError>;

    /// Open the IPC endpoint at `path` and forward every complete inbound
    /// frame to `frames` until `cancel` fires or the handle is closed.
    async fn listen_on_channel(
        &self,
        path: &Path,
        frames: mpsc::Sender<Frame>,
        cancel: CancellationToken,
    ) -> Result<ListenerHandle, RuntimeError>;

    /// POST `body` as JSON to `url`, authenticated with `token`.
    async fn post_json(
        &self,
        url: &str,
        token: &AuthToken,
        body: &serde_json::Value,
    ) -> Result<HttpResponse, RuntimeError>;

    async fn read_file(&self, path: &Path) -> Result<String, RuntimeError>;

    async fn write_file(&self, path: &Path, contents: &str) -> Result<(), RuntimeError>;

    async fn remove_file(&self, path: &Path) -> Result<(), RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_command_line_quotes_and_elides() {
        let spec = ProcessSpec::new("claude")
            .arg("-p")
            .arg("fix the build")
            .arg("x".repeat(100));
        let line = spec.display_command_line();
        assert!(line.starts_with("claude -p \"fix the build\" "));
        assert!(line.ends_with('…'));
        assert!(line.len() < 120);
    }

    #[test]
    fn test_process_exit_describe() {
        let ok = ProcessExit {
            code: Some(0),
            ..Default::default()
        };
        assert!(ok.success());
        assert_eq!(ok.describe(), "exit code 0");

        let killed = ProcessExit {
            code: None,
            signal: Some(9),
            stderr_tail: vec![],
        };
        assert!(!killed.success());
        assert_eq!(killed.describe(), "signal 9");
        assert_eq!(ProcessExit::default().describe(), "unknown status");
    }

    #[test]
    fn test_http_response_success_range() {
        let resp = |status| HttpResponse {
            status,
            body: String::new(),
        };
        assert!(resp(200).is_success());
        assert!(resp(204).is_success());
        assert!(!resp(302).is_success());
        assert!(!resp(500).is_success());
    }

    #[test]
    fn test_listener_handle_close_removes_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.sock");
        std::fs::write(&path, "").unwrap();
        let cancel = CancellationToken::new();
        let mut handle = ListenerHandle::new(path.clone(), cancel.clone());
        handle.close();
        assert!(!path.exists());
        assert!(cancel.is_cancelled());
        handle.close();
    }
}
