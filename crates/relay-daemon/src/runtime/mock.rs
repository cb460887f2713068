//! Mock runtime for testing
//!
//! Provides a fake [`DaemonRuntime`] that spawns no processes and opens no
//! sockets. It records every operation, lets tests play the part of a running
//! agent (emit stdout lines, exit), scripts HTTP responses, and injects spawn
//! failures.

use super::{
    DaemonRuntime, Frame, HttpResponse, ListenerHandle, ProcessEvent, ProcessEventSender,
    ProcessExit, ProcessHandle, ProcessSpec, RuntimeError,
};
use agent_relay_core::protocol::AuthToken;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// First PID handed out by the mock.
const FIRST_PID: u32 = 1000;

/// Call record for mock runtime operations
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Spawn { pid: u32, spec: ProcessSpec },
    Kill { pid: u32 },
    Listen { path: PathBuf },
    Post { url: String },
    ReadFile { path: PathBuf },
    WriteFile { path: PathBuf, contents: String },
    RemoveFile { path: PathBuf },
}

/// A delivery attempt seen by the mock.
#[derive(Debug, Clone)]
pub struct RecordedPost {
    pub url: String,
    pub token: String,
    pub body: serde_json::Value,
    /// Response the mock gave (`None` for an injected transport error).
    pub status: Option<u16>,
    pub at: Instant,
}

#[derive(Debug)]
struct MockProcess {
    spec: ProcessSpec,
    events: ProcessEventSender,
    killed: bool,
}

#[derive(Debug)]
enum ScriptedResponse {
    Status(u16),
    TransportError(String),
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<MockCall>,
    processes: HashMap<u32, MockProcess>,
    next_pid: u32,
    spawn_errors: VecDeque<String>,
    http_script: VecDeque<ScriptedResponse>,
    posts: Vec<RecordedPost>,
    files: HashMap<PathBuf, String>,
    frames: Option<mpsc::Sender<Frame>>,
    listen_error: Option<String>,
}

/// Mock runtime for testing without real processes, sockets, or HTTP
#[derive(Debug, Clone, Default)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get all recorded calls
    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    /// PIDs of every process spawned so far, in spawn order.
    pub fn spawned_pids(&self) -> Vec<u32> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::Spawn { pid, .. } => Some(*pid),
                _ => None,
            })
            .collect()
    }

    /// Spec a process was spawned with.
    pub fn spec_of(&self, pid: u32) -> Option<ProcessSpec> {
        self.state().processes.get(&pid).map(|p| p.spec.clone())
    }

    /// PIDs whose process group has been killed, in kill order.
    pub fn killed_pids(&self) -> Vec<u32> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::Kill { pid } => Some(*pid),
                _ => None,
            })
            .collect()
    }

    pub fn is_killed(&self, pid: u32) -> bool {
        self.state().processes.get(&pid).is_some_and(|p| p.killed)
    }

    /// Make the next spawn fail with this message (queued, one per call).
    pub fn fail_next_spawn(&self, message: impl Into<String>) {
        self.state().spawn_errors.push_back(message.into());
    }

    /// Make the next `listen_on_channel` fail.
    pub fn fail_listen(&self, message: impl Into<String>) {
        self.state().listen_error = Some(message.into());
    }

    /// Queue an HTTP status for the next post. Unscripted posts get 200.
    pub fn push_http_status(&self, status: u16) {
        self.state()
            .http_script
            .push_back(ScriptedResponse::Status(status));
    }

    /// Queue a transport failure for the next post.
    pub fn push_http_error(&self, message: impl Into<String>) {
        self.state()
            .http_script
            .push_back(ScriptedResponse::TransportError(message.into()));
    }

    /// Every delivery attempt, including failed ones.
    pub fn posts(&self) -> Vec<RecordedPost> {
        self.state().posts.clone()
    }

    /// Bodies of posts that succeeded.
    pub fn delivered_bodies(&self) -> Vec<serde_json::Value> {
        self.state()
            .posts
            .iter()
            .filter(|p| p.status.is_some_and(|s| (200..300).contains(&s)))
            .map(|p| p.body.clone())
            .collect()
    }

    /// Seed a file for `read_file`.
    pub fn set_file(&self, path: impl Into<PathBuf>, contents: impl Into<String>) {
        self.state().files.insert(path.into(), contents.into());
    }

    pub fn file(&self, path: &Path) -> Option<String> {
        self.state().files.get(path).cloned()
    }

    /// Simulate one stdout line from a spawned process.
    pub async fn emit_line(&self, pid: u32, line: &str) -> bool {
        let sender = self.state().processes.get(&pid).map(|p| p.events.clone());
        match sender {
            Some(tx) => tx.send(ProcessEvent::Stdout(line.to_string())).await.is_ok(),
            None => false,
        }
    }

    /// Simulate a process exiting on its own.
    pub async fn exit_process(&self, pid: u32, exit: ProcessExit) -> bool {
        let sender = self.state().processes.get(&pid).map(|p| p.events.clone());
        match sender {
            Some(tx) => tx.send(ProcessEvent::Exited(exit)).await.is_ok(),
            None => false,
        }
    }

    /// Deliver a raw frame as if a client wrote it to the socket.
    pub async fn send_frame(&self, frame: impl Into<Frame>) -> bool {
        let sender = self.state().frames.clone();
        match sender {
            Some(tx) => tx.send(frame.into()).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl DaemonRuntime for MockRuntime {
    async fn spawn_process(
        &self,
        spec: &ProcessSpec,
        events: ProcessEventSender,
    ) -> Result<ProcessHandle, RuntimeError> {
        let mut state = self.state();

        // Check for injected error
        if let Some(message) = state.spawn_errors.pop_front() {
            return Err(RuntimeError::Spawn {
                program: spec.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, message),
            });
        }

        let pid = FIRST_PID + state.next_pid;
        state.next_pid += 1;
        state.calls.push(MockCall::Spawn {
            pid,
            spec: spec.clone(),
        });
        state.processes.insert(
            pid,
            MockProcess {
                spec: spec.clone(),
                events,
                killed: false,
            },
        );

        debug!(pid, program = %spec.program, "Mock runtime spawned process");
        Ok(ProcessHandle { pid })
    }

    fn kill_process_group(&self, handle: &ProcessHandle) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(MockCall::Kill { pid: handle.pid });

        if let Some(process) = state.processes.get_mut(&handle.pid)
            && !process.killed
        {
            process.killed = true;
            // A killed process reports its exit like a real one would.
            let _ = process.events.try_send(ProcessEvent::Exited(ProcessExit {
                code: None,
                signal: Some(9),
                stderr_tail: Vec::new(),
            }));
        }
        Ok(())
    }

    async fn listen_on_channel(
        &self,
        path: &Path,
        frames: mpsc::Sender<Frame>,
        cancel: CancellationToken,
    ) -> Result<ListenerHandle, RuntimeError> {
        let mut state = self.state();
        if let Some(message) = state.listen_error.take() {
            return Err(RuntimeError::Listen {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::AddrInUse, message),
            });
        }
        state.calls.push(MockCall::Listen {
            path: path.to_path_buf(),
        });
        state.frames = Some(frames);
        Ok(ListenerHandle::new(path.to_path_buf(), cancel.child_token()))
    }

    async fn post_json(
        &self,
        url: &str,
        token: &AuthToken,
        body: &serde_json::Value,
    ) -> Result<HttpResponse, RuntimeError> {
        let mut state = self.state();
        state.calls.push(MockCall::Post {
            url: url.to_string(),
        });

        let scripted = state
            .http_script
            .pop_front()
            .unwrap_or(ScriptedResponse::Status(200));
        let (result, status) = match scripted {
            ScriptedResponse::Status(status) => (
                Ok(HttpResponse {
                    status,
                    body: String::new(),
                }),
                Some(status),
            ),
            ScriptedResponse::TransportError(message) => (
                Err(RuntimeError::Http {
                    url: url.to_string(),
                    message,
                }),
                None,
            ),
        };

        state.posts.push(RecordedPost {
            url: url.to_string(),
            token: token.expose().to_string(),
            body: body.clone(),
            status,
            at: Instant::now(),
        });
        result
    }

    async fn read_file(&self, path: &Path) -> Result<String, RuntimeError> {
        let mut state = self.state();
        state.calls.push(MockCall::ReadFile {
            path: path.to_path_buf(),
        });
        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| RuntimeError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
    }

    async fn write_file(&self, path: &Path, contents: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(MockCall::WriteFile {
            path: path.to_path_buf(),
            contents: contents.to_string(),
        });
        state.files.insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(MockCall::RemoveFile {
            path: path.to_path_buf(),
        });
        state.files.remove(path);
        Ok(())
    }
}
