//! Tokio-backed [`DaemonRuntime`]: real subprocesses, a Unix domain socket,
//! and reqwest for outbound HTTP.
//!
//! ## Platform availability
//!
//! Process groups and the socket listener are Unix-only. On other platforms
//! those operations return [`RuntimeError::Unsupported`].

use super::{
    DAEMON_TOKEN_HEADER, DaemonRuntime, Frame, HttpResponse, ListenerHandle, ProcessEvent,
    ProcessEventSender, ProcessExit, ProcessHandle, ProcessSpec, RuntimeError,
};
use agent_relay_core::protocol::{AuthToken, MAX_FRAME_BYTES};
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lines of stderr kept for exit diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// How long output readers get to finish once the agent has exited.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Per-request timeout for deliveries.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Production runtime.
#[derive(Debug, Clone)]
pub struct TokioRuntime {
    http: reqwest::Client,
}

impl TokioRuntime {
    pub fn new() -> Result<Self, RuntimeError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("agent-relay-daemon/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RuntimeError::Http {
                url: String::new(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http })
    }
}

#[async_trait::async_trait]
impl DaemonRuntime for TokioRuntime {
    async fn spawn_process(
        &self,
        spec: &ProcessSpec,
        events: ProcessEventSender,
    ) -> Result<ProcessHandle, RuntimeError> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let spawn_err = |source| RuntimeError::Spawn {
            program: spec.program.clone(),
            source,
        };

        let mut child = cmd.spawn().map_err(spawn_err)?;
        let pid = child.id().ok_or_else(|| {
            spawn_err(std::io::Error::other("process exited before its pid was read"))
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        let stderr_task = stderr.map(|stderr| {
            let tail = Arc::clone(&stderr_tail);
            tokio::spawn(collect_stderr_tail(stderr, tail))
        });

        let stdout_task = stdout.map(|stdout| {
            let events = events.clone();
            tokio::spawn(async move { forward_stdout(pid, stdout, &events).await })
        });

        tokio::spawn(async move {
            // Background descendants can hold the pipes open after the agent
            // itself has exited, so the exit is reported on the child's wait,
            // not on EOF.
            let mut exit = match child.wait().await {
                Ok(status) => exit_from_status(status),
                Err(e) => {
                    error!(pid, error = %e, "Failed to wait for agent process");
                    ProcessExit::default()
                }
            };

            if let Some(mut task) = stdout_task
                && tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut task).await.is_err()
            {
                debug!(pid, "Agent stdout still open after exit; reporting exit");
            }
            if let Some(mut task) = stderr_task
                && tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut task).await.is_err()
            {
                debug!(pid, "Agent stderr still open after exit");
            }
            exit.stderr_tail = stderr_tail
                .lock()
                .map(|tail| tail.iter().cloned().collect())
                .unwrap_or_default();

            debug!(pid, status = %exit.describe(), "Agent process reaped");
            let _ = events.send(ProcessEvent::Exited(exit)).await;
        });

        Ok(ProcessHandle { pid })
    }

    fn kill_process_group(&self, handle: &ProcessHandle) -> Result<(), RuntimeError> {
        #[cfg(unix)]
        {
            kill_group_unix(handle.pid)
        }

        #[cfg(not(unix))]
        {
            let _ = handle;
            Err(RuntimeError::Unsupported("process groups"))
        }
    }

    async fn listen_on_channel(
        &self,
        path: &Path,
        frames: mpsc::Sender<Frame>,
        cancel: CancellationToken,
    ) -> Result<ListenerHandle, RuntimeError> {
        #[cfg(unix)]
        {
            listen_unix(path, frames, cancel).await
        }

        #[cfg(not(unix))]
        {
            let _ = (path, frames, cancel);
            Err(RuntimeError::Unsupported("unix domain sockets"))
        }
    }

    async fn post_json(
        &self,
        url: &str,
        token: &AuthToken,
        body: &serde_json::Value,
    ) -> Result<HttpResponse, RuntimeError> {
        let http_err = |e: reqwest::Error| RuntimeError::Http {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = self
            .http
            .post(url)
            .header(DAEMON_TOKEN_HEADER, token.expose())
            .json(body)
            .send()
            .await
            .map_err(http_err)?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(http_err)?;
        Ok(HttpResponse { status, body })
    }

    async fn read_file(&self, path: &Path) -> Result<String, RuntimeError> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|source| RuntimeError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    async fn write_file(&self, path: &Path, contents: &str) -> Result<(), RuntimeError> {
        let io_err = |source| RuntimeError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(path, contents).await.map_err(io_err)
    }

    async fn remove_file(&self, path: &Path) -> Result<(), RuntimeError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(RuntimeError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

/// Read one line, newline stripped. Invalid UTF-8 is replaced rather than
/// ending the stream. `None` at EOF.
async fn read_line_lossy<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

async fn forward_stdout<R: AsyncRead + Unpin>(pid: u32, stdout: R, events: &ProcessEventSender) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    let mut receiver_gone = false;
    loop {
        match read_line_lossy(&mut reader, &mut buf).await {
            Ok(Some(line)) => {
                // Keep draining after the session is gone so the child never
                // blocks on a full pipe.
                if receiver_gone {
                    continue;
                }
                if events.send(ProcessEvent::Stdout(line)).await.is_err() {
                    debug!(pid, "Session no longer listening; discarding agent output");
                    receiver_gone = true;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(pid, error = %e, "Failed to read agent stdout");
                break;
            }
        }
    }
}

async fn collect_stderr_tail<R: AsyncRead + Unpin>(
    stderr: R,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    while let Ok(Some(line)) = read_line_lossy(&mut reader, &mut buf).await {
        if let Ok(mut tail) = tail.lock() {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
}

fn exit_from_status(status: std::process::ExitStatus) -> ProcessExit {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ProcessExit {
        code: status.code(),
        signal,
        stderr_tail: Vec::new(),
    }
}

// ── Unix implementation ───────────────────────────────────────────────────────

#[cfg(unix)]
fn kill_group_unix(pid: u32) -> Result<(), RuntimeError> {
    let pgid = pid as libc::pid_t;
    if pgid <= 0 {
        return Err(RuntimeError::Kill {
            pid,
            source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
        });
    }
    // SAFETY: killpg only delivers a signal to the group; it touches no memory.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc == 0 {
        debug!(pid, "Sent SIGKILL to process group");
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        debug!(pid, "Process group already gone");
        Ok(())
    } else {
        Err(RuntimeError::Kill { pid, source: err })
    }
}

#[cfg(unix)]
async fn listen_unix(
    path: &Path,
    frames: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) -> Result<ListenerHandle, RuntimeError> {
    use tokio::net::UnixListener;

    let listen_err = |source| RuntimeError::Listen {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(listen_err)?;
    }

    // Remove stale socket file if present (daemon may have crashed previously)
    if path.exists() {
        warn!(path = %path.display(), "Removing stale socket file");
        std::fs::remove_file(path).map_err(listen_err)?;
    }

    let listener = UnixListener::bind(path).map_err(listen_err)?;
    info!(path = %path.display(), "Listening on IPC socket");

    let accept_cancel = cancel.child_token();
    let accept_path = path.to_path_buf();
    let loop_cancel = accept_cancel.clone();
    tokio::spawn(async move {
        run_accept_loop(listener, frames, loop_cancel, &accept_path).await;
    });

    Ok(ListenerHandle::new(path.to_path_buf(), accept_cancel))
}

#[cfg(unix)]
async fn run_accept_loop(
    listener: tokio::net::UnixListener,
    frames: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    socket_path: &Path,
) {
    debug!("Socket accept loop started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Socket accept loop cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let frames = frames.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            read_frames(stream, frames, cancel).await;
                        });
                    }
                    Err(e) => {
                        error!(path = %socket_path.display(), error = %e, "Accept error on socket");
                        // Brief pause before retrying to avoid a tight error loop
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    debug!("Socket accept loop stopped");
}

/// Read newline-delimited frames from one connection until EOF.
#[cfg(unix)]
async fn read_frames(
    stream: tokio::net::UnixStream,
    frames: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(stream);
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };
        match frame {
            Ok(FrameRead::Frame(frame)) => {
                if frames.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(FrameRead::Oversized(size)) => {
                error!(size, limit = MAX_FRAME_BYTES, "Discarding oversized IPC frame");
            }
            Ok(FrameRead::Blank) => {}
            Ok(FrameRead::Eof) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read from IPC connection");
                break;
            }
        }
    }
    debug!("IPC connection closed");
}

#[cfg(unix)]
#[derive(Debug)]
enum FrameRead {
    Frame(Frame),
    Oversized(usize),
    Blank,
    Eof,
}

#[cfg(unix)]
async fn read_frame<R>(reader: &mut R) -> std::io::Result<FrameRead>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let limit = (MAX_FRAME_BYTES + 1) as u64;
    let mut buf = Vec::new();
    let n = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(FrameRead::Eof);
    }

    if !buf.ends_with(b"\n") && n as u64 == limit {
        // Skip the rest of the line without buffering it.
        let mut total = n;
        loop {
            let mut scratch = Vec::new();
            let m = (&mut *reader).take(limit).read_until(b'\n', &mut scratch).await?;
            total += m;
            if m == 0 || scratch.ends_with(b"\n") {
                break;
            }
        }
        return Ok(FrameRead::Oversized(total));
    }

    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    if buf.iter().all(u8::is_ascii_whitespace) {
        return Ok(FrameRead::Blank);
    }
    Ok(FrameRead::Frame(buf))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_frame_splits_lines() {
        let input: &[u8] = b"{\"a\":1}\n\n{\"b\":2}\r\n{\"c\":3}";
        let mut reader = BufReader::new(input);
        let mut frames = Vec::new();
        loop {
            match read_frame(&mut reader).await.unwrap() {
                FrameRead::Frame(f) => frames.push(String::from_utf8(f).unwrap()),
                FrameRead::Blank => {}
                FrameRead::Oversized(_) => panic!("unexpected oversized frame"),
                FrameRead::Eof => break,
            }
        }
        assert_eq!(frames, vec!["{\"a\":1}", "{\"b\":2}", "{\"c\":3}"]);
    }

    #[tokio::test]
    async fn test_read_frame_discards_oversized_line() {
        let mut input = vec![b'x'; MAX_FRAME_BYTES + 10];
        input.extend_from_slice(b"\n{\"ok\":true}\n");
        let mut reader = BufReader::new(input.as_slice());

        match read_frame(&mut reader).await.unwrap() {
            FrameRead::Oversized(size) => assert_eq!(size, MAX_FRAME_BYTES + 11),
            other => panic!("expected oversized, got {other:?}"),
        }
        match read_frame(&mut reader).await.unwrap() {
            FrameRead::Frame(f) => assert_eq!(f, b"{\"ok\":true}"),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_streams_stdout_then_exit() {
        let runtime = TokioRuntime::new().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let spec = ProcessSpec::new("sh")
            .arg("-c")
            .arg("echo '{\"n\":1}'; echo '{\"n\":2}'; echo oops >&2; exit 3");

        let handle = runtime.spawn_process(&spec, tx).await.unwrap();
        assert!(handle.pid > 0);

        assert_eq!(rx.recv().await, Some(ProcessEvent::Stdout("{\"n\":1}".into())));
        assert_eq!(rx.recv().await, Some(ProcessEvent::Stdout("{\"n\":2}".into())));
        match rx.recv().await {
            Some(ProcessEvent::Exited(exit)) => {
                assert_eq!(exit.code, Some(3));
                assert_eq!(exit.stderr_tail, vec!["oops".to_string()]);
            }
            other => panic!("expected exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_does_not_end_output() {
        let runtime = TokioRuntime::new().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let spec = ProcessSpec::new("sh").arg("-c").arg(
            "printf '\\377\\n'; echo '{\"n\":1}'; printf '\\377\\n' >&2; echo late >&2; exit 1",
        );

        runtime.spawn_process(&spec, tx).await.unwrap();

        assert_eq!(rx.recv().await, Some(ProcessEvent::Stdout("\u{FFFD}".into())));
        assert_eq!(rx.recv().await, Some(ProcessEvent::Stdout("{\"n\":1}".into())));
        match rx.recv().await {
            Some(ProcessEvent::Exited(exit)) => {
                assert_eq!(exit.code, Some(1));
                assert_eq!(exit.stderr_tail, vec!["\u{FFFD}".to_string(), "late".to_string()]);
            }
            other => panic!("expected exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exit_reported_while_descendant_holds_stdout() {
        let runtime = TokioRuntime::new().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let spec = ProcessSpec::new("sh").arg("-c").arg("sleep 20 & echo '{}'; exit 0");

        let handle = runtime.spawn_process(&spec, tx).await.unwrap();

        assert_eq!(rx.recv().await, Some(ProcessEvent::Stdout("{}".into())));
        let exit = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("exit should be reported while the pipe is still open");
        match exit {
            Some(ProcessEvent::Exited(exit)) => assert_eq!(exit.code, Some(0)),
            other => panic!("expected exit, got {other:?}"),
        }

        // Reap the background sleep.
        runtime.kill_process_group(&handle).unwrap();
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_is_typed_error() {
        let runtime = TokioRuntime::new().unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let spec = ProcessSpec::new("definitely-not-a-real-agent-binary");
        let err = runtime.spawn_process(&spec, tx).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_kill_process_group_terminates_descendants() {
        let runtime = TokioRuntime::new().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let spec = ProcessSpec::new("sh").arg("-c").arg("sleep 30 & sleep 30; wait");

        let handle = runtime.spawn_process(&spec, tx).await.unwrap();
        runtime.kill_process_group(&handle).unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("process should exit after group kill");
        match exit {
            Some(ProcessEvent::Exited(exit)) => assert_eq!(exit.signal, Some(libc::SIGKILL)),
            other => panic!("expected exit, got {other:?}"),
        }

        // Group is gone now; signalling again is not an error.
        runtime.kill_process_group(&handle).unwrap();
    }

    #[tokio::test]
    async fn test_file_round_trip_and_remove_missing() {
        let runtime = TokioRuntime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/relay.pid");

        runtime.write_file(&path, "4242\n").await.unwrap();
        assert_eq!(runtime.read_file(&path).await.unwrap(), "4242\n");

        runtime.remove_file(&path).await.unwrap();
        runtime.remove_file(&path).await.unwrap();
        assert!(matches!(
            runtime.read_file(&path).await,
            Err(RuntimeError::Io { .. })
        ));
    }
}
