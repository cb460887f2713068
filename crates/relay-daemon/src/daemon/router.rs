//! Inbound frame routing.
//!
//! Frames arrive from the IPC listener in the order clients wrote them.
//! [`MessageRouter::dispatch`] decodes each one and applies it to the
//! [`SessionManager`] before the next frame is looked at. A frame that fails
//! to decode is logged and dropped; it never touches the registry.

use super::sessions::{SessionManager, StopOutcome};
use crate::runtime::Frame;
use agent_relay_core::protocol::{Command, SessionKey};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// What a single frame did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Started(SessionKey),
    Stopped(SessionKey),
    /// Stop for a key with no session.
    StopIgnored(SessionKey),
    /// Frame was malformed or invalid and has been discarded.
    Rejected,
}

/// Decodes frames and dispatches them to the session manager.
#[derive(Clone)]
pub struct MessageRouter {
    sessions: SessionManager,
}

impl MessageRouter {
    pub fn new(sessions: SessionManager) -> Self {
        Self { sessions }
    }

    /// Decode, validate, and apply one frame.
    pub fn dispatch(&self, frame: &[u8]) -> DispatchOutcome {
        let command = match Command::from_frame(frame) {
            Ok(command) => command,
            Err(e) => {
                error!(
                    error = %e,
                    bytes = frame.len(),
                    preview = %preview(frame),
                    "Discarding invalid command frame"
                );
                return DispatchOutcome::Rejected;
            }
        };

        debug!(command = command.name(), session = %command.key(), "Received command");
        match command {
            Command::Start(start) => DispatchOutcome::Started(self.sessions.start(start)),
            Command::Stop(stop) => {
                let key = stop.key();
                match self.sessions.stop(&stop) {
                    StopOutcome::Stopped => DispatchOutcome::Stopped(key),
                    StopOutcome::NotFound => DispatchOutcome::StopIgnored(key),
                }
            }
        }
    }

    /// Dispatch frames until the channel closes or `cancel` fires.
    pub async fn run(&self, mut frames: mpsc::Receiver<Frame>, cancel: CancellationToken) -> u64 {
        let mut handled = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        self.dispatch(&frame);
                        handled += 1;
                    }
                    None => break,
                },
            }
        }
        info!(frames = handled, "Command router stopped");
        handled
    }
}

/// First bytes of a rejected frame, lossily decoded for the log.
fn preview(frame: &[u8]) -> String {
    const MAX: usize = 120;
    let end = frame.len().min(MAX);
    let mut text = String::from_utf8_lossy(&frame[..end]).into_owned();
    if frame.len() > MAX {
        text.push('…');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::agent_command::AgentCommandContext;
    use crate::daemon::batcher::BatchTiming;
    use crate::daemon::delivery::DeliveryQueue;
    use crate::runtime::{DaemonRuntime, MockRuntime};
    use agent_relay_core::retry::RetryConfig;
    use std::sync::Arc;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn router(rt: &MockRuntime) -> (MessageRouter, SessionManager) {
        let runtime: Arc<dyn DaemonRuntime> = Arc::new(rt.clone());
        let delivery = DeliveryQueue::new(runtime.clone(), "http://api.test/api/daemon-event", RetryConfig::default());
        let sessions = SessionManager::new(
            runtime,
            AgentCommandContext::default(),
            BatchTiming {
                handle_delay: Duration::from_millis(250),
                flush_delay: Duration::from_millis(2000),
            },
            delivery,
        );
        (MessageRouter::new(sessions.clone()), sessions)
    }

    const START: &str = r#"{"type":"start-agent","threadId":"T1","threadChatId":"C1","agent":"claudeCode","agentVersion":1,"model":"sonnet","token":"tok","prompt":"hi"}"#;
    const STOP: &str = r#"{"type":"stop-agent","threadId":"T1","threadChatId":"C1","token":"tok"}"#;

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_malformed_frames_are_rejected_without_side_effects() {
        let rt = MockRuntime::new();
        let (router, sessions) = router(&rt);
        let frames: [&[u8]; 5] = [
            b"not json",
            br#"{"threadId":"T1"}"#,
            br#"{"type":"launch-rocket"}"#,
            br#"{"type":"start-agent","threadId":"T1","threadChatId":"C1","agent":"cobol","token":"t","prompt":"p"}"#,
            br#"{"type":"stop-agent","threadId":"","threadChatId":"C1","token":"t"}"#,
        ];
        for frame in frames {
            assert_eq!(router.dispatch(frame), DispatchOutcome::Rejected);
        }
        assert!(sessions.is_empty());
        assert!(rt.calls().is_empty());
        assert!(logs_contain("Discarding invalid command frame"));

        // Still responsive afterwards.
        assert_eq!(
            router.dispatch(START.as_bytes()),
            DispatchOutcome::Started(SessionKey::new("T1", "C1"))
        );
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_then_stop_then_stop_again() {
        let rt = MockRuntime::new();
        let (router, sessions) = router(&rt);
        let key = SessionKey::new("T1", "C1");

        router.dispatch(START.as_bytes());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(router.dispatch(STOP.as_bytes()), DispatchOutcome::Stopped(key.clone()));
        assert!(sessions.is_empty());
        assert_eq!(rt.killed_pids(), vec![1000]);

        assert_eq!(router.dispatch(STOP.as_bytes()), DispatchOutcome::StopIgnored(key));
        assert_eq!(rt.killed_pids(), vec![1000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_pumps_frames_in_order() {
        let rt = MockRuntime::new();
        let (router, sessions) = router(&rt);
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        tx.send(START.as_bytes().to_vec()).await.unwrap();
        tx.send(STOP.as_bytes().to_vec()).await.unwrap();
        drop(tx);

        assert_eq!(router.run(rx, cancel).await, 2);
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_preview_truncates() {
        let long = vec![b'x'; 500];
        let p = preview(&long);
        assert!(p.ends_with('…'));
        assert_eq!(p.chars().count(), 121);
    }
}
