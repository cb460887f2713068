//! Command envelope accepted on the daemon's IPC channel.
//!
//! Each frame is one JSON object, newline-terminated, tagged by `type`:
//!
//! ```json
//! {"type":"start-agent","threadId":"T1","threadChatId":"C1","agent":"claudeCode","agentVersion":1,
//!  "model":"sonnet","token":"…","prompt":"Fix the build","sessionId":null}
//! {"type":"stop-agent","threadId":"T1","threadChatId":"C1","token":"…"}
//! ```
//!
//! The older `"claude"` / `"stop"` tags are accepted as aliases. Nothing is
//! ever written back on the channel.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest frame the router will attempt to decode.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Errors produced while decoding and validating an inbound frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is {size} bytes, limit is {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("frame is not valid JSON: {0}")]
    MalformedJson(#[source] serde_json::Error),

    #[error("frame has no \"type\" tag")]
    MissingType,

    #[error("unknown command type \"{0}\"")]
    UnknownType(String),

    #[error("invalid {command} envelope: {source}")]
    InvalidEnvelope {
        command: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{command} envelope has empty required field '{field}'")]
    MissingField {
        command: &'static str,
        field: &'static str,
    },
}

/// The closed set of coding agents the daemon knows how to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentKind {
    #[serde(rename = "claudeCode", alias = "claude-code")]
    ClaudeCode,
    #[serde(rename = "codex")]
    Codex,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "amp")]
    Amp,
    #[serde(rename = "opencode")]
    OpenCode,
}

impl AgentKind {
    /// Every variant, for exhaustiveness checks in tests.
    pub const ALL: [AgentKind; 5] = [
        AgentKind::ClaudeCode,
        AgentKind::Codex,
        AgentKind::Gemini,
        AgentKind::Amp,
        AgentKind::OpenCode,
    ];

    /// Wire name of the agent.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClaudeCode => "claudeCode",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
            Self::Amp => "amp",
            Self::OpenCode => "opencode",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a supervised session: one conversation within one thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub thread_id: String,
    pub thread_chat_id: String,
}

impl SessionKey {
    pub fn new(thread_id: impl Into<String>, thread_chat_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            thread_chat_id: thread_chat_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.thread_id, self.thread_chat_id)
    }
}

/// Bearer credential forwarded to the remote API. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

/// Payload of a `start-agent` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAgent {
    pub thread_id: String,
    pub thread_chat_id: String,
    pub agent: AgentKind,
    /// Version of the agent's streaming protocol the remote API expects.
    #[serde(default)]
    pub agent_version: u32,
    /// Model name; empty means the agent's own default.
    #[serde(default)]
    pub model: String,
    pub token: AuthToken,
    pub prompt: String,
    /// Prior agent session to resume, if any.
    #[serde(default)]
    pub session_id: Option<String>,
}

impl StartAgent {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.thread_id, &self.thread_chat_id)
    }
}

/// Payload of a `stop-agent` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopAgent {
    pub thread_id: String,
    pub thread_chat_id: String,
    pub token: AuthToken,
}

impl StopAgent {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.thread_id, &self.thread_chat_id)
    }
}

/// A validated command envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    #[serde(rename = "start-agent", alias = "claude")]
    Start(StartAgent),
    #[serde(rename = "stop-agent", alias = "stop")]
    Stop(StopAgent),
}

impl Command {
    /// Decode and validate one raw frame.
    pub fn from_frame(frame: &[u8]) -> Result<Self, ProtocolError> {
        if frame.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.len(),
                limit: MAX_FRAME_BYTES,
            });
        }

        let value: serde_json::Value =
            serde_json::from_slice(frame).map_err(ProtocolError::MalformedJson)?;

        let tag = value
            .get("type")
            .and_then(|t| t.as_str())
            .map(str::to_owned)
            .ok_or(ProtocolError::MissingType)?;

        let command = match tag.as_str() {
            "start-agent" | "claude" => serde_json::from_value::<StartAgent>(value)
                .map(Command::Start)
                .map_err(|source| ProtocolError::InvalidEnvelope {
                    command: "start-agent",
                    source,
                })?,
            "stop-agent" | "stop" => serde_json::from_value::<StopAgent>(value)
                .map(Command::Stop)
                .map_err(|source| ProtocolError::InvalidEnvelope {
                    command: "stop-agent",
                    source,
                })?,
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };

        command.validate()?;
        Ok(command)
    }

    /// Reject envelopes whose required string fields are blank.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let (command, checks): (&'static str, Vec<(&'static str, bool)>) = match self {
            Command::Start(start) => (
                "start-agent",
                vec![
                    ("threadId", start.thread_id.trim().is_empty()),
                    ("threadChatId", start.thread_chat_id.trim().is_empty()),
                    ("token", start.token.is_blank()),
                    ("prompt", start.prompt.trim().is_empty()),
                ],
            ),
            Command::Stop(stop) => (
                "stop-agent",
                vec![
                    ("threadId", stop.thread_id.trim().is_empty()),
                    ("threadChatId", stop.thread_chat_id.trim().is_empty()),
                    ("token", stop.token.is_blank()),
                ],
            ),
        };

        match checks.iter().find(|(_, blank)| *blank) {
            Some((field, _)) => Err(ProtocolError::MissingField { command, field }),
            None => Ok(()),
        }
    }

    pub fn key(&self) -> SessionKey {
        match self {
            Command::Start(start) => start.key(),
            Command::Stop(stop) => stop.key(),
        }
    }

    /// Wire tag, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Start(_) => "start-agent",
            Command::Stop(_) => "stop-agent",
        }
    }
}
