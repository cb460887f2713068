//! Command lines for each supported coding agent.
//!
//! [`build_agent_command`] is the only place that knows how an agent CLI is
//! invoked. It matches exhaustively on [`AgentKind`], so adding a variant
//! fails to compile until its command line is written here.

use crate::runtime::ProcessSpec;
use agent_relay_core::feature_flags::{FEATURE_FLAGS_ENV, FeatureFlags};
use agent_relay_core::protocol::{AgentKind, StartAgent};
use std::path::PathBuf;

/// Environment variable carrying the thread ID into the agent process.
pub const THREAD_ID_ENV: &str = "AGENT_RELAY_THREAD_ID";
/// Environment variable carrying the thread chat ID into the agent process.
pub const THREAD_CHAT_ID_ENV: &str = "AGENT_RELAY_THREAD_CHAT_ID";

/// Daemon-wide inputs to every agent command line.
#[derive(Debug, Clone, Default)]
pub struct AgentCommandContext {
    /// Validated MCP config, passed to agents that accept one.
    pub mcp_config_path: Option<PathBuf>,
    pub flags: FeatureFlags,
}

/// Build the subprocess description for a start command.
pub fn build_agent_command(request: &StartAgent, ctx: &AgentCommandContext) -> ProcessSpec {
    let model = Some(request.model.trim()).filter(|m| !m.is_empty());
    let resume = request
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let prompt = request.prompt.as_str();

    let mut spec = match request.agent {
        AgentKind::ClaudeCode => {
            let mut spec = ProcessSpec::new("claude")
                .arg("-p")
                .arg(prompt)
                .arg("--output-format")
                .arg("stream-json")
                .arg("--verbose")
                .arg("--dangerously-skip-permissions");
            if let Some(model) = model {
                spec = spec.arg("--model").arg(model);
            }
            if let Some(session) = resume {
                spec = spec.arg("--resume").arg(session);
            }
            if let Some(path) = &ctx.mcp_config_path {
                spec = spec.arg("--mcp-config").arg(path.to_string_lossy());
            }
            spec
        }
        AgentKind::Codex => {
            let mut spec = ProcessSpec::new("codex")
                .arg("exec")
                .arg("--json")
                .arg("--dangerously-bypass-approvals-and-sandbox");
            if let Some(model) = model {
                spec = spec.arg("--model").arg(model);
            }
            if let Some(session) = resume {
                spec = spec.arg("resume").arg(session);
            }
            spec.arg(prompt)
        }
        AgentKind::Gemini => {
            let mut spec = ProcessSpec::new("gemini")
                .arg("--output-format")
                .arg("stream-json")
                .arg("--yolo");
            if let Some(model) = model {
                spec = spec.arg("--model").arg(model);
            }
            if let Some(session) = resume {
                spec = spec.arg("--resume").arg(session);
            }
            spec.arg("--prompt").arg(prompt)
        }
        AgentKind::Amp => {
            let mut spec = ProcessSpec::new("amp")
                .arg("--execute")
                .arg(prompt)
                .arg("--stream-json")
                .arg("--dangerously-allow-all");
            if let Some(session) = resume {
                spec = spec.arg("threads").arg("continue").arg(session);
            }
            spec
        }
        AgentKind::OpenCode => {
            let mut spec = ProcessSpec::new("opencode")
                .arg("run")
                .arg("--format")
                .arg("json");
            if let Some(model) = model {
                spec = spec.arg("--model").arg(model);
            }
            if let Some(session) = resume {
                spec = spec.arg("--session").arg(session);
            }
            spec.arg(prompt)
        }
    };

    spec = spec
        .env(FEATURE_FLAGS_ENV, ctx.flags.to_json_string())
        .env(THREAD_ID_ENV, &request.thread_id)
        .env(THREAD_CHAT_ID_ENV, &request.thread_chat_id);
    spec
}
