//! Daemon configuration
//!
//! Values come from command-line flags, each of which falls back to an
//! environment variable and then to the defaults below. The binary builds a
//! [`DaemonConfig`] once at startup and hands it to the daemon by `Arc`.

use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const API_URL_ENV: &str = "AGENT_RELAY_API_URL";
pub const SOCKET_PATH_ENV: &str = "AGENT_RELAY_SOCKET";
pub const MCP_CONFIG_ENV: &str = "AGENT_RELAY_MCP_CONFIG";
pub const LOG_FORMAT_ENV: &str = "AGENT_RELAY_LOG_FORMAT";
pub const LOG_LEVEL_ENV: &str = "AGENT_RELAY_LOG";
pub const PID_FILE_ENV: &str = "AGENT_RELAY_PID_FILE";
pub const MESSAGE_HANDLE_DELAY_ENV: &str = "AGENT_RELAY_MESSAGE_HANDLE_DELAY_MS";
pub const MESSAGE_FLUSH_DELAY_ENV: &str = "AGENT_RELAY_MESSAGE_FLUSH_DELAY_MS";
pub const UPTIME_INTERVAL_ENV: &str = "AGENT_RELAY_UPTIME_INTERVAL_SECS";

pub const DEFAULT_API_URL: &str = "http://localhost:3000";
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/agent-relay.sock";
pub const DEFAULT_MESSAGE_HANDLE_DELAY: Duration = Duration::from_millis(250);
pub const DEFAULT_MESSAGE_FLUSH_DELAY: Duration = Duration::from_millis(2000);
pub const DEFAULT_UPTIME_INTERVAL: Duration = Duration::from_secs(60);

/// Path appended to the API base URL for output delivery.
pub const DAEMON_EVENT_PATH: &str = "/api/daemon-event";

/// Configuration errors
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("unknown log format '{0}' (expected 'text' or 'json')")]
    UnknownLogFormat(String),

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must be between 0 and 1, got {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("{field} must be at least 1, got {value}")]
    TooSmall { field: &'static str, value: f64 },
}

/// Log output mode, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `message key: value key: value`
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::UnknownLogFormat(other.to_string())),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Complete daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Base URL of the remote API output batches are posted to.
    pub api_url: String,
    /// Unix domain socket the control channel listens on.
    pub socket_path: PathBuf,
    /// Optional MCP server configuration handed to agents that support it.
    pub mcp_config_path: Option<PathBuf>,
    /// Optional file the daemon writes its PID to while running.
    pub pid_file: Option<PathBuf>,
    pub log_format: LogFormat,
    /// Idle window after the last output line before a batch is flushed.
    pub message_handle_delay: Duration,
    /// Ceiling between flushes while output keeps arriving.
    pub message_flush_delay: Duration,
    /// Heartbeat period.
    pub uptime_interval: Duration,
    pub retry: RetryConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            mcp_config_path: None,
            pid_file: None,
            log_format: LogFormat::Text,
            message_handle_delay: DEFAULT_MESSAGE_HANDLE_DELAY,
            message_flush_delay: DEFAULT_MESSAGE_FLUSH_DELAY,
            uptime_interval: DEFAULT_UPTIME_INTERVAL,
            retry: RetryConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Full URL batches are posted to.
    pub fn daemon_event_url(&self) -> String {
        format!("{}{}", self.api_url.trim_end_matches('/'), DAEMON_EVENT_PATH)
    }

    /// Reject values that would make timers spin or retries meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("message_handle_delay", self.message_handle_delay),
            ("message_flush_delay", self.message_flush_delay),
            ("uptime_interval", self.uptime_interval),
            ("retry.base_delay", self.retry.base_delay),
            ("retry.max_delay", self.retry.max_delay),
        ];
        if let Some((field, _)) = non_zero.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Zero { field: *field });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "retry.max_attempts",
            });
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(ConfigError::OutOfRange {
                field: "retry.jitter_factor",
                value: self.retry.jitter_factor,
            });
        }
        if self.retry.backoff_multiplier.is_nan() || self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::TooSmall {
                field: "retry.backoff_multiplier",
                value: self.retry.backoff_multiplier,
            });
        }
        Ok(())
    }
}
