//! Agent relay daemon - supervises coding-agent subprocesses and relays their output

use agent_relay_core::config::{
    API_URL_ENV, DEFAULT_API_URL, DEFAULT_SOCKET_PATH, DaemonConfig, LOG_FORMAT_ENV, LogFormat,
    MCP_CONFIG_ENV, MESSAGE_FLUSH_DELAY_ENV, MESSAGE_HANDLE_DELAY_ENV, PID_FILE_ENV,
    SOCKET_PATH_ENV, UPTIME_INTERVAL_ENV,
};
use agent_relay_core::feature_flags::FeatureFlags;
use agent_relay_core::logging;
use agent_relay_core::retry::RetryConfig;
use agent_relay_daemon::daemon;
use agent_relay_daemon::runtime::TokioRuntime;
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Agent relay daemon - supervises coding-agent subprocesses and relays their output
#[derive(Parser, Debug)]
#[command(name = "agent-relay-daemon")]
#[command(version)]
struct Args {
    /// Base URL of the remote API
    #[arg(long, env = API_URL_ENV, default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Unix socket to accept commands on
    #[arg(long, env = SOCKET_PATH_ENV, default_value = DEFAULT_SOCKET_PATH, value_name = "PATH")]
    socket: PathBuf,

    /// MCP server configuration passed to agents that support it
    #[arg(long, env = MCP_CONFIG_ENV, value_name = "PATH")]
    mcp_config: Option<PathBuf>,

    /// Write the daemon's PID here while it runs
    #[arg(long, env = PID_FILE_ENV, value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Log output format: text or json
    #[arg(long, env = LOG_FORMAT_ENV, default_value = "text")]
    log_format: LogFormat,

    /// Idle time after an agent's last output line before its batch is sent
    #[arg(long, env = MESSAGE_HANDLE_DELAY_ENV, default_value_t = 250, value_name = "MS")]
    message_handle_delay_ms: u64,

    /// Longest time output may sit in a batch while lines keep arriving
    #[arg(long, env = MESSAGE_FLUSH_DELAY_ENV, default_value_t = 2000, value_name = "MS")]
    message_flush_delay_ms: u64,

    /// Heartbeat interval
    #[arg(long, env = UPTIME_INTERVAL_ENV, default_value_t = 60, value_name = "SECS")]
    uptime_interval_secs: u64,

    /// First retry delay for a failed delivery
    #[arg(long, default_value_t = 1000, value_name = "MS")]
    retry_base_delay_ms: u64,

    /// Upper bound on any single retry delay
    #[arg(long, default_value_t = 30_000, value_name = "MS")]
    retry_max_delay_ms: u64,

    /// Delivery attempts per batch, including the first
    #[arg(long, default_value_t = 5)]
    retry_max_attempts: u32,

    /// Growth factor between consecutive retry delays
    #[arg(long, default_value_t = 2.0)]
    retry_backoff_multiplier: f64,

    /// Random spread applied to each retry delay, as a fraction (0 disables)
    #[arg(long, default_value_t = 0.2)]
    retry_jitter: f64,
}

impl Args {
    fn into_config(self) -> DaemonConfig {
        DaemonConfig {
            api_url: self.api_url,
            socket_path: self.socket,
            mcp_config_path: self.mcp_config,
            pid_file: self.pid_file,
            log_format: self.log_format,
            message_handle_delay: Duration::from_millis(self.message_handle_delay_ms),
            message_flush_delay: Duration::from_millis(self.message_flush_delay_ms),
            uptime_interval: Duration::from_secs(self.uptime_interval_secs),
            retry: RetryConfig {
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
                max_attempts: self.retry_max_attempts,
                backoff_multiplier: self.retry_backoff_multiplier,
                jitter_factor: self.retry_jitter,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.log_format);

    let config = args.into_config();
    config.validate().context("Invalid configuration")?;

    // Read exactly once; shared immutably from here on.
    let flags = FeatureFlags::from_env();

    let runtime = Arc::new(TokioRuntime::new().context("Failed to initialise runtime")?);

    let cancel_token = CancellationToken::new();

    // Set up signal handlers
    let cancel_for_signals = cancel_token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        cancel_for_signals.cancel();
    });

    daemon::run(runtime, config, flags, cancel_token)
        .await
        .context("Daemon failed")?;

    info!("Agent relay daemon shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C)"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler; only Ctrl+C will stop the daemon");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Failed to listen for Ctrl+C");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C"),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C"),
        }
    }
}
