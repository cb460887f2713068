//! Shared logging initialization for agent-relay binaries.
//!
//! Two output modes, chosen once at startup:
//!
//! ```text
//! text: Agent process started pid: 4242 session: T1/C1
//! json: {"timestamp":"2026-10-18T09:12:44.120Z","level":"info","message":"Agent process started","data":{"pid":4242,"session":"T1/C1"}}
//! ```

use crate::config::{LOG_LEVEL_ENV, LogFormat};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::OnceLock;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

static INIT: OnceLock<()> = OnceLock::new();

fn parse_level() -> Level {
    match std::env::var(LOG_LEVEL_ENV)
        .unwrap_or_else(|_| "info".to_string())
        .to_ascii_lowercase()
        .as_str()
    {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize process-level tracing output in the given format.
///
/// The level comes from `AGENT_RELAY_LOG`. Only the first call installs a
/// subscriber; later calls are no-ops and never return an error.
pub fn init(format: LogFormat) {
    if INIT.get().is_some() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_max_level(parse_level())
        .event_format(RelayFormatter::new(format))
        .try_init();
    let _ = INIT.set(());
}

/// Event formatter producing the daemon's text or JSON lines.
#[derive(Debug, Clone, Copy)]
pub struct RelayFormatter {
    format: LogFormat,
}

impl RelayFormatter {
    pub fn new(format: LogFormat) -> Self {
        Self { format }
    }
}

impl<S, N> FormatEvent<S, N> for RelayFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut fields = FieldCollector::default();
        event.record(&mut fields);
        let line = render_line(
            self.format,
            *event.metadata().level(),
            &fields.message,
            &fields.data,
            Utc::now(),
        );
        writeln!(writer, "{line}")
    }
}

/// Level names used on the wire; `trace` folds into `debug`.
pub fn level_name(level: Level) -> &'static str {
    match level {
        Level::ERROR => "error",
        Level::WARN => "warn",
        Level::INFO => "info",
        _ => "debug",
    }
}

/// Render one log line without a trailing newline.
pub fn render_line(
    format: LogFormat,
    level: Level,
    message: &str,
    data: &Map<String, Value>,
    timestamp: DateTime<Utc>,
) -> String {
    match format {
        LogFormat::Text => {
            let mut line = message.to_string();
            for (key, value) in data {
                line.push(' ');
                line.push_str(key);
                line.push_str(": ");
                match value {
                    Value::String(s) => line.push_str(s),
                    other => line.push_str(&other.to_string()),
                }
            }
            line
        }
        LogFormat::Json => {
            let mut object = Map::new();
            object.insert(
                "timestamp".to_string(),
                Value::String(timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
            object.insert("level".to_string(), Value::String(level_name(level).to_string()));
            object.insert("message".to_string(), Value::String(message.to_string()));
            if !data.is_empty() {
                object.insert("data".to_string(), Value::Object(data.clone()));
            }
            Value::Object(object).to_string()
        }
    }
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    data: Map<String, Value>,
}

impl FieldCollector {
    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
        } else {
            self.data.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::Bool(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, Value::String(value.to_string()));
    }
}
