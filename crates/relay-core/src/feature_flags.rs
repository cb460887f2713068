//! Feature flags supplied once at startup through the environment.
//!
//! The daemon reads [`FEATURE_FLAGS_ENV`] a single time while it is being
//! constructed and shares the resulting map by `Arc` for its whole lifetime.
//! A missing or malformed value never prevents startup: both fall back to an
//! empty map, the latter with an error log carrying the offending string.

use serde_json::{Map, Value};
use tracing::{debug, error};

/// Environment variable carrying the JSON-encoded flag object.
pub const FEATURE_FLAGS_ENV: &str = "AGENT_RELAY_FEATURE_FLAGS";

/// Immutable map from flag name to an arbitrary JSON value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureFlags {
    flags: Map<String, Value>,
}

impl FeatureFlags {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load from [`FEATURE_FLAGS_ENV`].
    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var(FEATURE_FLAGS_ENV).ok().as_deref())
    }

    /// Parse a raw environment value. `None` means the variable is unset.
    pub fn from_env_value(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            debug!("No feature flags configured");
            return Self::empty();
        };

        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(flags)) => {
                debug!(count = flags.len(), "Loaded feature flags");
                Self { flags }
            }
            Ok(other) => {
                error!(
                    raw = %raw,
                    kind = json_kind(&other),
                    "Feature flags must be a JSON object; continuing with no flags"
                );
                Self::empty()
            }
            Err(e) => {
                error!(
                    raw = %raw,
                    error = %e,
                    "Failed to parse feature flags; continuing with no flags"
                );
                Self::empty()
            }
        }
    }

    pub fn from_map(flags: Map<String, Value>) -> Self {
        Self { flags }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.flags.get(name)
    }

    /// `true` only when the flag is present and set to JSON `true`.
    pub fn is_enabled(&self, name: &str) -> bool {
        matches!(self.flags.get(name), Some(Value::Bool(true)))
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// Compact JSON encoding, as forwarded to agent subprocesses.
    pub fn to_json_string(&self) -> String {
        Value::Object(self.flags.clone()).to_string()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
