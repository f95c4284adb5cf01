//! Structured logger contract.
//!
//! Records carry `timestamp, run_id, level, event, message?, payload?`.
//! Three modes:
//!
//! - **Silent** (default): records are built and returned to the caller for
//!   inspection, but never written.
//! - **Human** (`--verbose`): one level-colored line per record on stderr,
//!   payload rendered as compact JSON.
//! - **JSON** (`--json`): one record per line on stderr, sorted keys,
//!   compact separators.
//!
//! Every payload passes through [`sqlitch_redact`] before rendering, so
//! sensitive keys and URL-embedded passwords never reach a sink.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use console::style;
use serde_json::{Map, Value};

/// Record severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Where records go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    Silent,
    Human,
    Json,
}

/// Logger configuration, fixed per invocation.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub run_id: String,
    pub level: LogLevel,
    pub mode: LogMode,
}

impl LogConfig {
    /// Map the global output flags onto a configuration.
    pub fn from_flags(run_id: String, json: bool, verbosity: u8, quiet: bool) -> Self {
        let mode = if json {
            LogMode::Json
        } else if verbosity > 0 {
            LogMode::Human
        } else {
            LogMode::Silent
        };
        let level = if quiet {
            LogLevel::Error
        } else {
            match verbosity {
                0 | 1 => LogLevel::Info,
                2 => LogLevel::Debug,
                _ => LogLevel::Trace,
            }
        };
        Self {
            run_id,
            level,
            mode,
        }
    }
}

/// An emitted record.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub level: LogLevel,
    pub event: String,
    pub message: Option<String>,
    pub payload: Map<String, Value>,
}

impl LogRecord {
    /// JSON form with sorted keys.
    pub fn to_json(&self) -> Value {
        let mut data: BTreeMap<String, Value> = BTreeMap::new();
        data.insert(
            "ts".to_string(),
            Value::String(self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        data.insert("run_id".to_string(), Value::String(self.run_id.clone()));
        data.insert(
            "level".to_string(),
            Value::String(self.level.as_str().to_string()),
        );
        data.insert("event".to_string(), Value::String(self.event.clone()));
        if let Some(message) = &self.message {
            data.insert("message".to_string(), Value::String(message.clone()));
        }
        if !self.payload.is_empty() {
            data.insert(
                "data".to_string(),
                Value::Object(self.payload.clone()),
            );
        }
        serde_json::to_value(data).unwrap_or(Value::Null)
    }
}

/// The logger handle carried in the core context.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    config: LogConfig,
}

impl StructuredLogger {
    pub fn new(config: LogConfig) -> Self {
        Self { config }
    }

    /// A logger that builds records without writing them.
    pub fn silent() -> Self {
        Self::new(LogConfig {
            run_id: "test".to_string(),
            level: LogLevel::Trace,
            mode: LogMode::Silent,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.config.run_id
    }

    pub fn debug(&self, event: &str, message: &str) -> Option<LogRecord> {
        self.emit(LogLevel::Debug, event, Some(message), None)
    }

    pub fn info(&self, event: &str, message: &str) -> Option<LogRecord> {
        self.emit(LogLevel::Info, event, Some(message), None)
    }

    pub fn warning(&self, event: &str, message: &str) -> Option<LogRecord> {
        self.emit(LogLevel::Warning, event, Some(message), None)
    }

    pub fn error(&self, event: &str, message: &str) -> Option<LogRecord> {
        self.emit(LogLevel::Error, event, Some(message), None)
    }

    /// Emit a record when the severity meets the configured threshold.
    ///
    /// Returns the (redacted) record so silent-mode callers can inspect it.
    pub fn emit(
        &self,
        level: LogLevel,
        event: &str,
        message: Option<&str>,
        payload: Option<Map<String, Value>>,
    ) -> Option<LogRecord> {
        if level < self.config.level {
            return None;
        }

        let payload = payload
            .map(|p| sqlitch_redact::redact_payload(&p))
            .unwrap_or_default();
        let record = LogRecord {
            timestamp: Utc::now(),
            run_id: self.config.run_id.clone(),
            level,
            event: event.to_string(),
            message: message.map(str::to_string),
            payload,
        };

        match self.config.mode {
            LogMode::Silent => {}
            LogMode::Human => eprintln!("{}", render_human(&record)),
            LogMode::Json => {
                let line = serde_json::to_string(&record.to_json()).unwrap_or_default();
                eprintln!("{line}");
            }
        }

        Some(record)
    }
}

fn render_human(record: &LogRecord) -> String {
    let level = match record.level {
        LogLevel::Trace => style(record.level.as_str()).dim(),
        LogLevel::Debug => style(record.level.as_str()).cyan(),
        LogLevel::Info => style(record.level.as_str()).green(),
        LogLevel::Warning => style(record.level.as_str()).yellow(),
        LogLevel::Error => style(record.level.as_str()).red(),
        LogLevel::Critical => style(record.level.as_str()).red().bold(),
    };
    let mut line = format!(
        "{} {} {} {}",
        style(record.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)).dim(),
        style(&record.run_id).cyan(),
        level,
        style(&record.event).bold(),
    );
    if let Some(message) = &record.message {
        line.push_str(&format!(" - {message}"));
    }
    if !record.payload.is_empty() {
        let payload = serde_json::to_string(&Value::Object(record.payload.clone()))
            .unwrap_or_default();
        line.push_str(&format!(" {payload}"));
    }
    line
}

/// Run identifier: `SQLITCH_RUN_ID` when set, else a short hex id derived
/// from the clock and process id.
pub fn generate_run_id(env: &BTreeMap<String, String>) -> String {
    if let Some(id) = env.get("SQLITCH_RUN_ID").filter(|v| !v.is_empty()) {
        return id.clone();
    }
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(Utc::now().to_rfc3339().as_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hex::encode(hasher.finalize())[..12].to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().expect("object").clone()
    }

    #[test]
    fn silent_mode_returns_records_for_inspection() {
        let logger = StructuredLogger::silent();
        let record = logger
            .emit(
                LogLevel::Info,
                "deploy.change",
                Some("deployed users"),
                Some(payload(json!({"change": "users"}))),
            )
            .expect("record");
        assert_eq!(record.event, "deploy.change");
        assert_eq!(record.payload["change"], json!("users"));
    }

    #[test]
    fn records_below_the_threshold_are_dropped() {
        let logger = StructuredLogger::new(LogConfig {
            run_id: "r".to_string(),
            level: LogLevel::Warning,
            mode: LogMode::Silent,
        });
        assert!(logger.info("event", "message").is_none());
        assert!(logger.warning("event", "message").is_some());
    }

    #[test]
    fn payloads_are_redacted_before_the_record_is_built() {
        let logger = StructuredLogger::silent();
        let record = logger
            .emit(
                LogLevel::Info,
                "target.resolve",
                None,
                Some(payload(json!({
                    "password": "hunter2",
                    "uri": "db:pg://u:hunter2@host/db",
                }))),
            )
            .expect("record");
        let rendered = serde_json::to_string(&record.to_json()).expect("json");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains(sqlitch_redact::REDACTED_PLACEHOLDER));
    }

    #[test]
    fn json_form_uses_sorted_keys_and_required_fields() {
        let logger = StructuredLogger::silent();
        let record = logger
            .emit(LogLevel::Error, "deploy.fail", Some("boom"), None)
            .expect("record");
        let value = record.to_json();
        assert_eq!(value["level"], json!("ERROR"));
        assert_eq!(value["event"], json!("deploy.fail"));
        assert_eq!(value["message"], json!("boom"));
        assert_eq!(value["run_id"], json!("test"));
        assert!(value.get("data").is_none());
    }

    #[test]
    fn flags_map_onto_modes_and_levels() {
        let config = LogConfig::from_flags("r".into(), true, 0, false);
        assert_eq!(config.mode, LogMode::Json);

        let config = LogConfig::from_flags("r".into(), false, 1, false);
        assert_eq!(config.mode, LogMode::Human);
        assert_eq!(config.level, LogLevel::Info);

        let config = LogConfig::from_flags("r".into(), false, 3, false);
        assert_eq!(config.level, LogLevel::Trace);

        let config = LogConfig::from_flags("r".into(), false, 0, true);
        assert_eq!(config.mode, LogMode::Silent);
        assert_eq!(config.level, LogLevel::Error);
    }

    #[test]
    fn run_id_prefers_the_environment() {
        let env: BTreeMap<String, String> =
            [("SQLITCH_RUN_ID".to_string(), "run-42".to_string())].into();
        assert_eq!(generate_run_id(&env), "run-42");

        let generated = generate_run_id(&BTreeMap::new());
        assert_eq!(generated.len(), 12);
        assert!(generated.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
