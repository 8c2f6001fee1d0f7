//! Structured, redacted logging for the Ralph loop.
//!
//! Records are single lines of the form
//!
//! ```text
//! 2026-01-04T10:11:12.345Z | INFO | event=ticket_start iteration=1 ticket=pt-abc | Starting ticket
//! ```
//!
//! A [`Logger`] is an explicit value. Child loggers created with
//! [`Logger::with_context`] share the parent's writer and level but carry an
//! extended context map, so per-ticket fields do not have to be repeated on
//! every call.

use crate::redact::{redact_fields, sanitize_command, sanitize_text};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

/// Log severity. Ordered `Debug < Info < Warn < Error`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Uppercase label used in emitted records.
    pub fn label(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Error returned when parsing an unknown level name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log level '{0}' (expected debug, info, warn or error)")]
pub struct ParseLevelError(pub String);

impl FromStr for LogLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(ParseLevelError(other.to_string())),
        }
    }
}

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Leveled logger with an inherited context map.
#[derive(Clone)]
pub struct Logger {
    level: LogLevel,
    context: BTreeMap<String, Value>,
    writer: SharedWriter,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("level", &self.level)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl Logger {
    /// Creates a logger writing to standard error.
    pub fn new(level: LogLevel) -> Self {
        Self::with_writer(level, io::stderr())
    }

    /// Creates a logger writing to the given sink.
    pub fn with_writer(level: LogLevel, writer: impl Write + Send + 'static) -> Self {
        Self {
            level,
            context: BTreeMap::new(),
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Returns a child logger sharing this logger's writer, with `fields`
    /// merged over the inherited context.
    pub fn with_context<I, K, V>(&self, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let mut context = self.context.clone();
        for (k, v) in fields {
            context.insert(k.into(), v.into());
        }
        Self {
            level: self.level,
            context,
            writer: Arc::clone(&self.writer),
        }
    }

    /// Returns a child logger with a different minimum level.
    pub fn with_level(&self, level: LogLevel) -> Self {
        Self {
            level,
            context: self.context.clone(),
            writer: Arc::clone(&self.writer),
        }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn context(&self) -> &BTreeMap<String, Value> {
        &self.context
    }

    /// Returns true if a record at `level` would be written.
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.level
    }

    pub fn debug(&self, message: &str, fields: &[(&str, Value)]) {
        self.log(LogLevel::Debug, message, fields);
    }

    pub fn info(&self, message: &str, fields: &[(&str, Value)]) {
        self.log(LogLevel::Info, message, fields);
    }

    pub fn warn(&self, message: &str, fields: &[(&str, Value)]) {
        self.log(LogLevel::Warn, message, fields);
    }

    pub fn error(&self, message: &str, fields: &[(&str, Value)]) {
        self.log(LogLevel::Error, message, fields);
    }

    /// Emits one record. Call-site fields override context fields with the
    /// same key. Write failures are swallowed: logging never aborts the loop.
    pub fn log(&self, level: LogLevel, message: &str, fields: &[(&str, Value)]) {
        if !self.enabled(level) {
            return;
        }

        let mut merged = self.context.clone();
        for (k, v) in fields {
            merged.insert((*k).to_string(), v.clone());
        }

        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let line = format_record(&timestamp, level, &redact_fields(&merged), message);

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = writeln!(writer, "{line}");
        let _ = writer.flush();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Named events. Each carries `event=<name>` so output is greppable.
    // ─────────────────────────────────────────────────────────────────────────

    pub fn log_loop_start(&self, mode: &str, max_iterations: u32, extra: &[(&str, Value)]) {
        let mut fields = vec![
            ("event", json!("loop_start")),
            ("mode", json!(mode)),
            ("max_iterations", json!(max_iterations)),
        ];
        fields.extend_from_slice(extra);
        self.info("Ralph loop starting", &fields);
    }

    pub fn log_loop_complete(&self, reason: &str, iterations: u32, completed: u32, failed: u32) {
        self.info(
            "Ralph loop complete",
            &[
                ("event", json!("loop_complete")),
                ("reason", json!(reason)),
                ("iterations", json!(iterations)),
                ("completed", json!(completed)),
                ("failed", json!(failed)),
            ],
        );
    }

    pub fn log_ticket_start(&self, ticket: &str, iteration: u32, title: Option<&str>) {
        let mut fields = vec![
            ("event", json!("ticket_start")),
            ("ticket", json!(ticket)),
            ("iteration", json!(iteration)),
        ];
        if let Some(title) = title {
            fields.push(("title", json!(title)));
        }
        self.info("Processing ticket", &fields);
    }

    /// Logs a ticket outcome. Failures are emitted at error level.
    pub fn log_ticket_complete(
        &self,
        ticket: &str,
        status: &str,
        iteration: u32,
        detail: Option<&str>,
    ) {
        let mut fields = vec![
            ("event", json!("ticket_complete")),
            ("ticket", json!(ticket)),
            ("status", json!(status)),
            ("iteration", json!(iteration)),
        ];
        if let Some(detail) = detail {
            fields.push(("detail", json!(detail)));
        }
        let level = if status.eq_ignore_ascii_case("complete") {
            LogLevel::Info
        } else {
            LogLevel::Error
        };
        self.log(level, "Ticket finished", &fields);
    }

    pub fn log_phase_transition(&self, ticket: &str, from: &str, to: &str) {
        self.info(
            "Phase transition",
            &[
                ("event", json!("phase_transition")),
                ("ticket", json!(ticket)),
                ("from", json!(from)),
                ("to", json!(to)),
            ],
        );
    }

    pub fn log_tool_execution(&self, tool: &str, ticket: Option<&str>, exit_code: Option<i32>) {
        let mut fields = vec![("event", json!("tool_execution")), ("tool", json!(tool))];
        if let Some(ticket) = ticket {
            fields.push(("ticket", json!(ticket)));
        }
        if let Some(code) = exit_code {
            fields.push(("exit_code", json!(code)));
        }
        self.debug("Tool executed", &fields);
    }

    pub fn log_decision(&self, decision: &str, reason: &str, extra: &[(&str, Value)]) {
        let mut fields = vec![
            ("event", json!("decision")),
            ("decision", json!(decision)),
            ("reason", json!(reason)),
        ];
        fields.extend_from_slice(extra);
        self.info("Decision", &fields);
    }

    /// Logs a failure summary naming the artifact that holds the details.
    pub fn log_error_summary(&self, ticket: Option<&str>, error: &str, artifact: Option<&Path>) {
        let mut fields = vec![
            ("event", json!("error_summary")),
            ("error", json!(sanitize_text(error))),
        ];
        if let Some(ticket) = ticket {
            fields.push(("ticket", json!(ticket)));
        }
        if let Some(path) = artifact {
            fields.push(("artifact", json!(path.display().to_string())));
        }
        let message = match artifact {
            Some(path) => format!("{error} (see {})", path.display()),
            None => error.to_string(),
        };
        self.error(&message, &fields);
    }

    pub fn log_no_ticket_selected(&self, reason: &str, iteration: u32) {
        self.info(
            "No ticket selected",
            &[
                ("event", json!("no_ticket_selected")),
                ("reason", json!(reason)),
                ("iteration", json!(iteration)),
            ],
        );
    }

    /// Logs a shell command after scrubbing secrets from it.
    pub fn log_command_executed(&self, ticket: Option<&str>, command: &str, exit_code: Option<i32>) {
        let mut fields = vec![
            ("event", json!("command_executed")),
            ("command", json!(sanitize_command(command))),
        ];
        if let Some(ticket) = ticket {
            fields.push(("ticket", json!(ticket)));
        }
        if let Some(code) = exit_code {
            fields.push(("exit_code", json!(code)));
        }
        self.debug("Command executed", &fields);
    }

    pub fn log_batch_selected(&self, tickets: &[String], components: &[String], reason: &str) {
        self.info(
            "Parallel batch selected",
            &[
                ("event", json!("batch_selected")),
                ("tickets", json!(tickets.join(","))),
                ("components", json!(components.join(","))),
                ("count", json!(tickets.len())),
                ("reason", json!(reason)),
            ],
        );
    }

    /// Logs a worktree add/remove. Failures are emitted at error level.
    pub fn log_worktree_operation(
        &self,
        ticket: &str,
        operation: &str,
        path: &Path,
        error: Option<&str>,
    ) {
        let mut fields = vec![
            ("event", json!("worktree")),
            ("ticket", json!(ticket)),
            ("operation", json!(operation)),
            ("path", json!(path.display().to_string())),
            ("success", json!(error.is_none())),
        ];
        match error {
            Some(err) => {
                fields.push(("error", json!(sanitize_text(err.trim()))));
                self.error("Worktree operation failed", &fields);
            }
            None => self.info("Worktree operation", &fields),
        }
    }
}

/// Formats one record line (without the trailing newline).
fn format_record(
    timestamp: &str,
    level: LogLevel,
    fields: &BTreeMap<String, Value>,
    message: &str,
) -> String {
    let mut line = format!("{timestamp} | {}", level.label());
    if !fields.is_empty() {
        let rendered: Vec<String> = fields
            .iter()
            .map(|(k, v)| format!("{k}={}", render_value(v)))
            .collect();
        line.push_str(" | ");
        line.push_str(&rendered.join(" "));
    }
    line.push_str(" | ");
    line.push_str(&sanitize_text(message));
    line
}

/// Renders a field value. Strings containing whitespace are quoted; other
/// values use compact JSON.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => {
            if s.is_empty() || s.chars().any(char::is_whitespace) {
                format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
            } else {
                s.clone()
            }
        }
        other => other.to_string(),
    }
}
