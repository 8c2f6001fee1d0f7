//! Ticket selection through the external ticket store.
//!
//! The store is pluggable: `ticketQuery` and `completionCheck` are opaque
//! shell strings and their stdout is only ever tokenized, never parsed as
//! structured data. Every failure here degrades to "nothing found".

use crate::logger::Logger;
use crate::redact::sanitize_command;
use crate::ticket::{TicketDocument, is_valid_ticket_id, parse_show_output};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use tokio::process::Command;
use tracing::{debug, warn};

/// Source of workable tickets.
#[async_trait]
pub trait TicketSource: Send + Sync {
    /// The next ticket to work on, if any.
    async fn select(&self) -> Option<String>;

    /// All ready ticket ids, in store order.
    async fn list_ready(&self) -> Vec<String>;

    /// True when the completion check reports nothing left to do.
    async fn backlog_empty(&self) -> bool;

    /// Full ordered tag list for `id`.
    async fn tags(&self, id: &str) -> Vec<String>;

    /// Title of `id`, cached until [`TicketSource::reset_caches`].
    async fn title(&self, id: &str) -> Option<String>;

    /// Raw `show` document for `id`.
    async fn show(&self, id: &str) -> Option<TicketDocument>;

    /// Drops per-run caches. Called at loop start.
    fn reset_caches(&self);
}

/// [`TicketSource`] backed by shell commands run in the project root.
#[derive(Debug)]
pub struct ShellTicketSource {
    root: PathBuf,
    ticket_query: String,
    completion_check: String,
    show_command: String,
    titles: Mutex<HashMap<String, Option<String>>>,
    logger: Option<Logger>,
}

impl ShellTicketSource {
    pub fn new(
        root: impl Into<PathBuf>,
        ticket_query: impl Into<String>,
        completion_check: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            ticket_query: ticket_query.into(),
            completion_check: completion_check.into(),
            show_command: "tk show".to_string(),
            titles: Mutex::new(HashMap::new()),
            logger: None,
        }
    }

    /// Records every store command as a `command_executed` event.
    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Overrides the `tk show` prefix.
    pub fn with_show_command(mut self, command: impl Into<String>) -> Self {
        self.show_command = command.into();
        self
    }

    async fn run(&self, script: &str) -> Option<std::process::Output> {
        let result = Command::new("sh")
            .arg("-c")
            .arg(script)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;
        let command = sanitize_command(script);
        match result {
            Ok(output) => {
                let code = output.status.code();
                debug!(command = %command, code = ?code, "ticket store command finished");
                if let Some(logger) = &self.logger {
                    logger.log_command_executed(None, script, code);
                }
                Some(output)
            }
            Err(e) => {
                debug!(command = %command, error = %e, "ticket store command failed to spawn");
                None
            }
        }
    }

    /// First token of `text` when it is a usable ticket id.
    fn ticket_id(&self, text: &str) -> Option<String> {
        let token = first_token(text)?;
        if is_valid_ticket_id(&token) {
            return Some(token);
        }
        warn!(ticket = %token, "Ignoring invalid ticket id from ticket store");
        if let Some(logger) = &self.logger {
            logger.warn(
                "Ignoring invalid ticket id",
                &[("event", json!("invalid_ticket_id")), ("ticket", json!(token))],
            );
        }
        None
    }

    async fn stdout_of(&self, script: &str) -> Option<String> {
        let output = self.run(script).await?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl TicketSource for ShellTicketSource {
    async fn select(&self) -> Option<String> {
        let stdout = self.run(&self.ticket_query).await?.stdout;
        self.ticket_id(&String::from_utf8_lossy(&stdout))
    }

    async fn list_ready(&self) -> Vec<String> {
        let query = simplify_query(&self.ticket_query);
        let Some(output) = self.run(&query).await else {
            return Vec::new();
        };
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| self.ticket_id(line))
            .collect()
    }

    async fn backlog_empty(&self) -> bool {
        if self.completion_check.trim().is_empty() {
            return false;
        }
        match self.run(&self.completion_check).await {
            Some(output) => !output.status.success(),
            None => true,
        }
    }

    async fn tags(&self, id: &str) -> Vec<String> {
        self.show(id).await.map(|doc| doc.tags).unwrap_or_default()
    }

    async fn title(&self, id: &str) -> Option<String> {
        if let Some(cached) = self
            .titles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
        {
            return cached.clone();
        }
        let title = self.show(id).await.and_then(|doc| doc.title);
        self.titles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), title.clone());
        title
    }

    async fn show(&self, id: &str) -> Option<TicketDocument> {
        let script = format!("{} {}", self.show_command, shell_quote(id));
        let stdout = self.stdout_of(&script).await?;
        Some(parse_show_output(&stdout))
    }

    fn reset_caches(&self) {
        self.titles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// First whitespace-separated token of `text`.
pub fn first_token(text: &str) -> Option<String> {
    text.split_whitespace().next().map(str::to_string)
}

/// Strips trailing `| head ...` and `| awk ...` stages so the query lists
/// every ready ticket instead of picking one.
pub fn simplify_query(query: &str) -> String {
    let mut stages: Vec<&str> = query.split('|').collect();
    while stages.len() > 1 {
        let last = stages[stages.len() - 1].trim_start();
        if last.starts_with("head") || last.starts_with("awk") {
            stages.pop();
        } else {
            break;
        }
    }
    stages.join("|").trim().to_string()
}

fn shell_quote(value: &str) -> String {
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/'))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
