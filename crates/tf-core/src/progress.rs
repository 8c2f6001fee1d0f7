//! The progress journal at `.tf/ralph/progress.md`.
//!
//! The journal is markdown meant for humans that the loop also reads back.
//! It always carries three sections:
//!
//! ```text
//! # Ralph Loop Progress
//!
//! ## Current State
//!
//! - Status: RUNNING
//! - Current ticket: (none)
//! - Started: 2026-01-04T10:11:12Z
//! - Last updated: 2026-01-04T10:20:00Z
//!
//! ## Statistics
//!
//! - Tickets completed: 1
//! - Tickets failed: 0
//! - Total iterations: 1
//!
//! ## History
//!
//! <!-- Auto-appended entries below -->
//! - pt-A: COMPLETE (2026-01-04T10:20:00Z)
//!   - Summary: Did A
//!   - Issues: Critical(0)/Major(0)/Minor(0)
//!   - Status: COMPLETE
//! ```
//!
//! New history entries go directly under the sentinel, so the file reads
//! newest-first. Every mutation is a full atomic rewrite.

use crate::artifacts::IssueCounts;
use crate::atomic::write_atomic_str;
use chrono::Utc;
use regex::Regex;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

pub const HISTORY_SENTINEL: &str = "<!-- Auto-appended entries below -->";

const STATUS_PREFIX: &str = "- Status:";
const CURRENT_TICKET_PREFIX: &str = "- Current ticket:";
const STARTED_PREFIX: &str = "- Started:";
const LAST_UPDATED_PREFIX: &str = "- Last updated:";
const COMPLETED_PREFIX: &str = "- Tickets completed:";
const FAILED_PREFIX: &str = "- Tickets failed:";
const ITERATIONS_PREFIX: &str = "- Total iterations:";

const NO_TICKET: &str = "(none)";
const NOT_STARTED: &str = "(not started)";
const NEVER: &str = "(never)";

const SECTIONS: [&str; 3] = ["## Current State", "## Statistics", "## History"];

static COMPLETED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^- Tickets completed:\s*(\d+)").unwrap());
static FAILED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^- Tickets failed:\s*(\d+)").unwrap());
static ITERATIONS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^- Total iterations:\s*(\d+)").unwrap());
static ENTRY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^- (\S+): ([A-Z_]+) \((.+)\)\s*$").unwrap());

/// Errors from journal reads and writes.
#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed progress journal {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

/// Value of the journal's Status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalStatus {
    Running,
    Complete,
    Failed,
}

impl fmt::Display for JournalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "RUNNING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        })
    }
}

/// Outcome of a single ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketStatus {
    Complete,
    Failed,
}

impl TicketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data for one history entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketRecord {
    pub id: String,
    pub status: TicketStatus,
    pub summary: Option<String>,
    pub issues: IssueCounts,
    pub commit: Option<String>,
    pub error: Option<String>,
}

impl TicketRecord {
    pub fn new(id: impl Into<String>, status: TicketStatus) -> Self {
        Self {
            id: id.into(),
            status,
            summary: None,
            issues: IssueCounts::default(),
            commit: None,
            error: None,
        }
    }

    fn render(&self, timestamp: &str) -> String {
        let mut out = format!("- {}: {} ({timestamp})\n", self.id, self.status);
        let summary = self.summary.as_deref().unwrap_or("(no summary)");
        out.push_str(&format!("  - Summary: {}\n", one_line(summary)));
        out.push_str(&format!("  - Issues: {}\n", self.issues));
        out.push_str(&format!("  - Status: {}\n", self.status));
        if let Some(commit) = &self.commit {
            out.push_str(&format!("  - Commit: {}\n", one_line(commit)));
        }
        if let Some(error) = &self.error {
            out.push_str(&format!("  - Error: {}\n", one_line(error)));
        }
        out
    }
}

/// A history entry read back from disk.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HistoryEntry {
    pub id: String,
    pub status: String,
    pub timestamp: String,
    pub summary: Option<String>,
    pub issues: Option<String>,
    pub commit: Option<String>,
    pub error: Option<String>,
}

/// Parsed journal contents.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JournalSnapshot {
    pub status: String,
    pub current_ticket: Option<String>,
    pub started: Option<String>,
    pub last_updated: Option<String>,
    pub completed: u32,
    pub failed: u32,
    pub iterations: u32,
    /// Oldest first.
    pub history: Vec<HistoryEntry>,
}

/// Handle on the journal file. Only the orchestrator writes through it.
#[derive(Debug, Clone)]
pub struct ProgressJournal {
    path: PathBuf,
}

impl ProgressJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The canonical empty journal.
    pub fn template() -> String {
        format!(
            "# Ralph Loop Progress\n\n\
             ## Current State\n\n\
             {STATUS_PREFIX} RUNNING\n\
             {CURRENT_TICKET_PREFIX} {NO_TICKET}\n\
             {STARTED_PREFIX} {NOT_STARTED}\n\
             {LAST_UPDATED_PREFIX} {NEVER}\n\n\
             ## Statistics\n\n\
             {COMPLETED_PREFIX} 0\n\
             {FAILED_PREFIX} 0\n\
             {ITERATIONS_PREFIX} 0\n\n\
             ## History\n\n\
             {HISTORY_SENTINEL}\n"
        )
    }

    /// Writes the template if the journal does not exist yet.
    pub fn ensure(&self) -> Result<(), ProgressError> {
        if self.path.exists() {
            return Ok(());
        }
        self.write(&Self::template())
    }

    /// Records a finished ticket: bumps counters, refreshes Current State
    /// and inserts a history entry under the sentinel.
    pub fn update(&self, record: &TicketRecord) -> Result<(), ProgressError> {
        self.ensure()?;
        let text = self.read()?;
        let now = timestamp();

        let mut completed = read_counter(&COMPLETED_RE, &text);
        let mut failed = read_counter(&FAILED_RE, &text);
        let iterations = read_counter(&ITERATIONS_RE, &text) + 1;
        match record.status {
            TicketStatus::Complete => completed += 1,
            TicketStatus::Failed => failed += 1,
        }

        let entry = record.render(&now);
        let mut out = String::with_capacity(text.len() + entry.len());
        let mut inserted = false;
        for line in text.lines() {
            let rewritten = if line.starts_with(STATUS_PREFIX) {
                format!("{STATUS_PREFIX} {}", JournalStatus::Running)
            } else if line.starts_with(CURRENT_TICKET_PREFIX) {
                format!("{CURRENT_TICKET_PREFIX} {NO_TICKET}")
            } else if let Some(value) = line.strip_prefix(STARTED_PREFIX) {
                if is_placeholder(value) {
                    format!("{STARTED_PREFIX} {now}")
                } else {
                    line.to_string()
                }
            } else if line.starts_with(LAST_UPDATED_PREFIX) {
                format!("{LAST_UPDATED_PREFIX} {now}")
            } else if line.starts_with(COMPLETED_PREFIX) {
                format!("{COMPLETED_PREFIX} {completed}")
            } else if line.starts_with(FAILED_PREFIX) {
                format!("{FAILED_PREFIX} {failed}")
            } else if line.starts_with(ITERATIONS_PREFIX) {
                format!("{ITERATIONS_PREFIX} {iterations}")
            } else {
                line.to_string()
            };
            out.push_str(&rewritten);
            out.push('\n');

            if !inserted && line.trim() == HISTORY_SENTINEL {
                out.push_str(&entry);
                inserted = true;
            }
        }
        if !inserted {
            if !out.ends_with("\n\n") {
                out.push('\n');
            }
            out.push_str(&entry);
        }

        self.write(&out)
    }

    /// Rewrites only the Status line.
    pub fn set_state(&self, status: JournalStatus) -> Result<(), ProgressError> {
        self.ensure()?;
        let text = self.read()?;
        let updated = replace_first_line(&text, STATUS_PREFIX, &status.to_string());
        self.write(&updated)
    }

    /// Rewrites the Current ticket line (and Last updated).
    pub fn set_current_ticket(&self, ticket: Option<&str>) -> Result<(), ProgressError> {
        self.ensure()?;
        let text = self.read()?;
        let updated = replace_first_line(&text, CURRENT_TICKET_PREFIX, ticket.unwrap_or(NO_TICKET));
        let updated = replace_first_line(&updated, LAST_UPDATED_PREFIX, &timestamp());
        self.write(&updated)
    }

    /// Reads the journal back.
    pub fn snapshot(&self) -> Result<JournalSnapshot, ProgressError> {
        let text = self.read()?;
        parse_journal(&text).map_err(|reason| ProgressError::Malformed {
            path: self.path.clone(),
            reason,
        })
    }

    fn read(&self) -> Result<String, ProgressError> {
        std::fs::read_to_string(&self.path).map_err(|source| ProgressError::Read {
            path: self.path.clone(),
            source,
        })
    }

    fn write(&self, text: &str) -> Result<(), ProgressError> {
        write_atomic_str(&self.path, text).map_err(|source| ProgressError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

/// Parses journal text. Fails if a required section is missing.
pub fn parse_journal(text: &str) -> Result<JournalSnapshot, String> {
    for section in SECTIONS {
        if !text.lines().any(|l| l.trim_end() == section) {
            return Err(format!("missing section '{section}'"));
        }
    }

    let field = |prefix: &str| {
        text.lines()
            .find_map(|l| l.strip_prefix(prefix))
            .map(|v| v.trim().to_string())
    };
    let optional = |prefix: &str| field(prefix).filter(|v| !is_placeholder(v));

    let mut history = Vec::new();
    let mut in_history = false;
    for line in text.lines() {
        if line.trim_end() == SECTIONS[2] {
            in_history = true;
            continue;
        }
        if !in_history {
            continue;
        }
        if let Some(cap) = ENTRY_RE.captures(line) {
            history.push(HistoryEntry {
                id: cap[1].to_string(),
                status: cap[2].to_string(),
                timestamp: cap[3].to_string(),
                ..HistoryEntry::default()
            });
            continue;
        }
        let Some(entry) = history.last_mut() else {
            continue;
        };
        let detail = line.trim_start();
        if let Some(v) = detail.strip_prefix("- Summary:") {
            entry.summary = Some(v.trim().to_string());
        } else if let Some(v) = detail.strip_prefix("- Issues:") {
            entry.issues = Some(v.trim().to_string());
        } else if let Some(v) = detail.strip_prefix("- Commit:") {
            entry.commit = Some(v.trim().to_string());
        } else if let Some(v) = detail.strip_prefix("- Error:") {
            entry.error = Some(v.trim().to_string());
        }
    }
    // File order is newest-first
    history.reverse();

    Ok(JournalSnapshot {
        status: field(STATUS_PREFIX).unwrap_or_default(),
        current_ticket: optional(CURRENT_TICKET_PREFIX),
        started: optional(STARTED_PREFIX),
        last_updated: optional(LAST_UPDATED_PREFIX),
        completed: read_counter(&COMPLETED_RE, text),
        failed: read_counter(&FAILED_RE, text),
        iterations: read_counter(&ITERATIONS_RE, text),
        history,
    })
}

fn read_counter(re: &Regex, text: &str) -> u32 {
    re.captures(text)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0)
}

fn is_placeholder(value: &str) -> bool {
    let v = value.trim();
    v.is_empty() || (v.starts_with('(') && v.ends_with(')'))
}

/// Replaces the value of the first line starting with `prefix`. Later lines
/// with the same prefix (e.g. indented history detail) are untouched.
fn replace_first_line(text: &str, prefix: &str, value: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut done = false;
    for line in text.lines() {
        if !done && line.starts_with(prefix) {
            out.push_str(&format!("{prefix} {value}"));
            done = true;
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
