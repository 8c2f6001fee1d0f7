//! Parsing of the artifacts the agent leaves under
//! `{knowledgeDir}/tickets/{id}/`.

use crate::paths::ticket_artifact_dir;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

pub const CLOSE_SUMMARY_FILE: &str = "close-summary.md";
pub const REVIEW_FILE: &str = "review.md";

static SUMMARY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:[-*]\s+)?\**Summary\**:\**\s*(.+?)\s*$").unwrap());

static COMMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:[-*]\s+)?\**Commit\**:\**\s*(.+?)\s*$").unwrap());

static LESSONS_HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^#{2,3}\s+.*lessons\s+learned").unwrap());

static H2_H3_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#{2,3}\s").unwrap());

static ISSUE_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(critical|major|minor)\s*:\s*(\d+)").unwrap());

/// Review findings by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IssueCounts {
    pub critical: u32,
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for IssueCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Critical({})/Major({})/Minor({})",
            self.critical, self.major, self.minor
        )
    }
}

/// Fields extracted from `close-summary.md`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseSummary {
    pub summary: Option<String>,
    pub commit: Option<String>,
    /// Body of the "Lessons Learned" section, trailing whitespace removed.
    pub lessons: Option<String>,
}

/// Everything the journal and lessons file need from one ticket.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TicketArtifacts {
    pub close: CloseSummary,
    pub issues: IssueCounts,
}

pub fn parse_close_summary(text: &str) -> CloseSummary {
    let capture = |re: &Regex| {
        re.captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim_end_matches('*').trim().to_string())
            .filter(|s| !s.is_empty())
    };
    CloseSummary {
        summary: capture(&SUMMARY_RE),
        commit: capture(&COMMIT_RE),
        lessons: extract_lessons(text),
    }
}

/// Lines between a "Lessons Learned" H2/H3 heading and the next H2/H3.
pub fn extract_lessons(text: &str) -> Option<String> {
    let mut lines = text.lines();
    lines.by_ref().find(|l| LESSONS_HEADING_RE.is_match(l))?;

    let block: Vec<&str> = lines.take_while(|l| !H2_H3_RE.is_match(l)).collect();
    let joined = block.join("\n");
    let trimmed = joined.trim_start_matches(['\n', '\r']).trim_end();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// First `Critical: n`, `Major: n` and `Minor: n` occurrences.
pub fn parse_review(text: &str) -> IssueCounts {
    let mut counts = IssueCounts::default();
    let mut seen = [false; 3];
    for cap in ISSUE_COUNT_RE.captures_iter(text) {
        let slot = match cap[1].to_ascii_lowercase().as_str() {
            "critical" => 0,
            "major" => 1,
            _ => 2,
        };
        if seen[slot] {
            continue;
        }
        let Ok(n) = cap[2].parse::<u32>() else {
            continue;
        };
        seen[slot] = true;
        match slot {
            0 => counts.critical = n,
            1 => counts.major = n,
            _ => counts.minor = n,
        }
    }
    counts
}

/// Reads both artifacts for `ticket`. Missing files yield empty fields.
pub fn read_artifacts(knowledge_dir: &Path, ticket: &str) -> TicketArtifacts {
    let dir = ticket_artifact_dir(knowledge_dir, ticket);
    let close = std::fs::read_to_string(dir.join(CLOSE_SUMMARY_FILE))
        .map(|t| parse_close_summary(&t))
        .unwrap_or_default();
    let issues = std::fs::read_to_string(dir.join(REVIEW_FILE))
        .map(|t| parse_review(&t))
        .unwrap_or_default();
    TicketArtifacts { close, issues }
}

/// Path of the close summary for `ticket`, used in failure messages.
pub fn close_summary_path(knowledge_dir: &Path, ticket: &str) -> PathBuf {
    ticket_artifact_dir(knowledge_dir, ticket).join(CLOSE_SUMMARY_FILE)
}
