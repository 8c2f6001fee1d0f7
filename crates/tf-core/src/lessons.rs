//! Append-only lessons file (`.tf/ralph/AGENTS.md`).
//!
//! Blocks extracted from close summaries are appended under a heading naming
//! the source ticket. The file is created from a small template on first use
//! and never rewritten afterwards.

use crate::atomic::write_atomic_str;
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const TEMPLATE: &str = "# Ralph Lessons Learned\n\n## Patterns\n\n## Gotchas\n";

/// Handle on the lessons file.
#[derive(Debug, Clone)]
pub struct LessonsFile {
    path: PathBuf,
}

impl LessonsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `block` for `ticket`. Returns `false` without touching the
    /// filesystem when the block is blank.
    pub fn append(&self, ticket: &str, block: &str) -> io::Result<bool> {
        let block = block.trim_end();
        if block.trim().is_empty() {
            return Ok(false);
        }

        if !self.path.exists() {
            write_atomic_str(&self.path, TEMPLATE)?;
        }

        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        write!(file, "\n## Lesson from {ticket} ({timestamp})\n\n{block}\n")?;
        file.sync_all()?;
        Ok(true)
    }
}
