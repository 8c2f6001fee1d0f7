//! Kanban-style classification of tickets by status and dependencies.
//!
//! Placement depends only on a ticket's own status and the statuses of its
//! dependencies:
//!
//! | status        | deps                  | column      |
//! |---------------|-----------------------|-------------|
//! | `closed`      | any                   | CLOSED      |
//! | anything else | any dep not closed    | BLOCKED     |
//! | `in_progress` | all closed            | IN_PROGRESS |
//! | other         | all closed            | READY       |
//!
//! A dependency on an unknown id counts as not closed, and so does a
//! dependency on the ticket itself. Unrecognized statuses land in READY.

use crate::ticket::parse_show_output;
use std::collections::HashMap;
use std::fmt;

/// Board column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Ready,
    Blocked,
    InProgress,
    Closed,
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ready => "READY",
            Self::Blocked => "BLOCKED",
            Self::InProgress => "IN_PROGRESS",
            Self::Closed => "CLOSED",
        })
    }
}

/// Input to the classifier.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BoardTicket {
    pub id: String,
    pub status: String,
    pub deps: Vec<String>,
    pub title: Option<String>,
}

impl BoardTicket {
    pub fn new(id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: status.into(),
            ..Self::default()
        }
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Builds a ticket from `tk show` output. A missing status reads as `open`.
    pub fn from_show_output(id: &str, text: &str) -> Self {
        let doc = parse_show_output(text);
        Self {
            id: id.to_string(),
            status: doc.status.unwrap_or_else(|| "open".to_string()),
            deps: doc.deps,
            title: doc.title,
        }
    }

    fn normalized_status(&self) -> String {
        self.status.trim().to_ascii_lowercase()
    }
}

/// A classified ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardEntry {
    pub ticket: BoardTicket,
    pub column: Column,
    /// Dependencies that keep the ticket blocked, in declaration order.
    pub blocking_deps: Vec<String>,
}

/// Per-column counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoardCounts {
    pub ready: usize,
    pub blocked: usize,
    pub in_progress: usize,
    pub closed: usize,
}

/// Classified tickets, each column in input order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Board {
    pub ready: Vec<BoardEntry>,
    pub blocked: Vec<BoardEntry>,
    pub in_progress: Vec<BoardEntry>,
    pub closed: Vec<BoardEntry>,
}

impl Board {
    pub fn counts(&self) -> BoardCounts {
        BoardCounts {
            ready: self.ready.len(),
            blocked: self.blocked.len(),
            in_progress: self.in_progress.len(),
            closed: self.closed.len(),
        }
    }

    pub fn column(&self, column: Column) -> &[BoardEntry] {
        match column {
            Column::Ready => &self.ready,
            Column::Blocked => &self.blocked,
            Column::InProgress => &self.in_progress,
            Column::Closed => &self.closed,
        }
    }

    /// Looks up where `id` landed.
    pub fn entry(&self, id: &str) -> Option<&BoardEntry> {
        [&self.ready, &self.blocked, &self.in_progress, &self.closed]
            .into_iter()
            .flatten()
            .find(|e| e.ticket.id == id)
    }
}

/// Places every ticket in a column.
pub fn classify(tickets: &[BoardTicket]) -> Board {
    let statuses: HashMap<&str, String> = tickets
        .iter()
        .map(|t| (t.id.as_str(), t.normalized_status()))
        .collect();

    let mut board = Board::default();
    for ticket in tickets {
        let status = ticket.normalized_status();
        let blocking_deps: Vec<String> = if status == "closed" {
            Vec::new()
        } else {
            ticket
                .deps
                .iter()
                .filter(|dep| statuses.get(dep.as_str()).is_none_or(|s| s != "closed"))
                .cloned()
                .collect()
        };

        let column = if status == "closed" {
            Column::Closed
        } else if !blocking_deps.is_empty() {
            Column::Blocked
        } else if status == "in_progress" {
            Column::InProgress
        } else {
            Column::Ready
        };

        let entry = BoardEntry {
            ticket: ticket.clone(),
            column,
            blocking_deps,
        };
        match column {
            Column::Ready => board.ready.push(entry),
            Column::Blocked => board.blocked.push(entry),
            Column::InProgress => board.in_progress.push(entry),
            Column::Closed => board.closed.push(entry),
        }
    }
    board
}
