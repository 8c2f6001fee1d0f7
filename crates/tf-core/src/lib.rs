//! # tf-core
//!
//! Core of the Ticketflow Ralph loop.
//!
//! This crate provides:
//! - The loop orchestrator, in serial and parallel (worktree) modes
//! - Layered configuration and the structured, redacting logger
//! - Ticket selection through shell queries
//! - The progress journal, lessons file and single-writer lock
//! - The planning session store and the ticket board classifier
//!
//! The agent subprocess itself sits behind [`AgentRunner`]; see `tf-adapters`
//! for the `pi` implementation.

pub mod agent;
pub mod artifacts;
pub mod atomic;
pub mod board;
pub mod config;
pub mod lessons;
pub mod logger;
pub mod loop_lock;
pub mod paths;
pub mod progress;
pub mod progress_indicator;
mod ralph_loop;
pub mod redact;
pub mod session_store;
pub mod testing;
pub mod ticket;
pub mod ticket_source;
pub mod worktree;

pub use agent::{
    AgentError, AgentRequest, AgentRunner, AttemptOutcome, OutputPlan, TIMEOUT_EXIT_CODE,
    TIMEOUT_SENTINEL,
};
pub use artifacts::{CloseSummary, IssueCounts, TicketArtifacts, read_artifacts};
pub use board::{Board, BoardCounts, BoardEntry, BoardTicket, Column, classify};
pub use config::{
    ConfigError, ConfigLayer, LoadedConfig, PiOutput, RalphConfig, SessionDirResolution,
    SessionDirSetting,
};
pub use lessons::LessonsFile;
pub use logger::{LogLevel, Logger, ParseLevelError};
pub use loop_lock::{LockError, LockGuard, LockInfo};
pub use paths::ProjectPaths;
pub use progress::{
    JournalSnapshot, JournalStatus, ProgressError, ProgressJournal, TicketRecord, TicketStatus,
};
pub use progress_indicator::ProgressIndicator;
pub use ralph_loop::{
    COMPLETION_PROMISE, CompletionReason, LoopError, LoopOptions, LoopOutcome, RalphLoop,
    UNTAGGED_COMPONENT, select_batch,
};
pub use session_store::{PlanningSession, SessionError, SessionState, SessionStore};
pub use ticket::{TicketDocument, TicketRef};
pub use ticket_source::{ShellTicketSource, TicketSource};
pub use worktree::{GitWorktrees, WorktreeError, WorktreeManager, WorktreeRemoval};
