//! Planning session store.
//!
//! A planning session links a seed topic to the spikes, plan and backlog
//! produced while planning it. At most one session is active at a time:
//!
//! ```text
//! {sessionDir}/
//! ├── .active-planning.json          # the active session, if any
//! └── sessions/
//!     └── {seed}@{timestamp}.json    # archived and completed sessions
//! ```
//!
//! Starting or resuming a session archives the current one first. All writes
//! are atomic.

use crate::atomic::write_atomic_str;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const SCHEMA_VERSION: u32 = 1;
pub const ACTIVE_FILE: &str = ".active-planning.json";
pub const SESSIONS_SUBDIR: &str = "sessions";

const ID_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%SZ";

/// Error type for session store operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("No active planning session")]
    NoActiveSession,

    #[error("Session {0} has no backlog; set one first")]
    NoBacklog(String),
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Archived,
    Completed,
}

/// Backlog produced by a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBacklog {
    pub topic: String,
    /// Reference to the backlog document.
    pub backlog: String,
    /// Created ticket ids, without duplicates.
    #[serde(default)]
    pub tickets: Vec<String>,
}

/// One planning session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanningSession {
    pub schema_version: u32,
    pub session_id: String,
    pub state: SessionState,
    pub root_seed: String,
    #[serde(default)]
    pub spikes: Vec<String>,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub backlog: Option<SessionBacklog>,
    pub created: String,
    pub updated: String,
    #[serde(default)]
    pub completed_at: Option<String>,
}

impl PlanningSession {
    fn new(seed: &str, now: DateTime<Utc>) -> Self {
        let ts = iso(now);
        Self {
            schema_version: SCHEMA_VERSION,
            session_id: generate_session_id(seed, now),
            state: SessionState::Active,
            root_seed: seed.to_string(),
            spikes: Vec::new(),
            plan: None,
            backlog: None,
            created: ts.clone(),
            updated: ts,
            completed_at: None,
        }
    }

    fn touch(&mut self) {
        self.updated = iso(Utc::now());
    }
}

/// Builds `{seed}@{UTC timestamp}` with second precision. The store adds a
/// `-N` suffix when that id is already taken.
pub fn generate_session_id(seed: &str, at: DateTime<Utc>) -> String {
    format!("{seed}@{}", at.format(ID_TIMESTAMP_FORMAT))
}

/// Splits a session id back into seed and timestamp, ignoring any `-N`
/// collision suffix.
pub fn parse_session_id(id: &str) -> Option<(String, DateTime<Utc>)> {
    let (seed, ts) = id.rsplit_once('@')?;
    let stamp = match ts.rsplit_once("Z-") {
        Some((stamp, n)) if n.parse::<u32>().is_ok() => &ts[..=stamp.len()],
        _ => ts,
    };
    let naive = NaiveDateTime::parse_from_str(stamp, ID_TIMESTAMP_FORMAT).ok()?;
    Some((seed.to_string(), naive.and_utc()))
}

fn iso(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn push_unique(list: &mut Vec<String>, id: &str) -> bool {
    if list.iter().any(|x| x == id) {
        return false;
    }
    list.push(id.to_string());
    true
}

/// File-backed session store rooted at the resolved session directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn active_path(&self) -> PathBuf {
        self.dir.join(ACTIVE_FILE)
    }

    pub fn archive_path(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(SESSIONS_SUBDIR)
            .join(format!("{session_id}.json"))
    }

    /// Reads the active session. Absent or schema-mismatched files are `None`.
    pub fn load_active(&self) -> Result<Option<PlanningSession>, SessionError> {
        self.read(&self.active_path())
    }

    /// Opens a new session on `seed`, archiving any active one.
    pub fn start(&self, seed: &str) -> Result<PlanningSession, SessionError> {
        self.start_at(seed, Utc::now())
    }

    fn start_at(&self, seed: &str, now: DateTime<Utc>) -> Result<PlanningSession, SessionError> {
        self.archive()?;
        let mut session = PlanningSession::new(seed, now);
        session.session_id = self.unused_id(&session.session_id);
        self.write_active(&session)?;
        debug!(session_id = %session.session_id, "Started planning session");
        Ok(session)
    }

    /// `base`, or `base-2`, `base-3`, ... when an archived session holds it.
    fn unused_id(&self, base: &str) -> String {
        let mut id = base.to_string();
        let mut n = 2u32;
        while self.archive_path(&id).exists() {
            id = format!("{base}-{n}");
            n += 1;
        }
        id
    }

    /// Adds a spike topic. Re-adding is a no-op.
    pub fn add_spike(&self, spike: &str) -> Result<PlanningSession, SessionError> {
        self.modify_active(|s| {
            if push_unique(&mut s.spikes, spike) {
                s.touch();
            }
            Ok(())
        })
    }

    pub fn set_plan(&self, plan: &str) -> Result<PlanningSession, SessionError> {
        self.modify_active(|s| {
            s.plan = Some(plan.to_string());
            s.touch();
            Ok(())
        })
    }

    /// Sets the backlog topic and document, keeping already recorded tickets.
    pub fn set_backlog(&self, topic: &str, backlog: &str) -> Result<PlanningSession, SessionError> {
        self.modify_active(|s| {
            let tickets = s.backlog.take().map(|b| b.tickets).unwrap_or_default();
            s.backlog = Some(SessionBacklog {
                topic: topic.to_string(),
                backlog: backlog.to_string(),
                tickets,
            });
            s.touch();
            Ok(())
        })
    }

    /// Records created ticket ids on the backlog, skipping duplicates.
    pub fn add_backlog_tickets(&self, tickets: &[&str]) -> Result<PlanningSession, SessionError> {
        self.modify_active(|s| {
            let session_id = s.session_id.clone();
            let backlog = s
                .backlog
                .as_mut()
                .ok_or(SessionError::NoBacklog(session_id))?;
            let mut changed = false;
            for t in tickets {
                changed |= push_unique(&mut backlog.tickets, t);
            }
            if changed {
                s.touch();
            }
            Ok(())
        })
    }

    /// Moves the active session to `sessions/` as archived. Succeeds without
    /// touching anything when no session is active.
    pub fn archive(&self) -> Result<Option<PlanningSession>, SessionError> {
        self.close_active(SessionState::Archived)
    }

    /// Moves the active session to `sessions/` as completed.
    pub fn complete(&self) -> Result<Option<PlanningSession>, SessionError> {
        self.close_active(SessionState::Completed)
    }

    /// Re-promotes an archived session to active, archiving the current one.
    pub fn resume(&self, session_id: &str) -> Result<PlanningSession, SessionError> {
        let archived_path = self.archive_path(session_id);
        let mut session = self
            .read(&archived_path)?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        if let Some(active) = self.load_active()?
            && active.session_id != session_id
        {
            self.archive()?;
        }

        session.state = SessionState::Active;
        session.completed_at = None;
        session.touch();
        self.write_active(&session)?;
        remove_if_present(&archived_path)?;
        debug!(session_id, "Resumed planning session");
        Ok(session)
    }

    /// Archived and completed sessions, oldest first.
    pub fn list_archived(&self) -> Result<Vec<PlanningSession>, SessionError> {
        let dir = self.dir.join(SESSIONS_SUBDIR);
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut sessions = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match self.read(&path) {
                Ok(Some(s)) => sessions.push(s),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable session {}: {}", path.display(), e),
            }
        }
        sessions.sort_by(|a, b| {
            a.created
                .cmp(&b.created)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(sessions)
    }

    fn close_active(&self, state: SessionState) -> Result<Option<PlanningSession>, SessionError> {
        let Some(mut session) = self.load_active()? else {
            return Ok(None);
        };
        session.state = state;
        session.touch();
        if state == SessionState::Completed {
            session.completed_at = Some(session.updated.clone());
        }
        // Archive copy lands before the active file goes away
        self.write_json(&self.archive_path(&session.session_id), &session)?;
        remove_if_present(&self.active_path())?;
        debug!(session_id = %session.session_id, ?state, "Closed planning session");
        Ok(Some(session))
    }

    fn modify_active<F>(&self, f: F) -> Result<PlanningSession, SessionError>
    where
        F: FnOnce(&mut PlanningSession) -> Result<(), SessionError>,
    {
        let mut session = self.load_active()?.ok_or(SessionError::NoActiveSession)?;
        f(&mut session)?;
        self.write_active(&session)?;
        Ok(session)
    }

    fn write_active(&self, session: &PlanningSession) -> Result<(), SessionError> {
        self.write_json(&self.active_path(), session)
    }

    fn write_json(&self, path: &Path, session: &PlanningSession) -> Result<(), SessionError> {
        let mut json = serde_json::to_string_pretty(session)?;
        json.push('\n');
        write_atomic_str(path, &json)?;
        Ok(())
    }

    fn read(&self, path: &Path) -> Result<Option<PlanningSession>, SessionError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value: serde_json::Value = serde_json::from_str(&content)?;
        let version = value.get("schema_version").and_then(serde_json::Value::as_u64);
        if version != Some(u64::from(SCHEMA_VERSION)) {
            debug!(path = %path.display(), ?version, "Ignoring session with other schema version");
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
