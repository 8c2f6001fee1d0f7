//! Single-writer lock for the Ralph loop.
//!
//! The lock file holds `{pid} {utc-timestamp}`. Its presence with a live pid
//! means a loop owns the journal; a dead pid marks a stale lock that the next
//! loop overwrites. The returned [`LockGuard`] removes the file when dropped,
//! so release runs on every exit path including panics and cancelled futures.

use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Errors from lock acquisition.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another Ralph loop (pid {pid}, started {since}) holds {path}")]
    Held {
        pid: u32,
        since: String,
        path: PathBuf,
    },

    #[error("failed to create lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Parsed lock file contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub pid: u32,
    pub timestamp: String,
}

impl LockInfo {
    pub fn parse(content: &str) -> Option<Self> {
        let mut parts = content.split_whitespace();
        let pid = parts.next()?.parse().ok()?;
        let timestamp = parts.next().unwrap_or_default().to_string();
        Some(Self { pid, timestamp })
    }

    /// Reads the lock at `path`, if any.
    pub fn read(path: &Path) -> Option<Self> {
        fs::read_to_string(path).ok().and_then(|c| Self::parse(&c))
    }
}

/// Holds the lock until dropped.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    pid: u32,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Only remove a lock we still own.
        match LockInfo::read(&self.path) {
            Some(info) if info.pid != self.pid => {
                warn!(path = %self.path.display(), owner = info.pid, "Lock taken over, leaving it in place");
            }
            _ => {
                if let Err(e) = fs::remove_file(&self.path)
                    && e.kind() != io::ErrorKind::NotFound
                {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove lock");
                }
            }
        }
    }
}

/// Acquires the lock at `path` for this process.
pub fn acquire(path: &Path) -> Result<LockGuard, LockError> {
    acquire_as(path, std::process::id())
}

/// Acquires the lock on behalf of `pid`.
pub fn acquire_as(path: &Path, pid: u32) -> Result<LockGuard, LockError> {
    let io_err = |source| LockError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    for _ in 0..2 {
        let content = format!("{pid} {}\n", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"));
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(content.as_bytes()).map_err(io_err)?;
                file.sync_all().map_err(io_err)?;
                debug!(path = %path.display(), pid, "Acquired loop lock");
                return Ok(LockGuard {
                    path: path.to_path_buf(),
                    pid,
                });
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                match LockInfo::read(path) {
                    Some(info) if info.pid != pid && is_pid_alive(info.pid) => {
                        return Err(LockError::Held {
                            pid: info.pid,
                            since: info.timestamp,
                            path: path.to_path_buf(),
                        });
                    }
                    stale => {
                        debug!(path = %path.display(), previous = ?stale, "Replacing stale lock");
                        match fs::remove_file(path) {
                            Ok(()) => {}
                            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                            Err(e) => return Err(io_err(e)),
                        }
                    }
                }
            }
            Err(e) => return Err(io_err(e)),
        }
    }

    // Lost the race to another process twice in a row.
    match LockInfo::read(path) {
        Some(info) => Err(LockError::Held {
            pid: info.pid,
            since: info.timestamp,
            path: path.to_path_buf(),
        }),
        None => Err(io_err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "lock file appeared concurrently",
        ))),
    }
}

/// Returns true if a process with `pid` exists.
#[cfg(unix)]
pub fn is_pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // Signal 0 probes without delivering anything. EPERM still means alive.
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
pub fn is_pid_alive(_pid: u32) -> bool {
    // Without a probe, assume alive
    true
}
