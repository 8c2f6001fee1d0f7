//! Crash-safe file replacement.
//!
//! Content is written to `.{name}.tmp-XXXX` in the target's directory, synced,
//! then renamed over the target. On unix the directory is fsynced afterwards
//! so the rename itself is durable. Readers observe either the old or the new
//! file, never a partial one.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Atomically replaces `path` with `contents`, creating parent directories.
///
/// On failure the temporary file is removed and the original is untouched.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a file path: {}", path.display()),
            )
        })?;

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{name}.tmp-"))
        .tempfile_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    // A failed persist hands the temp file back; dropping it unlinks it.
    tmp.persist(path).map_err(|e| e.error)?;

    sync_dir(dir);
    Ok(())
}

/// Convenience wrapper for string content.
pub fn write_atomic_str(path: &Path, contents: &str) -> io::Result<()> {
    write_atomic(path, contents.as_bytes())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    match fs::File::open(dir) {
        Ok(handle) => {
            if let Err(e) = handle.sync_all() {
                tracing::debug!("fsync of {} failed: {}", dir.display(), e);
            }
        }
        Err(e) => tracing::debug!("open of {} for fsync failed: {}", dir.display(), e),
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
