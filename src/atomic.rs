// Atomic file replacement via temp file + rename

use eyre::{Context, Result};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use tracing::{debug, error, warn};

/// Write `bytes` to `path` without ever exposing a partially written file.
///
/// The bytes land in `temp_path` first (any stale temp file is removed), are
/// flushed with `sync_all`, and the temp file is then renamed over `path`.
/// `rename` replaces the destination atomically, so `path` holds either the
/// previous complete content or the new complete content at every instant.
///
/// If the rename fails, `path` is untouched and `temp_path` is left in place.
pub fn write_atomic(path: &Path, temp_path: &Path, bytes: &[u8]) -> Result<()> {
    write_atomic_with(path, temp_path, bytes, |from, to| fs::rename(from, to))
}

pub(crate) fn write_atomic_with<F>(path: &Path, temp_path: &Path, bytes: &[u8], promote: F) -> Result<()>
where
    F: FnOnce(&Path, &Path) -> io::Result<()>,
{
    prepare_temp(temp_path)?;

    let mut file = File::create(temp_path).context(format!("Failed to create temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .context(format!("Failed to write temp file {}", temp_path.display()))?;
    file.sync_all()
        .context(format!("Failed to flush temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(e) = promote(temp_path, path) {
        error!(
            temp = %temp_path.display(),
            path = %path.display(),
            error = ?e,
            "Failed to rename temp file, leaving it in place"
        );
        return Err(e).context(format!("Failed to rename {} to {}", temp_path.display(), path.display()));
    }

    sync_parent(path);
    debug!(path = %path.display(), bytes = bytes.len(), "write_atomic: promoted temp file");
    Ok(())
}

/// Read the whole file, `None` when it is missing or unreadable
pub fn read_bytes(path: &Path) -> Option<Vec<u8>> {
    match try_read_bytes(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %path.display(), error = ?e, "Failed to read file, treating as absent");
            None
        }
    }
}

/// Read the whole file, distinguishing "missing" (`Ok(None)`) from I/O failure
pub fn try_read_bytes(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Remove a file (or directory tree). Missing paths are a no-op.
pub fn delete(path: &Path) -> Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Ok(()) => {
            debug!(path = %path.display(), "delete: removed");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context(format!("Failed to delete {}", path.display())),
    }
}

fn prepare_temp(temp_path: &Path) -> Result<()> {
    if temp_path.exists() {
        return delete(temp_path);
    }
    if let Some(parent) = temp_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).context(format!("Failed to create directory {}", parent.display()))?;
    }
    Ok(())
}

// Persist the rename itself. Best effort: not every platform lets a directory be opened.
#[cfg(unix)]
fn sync_parent(path: &Path) {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return;
    };
    if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
        debug!(dir = %parent.display(), error = ?e, "sync_parent: directory fsync failed");
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}
