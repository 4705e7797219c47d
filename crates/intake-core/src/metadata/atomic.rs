//! Atomic file operations for safe persistence.
//!
//! Implements atomic writes using:
//! 1. Write to a temp file in the destination directory
//! 2. fsync to ensure data reaches disk
//! 3. Atomic rename to target path

use crate::{IntakeError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Read and parse a JSON file.
///
/// Returns `None` if the file doesn't exist, or an error if parsing fails.
pub fn atomic_read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut file = File::open(path).map_err(|e| IntakeError::Io {
        message: format!("Failed to open {}", path.display()),
        path: Some(path.to_path_buf()),
        source: Some(e),
    })?;

    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|e| IntakeError::Io {
            message: format!("Failed to read {}", path.display()),
            path: Some(path.to_path_buf()),
            source: Some(e),
        })?;

    let data: T = serde_json::from_str(&contents).map_err(|e| IntakeError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })?;

    Ok(Some(data))
}

/// Write data to a JSON file atomically.
///
/// The output is pretty-printed with a trailing newline so registry files stay
/// human-diffable.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let mut serialized = serde_json::to_string_pretty(data).map_err(|e| IntakeError::Json {
        message: format!("Failed to serialize data: {}", e),
        source: Some(e),
    })?;
    serialized.push('\n');

    atomic_replace_with(path, |file| file.write_all(serialized.as_bytes()))
}

/// Replace `path` with content produced by `write`, atomically.
///
/// The writer receives a temp file located next to `path`; once it returns,
/// the temp file is flushed, fsynced and renamed over `path`. If anything
/// fails the temp file is removed and `path` is left untouched.
pub fn atomic_replace_with<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut File) -> std::io::Result<()>,
{
    atomic_replace_staged(path, write, |_| Ok(())).map(|_| ())
}

/// Like [`atomic_replace_with`], but runs `stage` on the finished temp file
/// before it is renamed over `path`.
///
/// `stage` sees the temp file's path and can attach state that must arrive
/// together with the new content. An error from `stage` aborts the replace
/// with `path` untouched. Returns the temp path that now names `path`'s
/// content.
pub fn atomic_replace_staged<F, S>(path: &Path, write: F, stage: S) -> Result<PathBuf>
where
    F: FnOnce(&mut File) -> std::io::Result<()>,
    S: FnOnce(&Path) -> Result<()>,
{
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => Path::new(".").to_path_buf(),
    };
    if !parent.exists() {
        fs::create_dir_all(&parent).map_err(|e| IntakeError::Io {
            message: format!("Failed to create directory {}", parent.display()),
            path: Some(parent.clone()),
            source: Some(e),
        })?;
    }

    let mut temp = NamedTempFile::new_in(&parent).map_err(|e| IntakeError::Io {
        message: format!("Failed to create temp file in {}", parent.display()),
        path: Some(parent.clone()),
        source: Some(e),
    })?;

    write(temp.as_file_mut()).map_err(|e| IntakeError::Io {
        message: format!("Failed to write temp file {}", temp.path().display()),
        path: Some(temp.path().to_path_buf()),
        source: Some(e),
    })?;

    temp.as_file_mut().flush().map_err(|e| IntakeError::Io {
        message: format!("Failed to flush temp file {}", temp.path().display()),
        path: Some(temp.path().to_path_buf()),
        source: Some(e),
    })?;

    temp.as_file().sync_all().map_err(|e| IntakeError::Io {
        message: format!("Failed to sync temp file {}", temp.path().display()),
        path: Some(temp.path().to_path_buf()),
        source: Some(e),
    })?;

    let staged = temp.path().to_path_buf();
    stage(&staged)?;

    temp.persist(path).map_err(|e| IntakeError::Io {
        message: format!("Failed to rename temp file to {}", path.display()),
        path: Some(path.to_path_buf()),
        source: Some(e.error),
    })?;
    sync_dir(&parent)?;

    debug!("Atomically wrote {}", path.display());
    Ok(staged)
}

/// Make a rename inside `dir` durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| IntakeError::Io {
            message: format!("Failed to sync directory {}", dir.display()),
            path: Some(dir.to_path_buf()),
            source: Some(e),
        })
}

// Directory handles cannot be fsynced here; the rename is as durable as the
// filesystem makes it.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
