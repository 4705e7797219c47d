//! Timestamped registry backups with bounded retention.
//!
//! Backups are named `<registry file name>.<YYYYmmdd_HHMMSS_micros>`, with a
//! `-NNN` counter appended if that name is already taken. Timestamps are UTC
//! so names sort in creation order across local clock changes.

use crate::config::RegistryConfig;
use crate::{IntakeError, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

fn file_name(source: &Path) -> Result<String> {
    source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| IntakeError::Config {
            message: format!("registry path {} has no file name", source.display()),
        })
}

fn backup_stamp(at: DateTime<Utc>) -> String {
    at.format(RegistryConfig::BACKUP_TIMESTAMP_FORMAT).to_string()
}

/// Copy `source` into `backup_dir` under a fresh timestamped name.
pub fn create_backup(source: &Path, backup_dir: &Path) -> Result<PathBuf> {
    let name = file_name(source)?;
    fs::create_dir_all(backup_dir).map_err(|e| IntakeError::io_with_path(e, backup_dir))?;

    let stamp = backup_stamp(Utc::now());
    let base = backup_dir.join(format!("{name}.{stamp}"));
    let mut target = base.clone();
    let mut counter = 0u32;
    while target.exists() {
        counter += 1;
        target = PathBuf::from(format!("{}-{counter:03}", base.display()));
    }

    fs::copy(source, &target).map_err(|e| IntakeError::io_with_path(e, &target))?;
    debug!("Backed up {} to {}", source.display(), target.display());
    Ok(target)
}

/// Backups of `source` in `backup_dir`, oldest first.
pub fn list_backups(source: &Path, backup_dir: &Path) -> Result<Vec<PathBuf>> {
    let prefix = format!("{}.", file_name(source)?);
    let entries = match fs::read_dir(backup_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(IntakeError::io_with_path(e, backup_dir)),
    };

    let mut backups: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(&prefix))
                .is_some_and(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
        })
        .collect();
    backups.sort();
    Ok(backups)
}

/// Delete the oldest backups of `source` until at most `keep` remain.
///
/// Returns the removed paths. A backup that cannot be removed is logged and
/// left in place.
pub fn prune_backups(source: &Path, backup_dir: &Path, keep: usize) -> Result<Vec<PathBuf>> {
    let backups = list_backups(source, backup_dir)?;
    let excess = backups.len().saturating_sub(keep);
    let mut removed = Vec::with_capacity(excess);
    for old in backups.into_iter().take(excess) {
        match fs::remove_file(&old) {
            Ok(()) => removed.push(old),
            Err(e) => warn!("Failed to remove old backup {}: {}", old.display(), e),
        }
    }
    if !removed.is_empty() {
        debug!("Pruned {} old registry backups", removed.len());
    }
    Ok(removed)
}
