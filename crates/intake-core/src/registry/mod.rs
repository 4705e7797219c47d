//! Registry of converted models.
//!
//! The registry is the consuming application's JSON index: a top-level array
//! of [`RegistryEntry`] objects. Entries are deduplicated by logical identity
//! rather than position, so re-importing an unchanged model never grows it.
//!
//! # Identity
//!
//! Two entries describe the same model when any of these match, checked in
//! this order:
//! 1. carried pre-modification hash
//! 2. output filename
//! 3. provider version id (trailing number of the resource identifier)
//!
//! The matched signal is reported for logging; every match is a full replace.

pub mod backup;
mod entry;

pub use entry::{version_id_from_air, CarriedProvenance, RegistryEntry};

use crate::config::RegistryConfig;
use crate::metadata::atomic_write_json;
use crate::{IntakeError, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Signal on which a duplicate was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    PreHash,
    FileName,
    VersionId,
}

impl fmt::Display for MatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchReason::PreHash => write!(f, "pre-modification hash"),
            MatchReason::FileName => write!(f, "output filename"),
            MatchReason::VersionId => write!(f, "provider version id"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateMatch {
    pub index: usize,
    pub reason: MatchReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Appended { index: usize },
    Replaced { index: usize, reason: MatchReason, previous_name: String },
}

impl UpsertOutcome {
    pub fn index(&self) -> usize {
        match self {
            UpsertOutcome::Appended { index } | UpsertOutcome::Replaced { index, .. } => *index,
        }
    }
}

/// Find an existing entry describing the same model as `candidate`.
pub fn find_duplicate(entries: &[RegistryEntry], candidate: &RegistryEntry) -> Option<DuplicateMatch> {
    let by = |reason, index: Option<usize>| index.map(|index| DuplicateMatch { index, reason });

    let pre_hash = candidate.pre_sha256();
    let version_id = candidate.version_id();

    by(
        MatchReason::PreHash,
        pre_hash.and_then(|h| {
            entries
                .iter()
                .position(|e| e.pre_sha256().is_some_and(|other| other.eq_ignore_ascii_case(h)))
        }),
    )
    .or_else(|| {
        by(
            MatchReason::FileName,
            (!candidate.file.is_empty())
                .then(|| entries.iter().position(|e| e.file == candidate.file))
                .flatten(),
        )
    })
    .or_else(|| {
        by(
            MatchReason::VersionId,
            version_id.and_then(|id| {
                entries
                    .iter()
                    .position(|e| e.version_id().as_deref() == Some(id.as_str()))
            }),
        )
    })
}

/// Replace the matching entry in place, or append.
pub fn upsert(entries: &mut Vec<RegistryEntry>, candidate: RegistryEntry) -> UpsertOutcome {
    match find_duplicate(entries, &candidate) {
        Some(DuplicateMatch { index, reason }) => {
            let previous = std::mem::replace(&mut entries[index], candidate);
            debug!(
                "Replacing registry entry {} ({:?}) matched by {}",
                index, previous.name, reason
            );
            UpsertOutcome::Replaced {
                index,
                reason,
                previous_name: previous.name,
            }
        }
        None => {
            entries.push(candidate);
            UpsertOutcome::Appended {
                index: entries.len() - 1,
            }
        }
    }
}

/// In-memory registry bound to its file and backup directory.
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    backup_dir: PathBuf,
    entries: Vec<RegistryEntry>,
}

impl Registry {
    /// Load the registry at `path`; empty if the file does not exist.
    ///
    /// Invalid JSON fails with `RegistryCorrupt` and the file is left as is.
    pub fn load(path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str::<Vec<RegistryEntry>>(&text).map_err(|e| {
                IntakeError::RegistryCorrupt {
                    path: path.clone(),
                    message: e.to_string(),
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(IntakeError::io_with_path(e, &path)),
        };
        debug!("Loaded {} registry entries from {}", entries.len(), path.display());
        Ok(Self {
            path,
            backup_dir: backup_dir.into(),
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find_duplicate(&self, candidate: &RegistryEntry) -> Option<DuplicateMatch> {
        find_duplicate(&self.entries, candidate)
    }

    /// Entry whose carried pre-modification hash is `pre_sha256`.
    pub fn find_by_pre_hash(&self, pre_sha256: &str) -> Option<&RegistryEntry> {
        self.entries
            .iter()
            .find(|e| e.pre_sha256().is_some_and(|h| h.eq_ignore_ascii_case(pre_sha256)))
    }

    /// Entry carrying provider version id `version_id`.
    pub fn find_by_version_id(&self, version_id: &str) -> Option<&RegistryEntry> {
        self.entries
            .iter()
            .find(|e| e.version_id().as_deref() == Some(version_id))
    }

    pub fn upsert(&mut self, candidate: RegistryEntry) -> UpsertOutcome {
        upsert(&mut self.entries, candidate)
    }

    /// Persist the registry.
    ///
    /// An existing file is first copied into the backup directory and old
    /// backups pruned; if the copy fails the save is aborted with the file
    /// untouched. Returns the backup path, if one was made.
    pub fn save(&self) -> Result<Option<PathBuf>> {
        let backup = if self.path.exists() {
            let created = backup::create_backup(&self.path, &self.backup_dir)?;
            backup::prune_backups(&self.path, &self.backup_dir, RegistryConfig::MAX_BACKUPS)?;
            Some(created)
        } else {
            None
        };

        atomic_write_json(&self.path, &self.entries)?;
        info!("Saved {} registry entries to {}", self.entries.len(), self.path.display());
        Ok(backup)
    }
}
