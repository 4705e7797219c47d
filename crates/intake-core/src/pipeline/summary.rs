//! Per-file outcomes and batch totals.

use crate::conversion::ConvertedOutput;
use crate::provider::TagOutcome;
use crate::registry::{CarriedProvenance, UpsertOutcome};
use crate::repair::RepairReport;
use crate::resolve::ResolvedVersion;
use crate::IntakeError;
use std::fmt;
use std::path::PathBuf;

/// Everything derived for a file ahead of conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportPlan {
    pub name: String,
    pub version: Option<ResolvedVersion>,
    /// Trigger-word prompt prefix
    pub prefix: String,
    pub is_loha: bool,
    pub provenance: Option<CarriedProvenance>,
}

/// What happened to a file that went through the pipeline.
#[derive(Debug, Clone, Default)]
pub struct ImportedFile {
    pub pre_sha256: String,
    pub tag: Option<TagOutcome>,
    pub repair: Option<RepairReport>,
    pub plan: Option<ImportPlan>,
    pub output: Option<ConvertedOutput>,
    pub registered: Option<UpsertOutcome>,
}

#[derive(Debug)]
pub enum FileOutcome {
    Succeeded(Box<ImportedFile>),
    Skipped { reason: String },
    Failed { error: IntakeError },
}

impl FileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FileOutcome::Succeeded(_))
    }
}

impl fmt::Display for FileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileOutcome::Succeeded(imported) => match &imported.output {
                Some(output) => write!(f, "ok -> {}", output.file_name),
                None => f.write_str("ok"),
            },
            FileOutcome::Skipped { reason } => write!(f, "skipped: {reason}"),
            FileOutcome::Failed { error } => write!(f, "failed: {error}"),
        }
    }
}

#[derive(Debug)]
pub struct FileReport {
    pub path: PathBuf,
    pub outcome: FileOutcome,
}

/// Result of a batch run.
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub files: Vec<FileReport>,
    /// Registry backup written by the final save, if any
    pub registry_backup: Option<PathBuf>,
    pub registry_saved: bool,
    /// Set when `stop_on_first_error` cut the batch short
    pub stopped_early: bool,
}

impl BatchSummary {
    pub fn succeeded(&self) -> usize {
        self.files.iter().filter(|r| r.outcome.is_success()).count()
    }

    pub fn skipped(&self) -> usize {
        self.files
            .iter()
            .filter(|r| matches!(r.outcome, FileOutcome::Skipped { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.files
            .iter()
            .filter(|r| matches!(r.outcome, FileOutcome::Failed { .. }))
            .count()
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }
}
