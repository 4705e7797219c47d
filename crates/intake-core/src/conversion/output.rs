//! Locating and finishing the converter's output file.

use super::{ConversionRequest, Converter};
use crate::config::ConversionConfig;
use crate::provenance::hashing::sha256_file;
use crate::{IntakeError, Result};
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;
use tracing::{debug, info, warn};

static UNDERSCORE_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_+").expect("underscore regex must compile"));

/// A converted file ready for registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedOutput {
    pub path: PathBuf,
    pub file_name: String,
    pub sha256: String,
    /// Converter stdout, for reporting
    pub log: String,
}

/// Checkpoint files currently in `dir`; empty if it does not exist.
pub fn snapshot_outputs(dir: &Path) -> Result<HashSet<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(IntakeError::io_with_path(e, dir)),
    };
    Ok(entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension().and_then(|e| e.to_str()) == Some(ConversionConfig::OUTPUT_EXTENSION)
        })
        .collect())
}

/// The most recently modified file in `after` that was not in `before`.
pub fn newest_new_output(before: &HashSet<PathBuf>, after: &HashSet<PathBuf>) -> Option<PathBuf> {
    after
        .difference(before)
        .max_by_key(|p| {
            (
                fs::metadata(p)
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH),
                (*p).clone(),
            )
        })
        .cloned()
}

/// Tidy a converter-generated file name: `_lora_` becomes `_` and runs of
/// underscores collapse.
pub fn clean_output_name(name: &str) -> String {
    UNDERSCORE_RUNS
        .replace_all(&name.replace("_lora_", "_"), "_")
        .into_owned()
}

fn finalize_name(path: &Path) -> Result<PathBuf> {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(path.to_path_buf());
    };
    let cleaned = clean_output_name(name);
    if cleaned == name {
        return Ok(path.to_path_buf());
    }
    let target = path.with_file_name(&cleaned);
    if target.exists() {
        warn!(
            "Keeping converter name {}: {} already exists",
            name,
            target.display()
        );
        return Ok(path.to_path_buf());
    }
    fs::rename(path, &target).map_err(|e| IntakeError::io_with_path(e, path))?;
    debug!("Renamed {} -> {}", name, cleaned);
    Ok(target)
}

/// Run `converter` and return the checkpoint it produced.
///
/// Success requires a zero exit and a new checkpoint file in the output
/// directory; the newest such file is taken, its name tidied and its hash
/// computed.
pub fn convert_and_collect(converter: &dyn Converter, request: &ConversionRequest) -> Result<ConvertedOutput> {
    let before = snapshot_outputs(&request.output_dir)?;
    let output = converter.convert(request)?;
    let after = snapshot_outputs(&request.output_dir)?;

    let produced = newest_new_output(&before, &after).ok_or_else(|| {
        IntakeError::external(
            ConversionConfig::CONVERTER_BINARY,
            format!(
                "no new .{} file in {}",
                ConversionConfig::OUTPUT_EXTENSION,
                request.output_dir.display()
            ),
        )
    })?;

    let path = finalize_name(&produced)?;
    let sha256 = sha256_file(&path)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    info!("Converted {} -> {}", request.source.display(), file_name);

    Ok(ConvertedOutput {
        path,
        file_name,
        sha256,
        log: output.stdout,
    })
}
