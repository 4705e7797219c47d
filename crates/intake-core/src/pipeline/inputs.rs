//! Input collection.

use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

const SOURCE_EXTENSION: &str = "safetensors";

fn is_source_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(SOURCE_EXTENSION)
}

/// Expand the command-line inputs into source files.
///
/// Files must carry the `.safetensors` extension. Directories are walked
/// recursively and their matches appended in sorted order. Anything else is
/// warned about and skipped.
pub fn collect_inputs(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(input)
                .follow_links(true)
                .into_iter()
                .filter_map(|entry| {
                    entry
                        .map_err(|e| warn!("Skipping unreadable entry under {}: {}", input.display(), e))
                        .ok()
                })
                .filter(|entry| entry.file_type().is_file() && is_source_file(entry.path()))
                .map(|entry| entry.into_path())
                .collect();
            found.sort();
            files.extend(found);
        } else if input.is_file() && is_source_file(input) {
            files.push(input.clone());
        } else {
            warn!(
                "Skipping {} (not a .{} file or directory)",
                input.display(),
                SOURCE_EXTENSION
            );
        }
    }
    files
}
