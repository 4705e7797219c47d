//! JSON sidecar attribute store.
//!
//! Portable fallback for filesystems without extended attributes. Each file
//! gets a `<file>.attrs.json` sibling mapping keys to hex-encoded values.

use super::AttributeStore;
use crate::metadata::{atomic_read_json, atomic_write_json};
use crate::{IntakeError, Result};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Suffix appended to the file name to locate its sidecar.
const SIDECAR_SUFFIX: &str = ".attrs.json";

type SidecarData = BTreeMap<String, String>;

/// Attribute store persisting to per-file JSON sidecars.
#[derive(Debug, Clone, Default)]
pub struct SidecarStore;

impl SidecarStore {
    pub fn new() -> Self {
        Self
    }

    /// Sidecar location for `path`.
    pub fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| OsString::from("unnamed"));
        name.push(SIDECAR_SUFFIX);
        path.with_file_name(name)
    }

    fn load(&self, path: &Path) -> Result<SidecarData> {
        let sidecar = Self::sidecar_path(path);
        atomic_read_json::<SidecarData>(&sidecar)
            .map(Option::unwrap_or_default)
            .map_err(|e| IntakeError::attribute(path, "*", format!("unreadable sidecar {}: {}", sidecar.display(), e)))
    }
}

impl AttributeStore for SidecarStore {
    fn get(&self, path: &Path, key: &str) -> Result<Option<Vec<u8>>> {
        match self.load(path)?.get(key) {
            Some(encoded) => hex::decode(encoded)
                .map(Some)
                .map_err(|e| IntakeError::attribute(path, key, format!("invalid hex value: {e}"))),
            None => Ok(None),
        }
    }

    fn set(&self, path: &Path, key: &str, value: &[u8]) -> Result<()> {
        let mut data = self.load(path)?;
        data.insert(key.to_string(), hex::encode(value));
        atomic_write_json(&Self::sidecar_path(path), &data).map_err(|e| match e {
            IntakeError::Io { message, source, .. } => IntakeError::AttributeIo {
                path: path.to_path_buf(),
                key: key.to_string(),
                message,
                source,
            },
            other => other,
        })
    }

    fn list(&self, path: &Path) -> Result<Vec<String>> {
        Ok(self.load(path)?.into_keys().collect())
    }

    fn replaced(&self, staged: &Path, target: &Path) -> Result<()> {
        let from = Self::sidecar_path(staged);
        let to = Self::sidecar_path(target);
        let moved = match fs::rename(&from, &to) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => remove_if_present(&to),
            other => other,
        };
        moved.map_err(|e| sidecar_error(target, &to, e))
    }

    fn discard(&self, path: &Path) -> Result<()> {
        let sidecar = Self::sidecar_path(path);
        remove_if_present(&sidecar).map_err(|e| sidecar_error(path, &sidecar, e))
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn sidecar_error(path: &Path, sidecar: &Path, err: io::Error) -> IntakeError {
    IntakeError::AttributeIo {
        path: path.to_path_buf(),
        key: "*".to_string(),
        message: format!("failed to update sidecar {}", sidecar.display()),
        source: Some(err),
    }
}
