//! Propagation of provenance attributes between files.
//!
//! Used twice per import: around the in-place header rewrite (captured from
//! the original, applied to the replacement before it is renamed into place,
//! since a replaced file does not keep extended attributes) and from the
//! repaired source onto the converted output.

use crate::attributes::{keys, AttributeStore};
use crate::{IntakeError, Result};
use std::path::Path;
use tracing::{debug, warn};

/// Carried attribute values read from one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedAttributes {
    entries: Vec<(String, Vec<u8>)>,
}

impl CapturedAttributes {
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A key that could not be written to the destination.
#[derive(Debug)]
pub struct CarryFailure {
    pub key: String,
    pub error: IntakeError,
}

/// Outcome of applying captured attributes.
#[derive(Debug, Default)]
pub struct CarryReport {
    pub copied: Vec<String>,
    pub failures: Vec<CarryFailure>,
}

impl CarryReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Collapse into a result: any failure is partial propagation.
    pub fn into_result(self, dst: &Path) -> Result<Vec<String>> {
        let Some(first) = self.failures.first() else {
            return Ok(self.copied);
        };
        let failed: Vec<&str> = self.failures.iter().map(|f| f.key.as_str()).collect();
        Err(IntakeError::attribute(
            dst,
            first.key.clone(),
            format!(
                "partial propagation: {} of {} keys failed ({}): {}",
                failed.len(),
                failed.len() + self.copied.len(),
                failed.join(", "),
                first.error
            ),
        ))
    }
}

/// Copies the carried key set (pre-hash, `civitai.*`, fix state, where-from)
/// verbatim between files.
pub struct MetadataCarrier<'a> {
    store: &'a dyn AttributeStore,
}

impl<'a> MetadataCarrier<'a> {
    pub fn new(store: &'a dyn AttributeStore) -> Self {
        Self { store }
    }

    /// Read every carried attribute on `path`.
    pub fn capture(&self, path: &Path) -> Result<CapturedAttributes> {
        let mut entries = Vec::new();
        for key in self.store.list(path)? {
            if !keys::is_carried(&key) {
                continue;
            }
            if let Some(value) = self.store.get(path, &key)? {
                entries.push((key, value));
            }
        }
        debug!("Captured {} carried attributes from {}", entries.len(), path.display());
        Ok(CapturedAttributes { entries })
    }

    /// Write `captured` onto `dst`, attempting every key even after a failure.
    pub fn apply(&self, dst: &Path, captured: &CapturedAttributes) -> CarryReport {
        let mut report = CarryReport::default();
        for (key, value) in &captured.entries {
            match self.store.set(dst, key, value) {
                Ok(()) => report.copied.push(key.clone()),
                Err(error) => {
                    warn!("Failed to carry {} onto {}: {}", key, dst.display(), error);
                    report.failures.push(CarryFailure {
                        key: key.clone(),
                        error,
                    });
                }
            }
        }
        report
    }

    /// Copy carried attributes from `src` to `dst`. A no-op when both name
    /// the same file.
    pub fn carry(&self, src: &Path, dst: &Path) -> Result<CarryReport> {
        if same_file(src, dst) {
            debug!("Skipping attribute carry onto itself: {}", src.display());
            return Ok(CarryReport::default());
        }
        let captured = self.capture(src)?;
        let report = self.apply(dst, &captured);
        debug!(
            "Carried {} attributes {} -> {}",
            report.copied.len(),
            src.display(),
            dst.display()
        );
        Ok(report)
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::MemoryAttributeStore;

    fn tagged_source(store: &MemoryAttributeStore, src: &Path) {
        store.set(src, keys::PRE_SHA256, b"ab".repeat(32).as_slice()).unwrap();
        store.set(src, keys::FIX_STATE, b"3").unwrap();
        store.set(src, keys::BASE_MODEL, b"Pony").unwrap();
        store.set(src, keys::WHERE_FROMS, b"bplist00").unwrap();
        store.set(src, "com.apple.quarantine", b"0081;").unwrap();
    }

    #[test]
    fn test_carry_copies_only_carried_keys() {
        let store = MemoryAttributeStore::new();
        let (src, dst) = (Path::new("/in/a.safetensors"), Path::new("/out/a.ckpt"));
        tagged_source(&store, src);

        let report = MetadataCarrier::new(&store).carry(src, dst).unwrap();

        assert!(report.is_complete());
        assert_eq!(report.copied.len(), 4);
        assert_eq!(store.get(dst, keys::FIX_STATE).unwrap(), Some(b"3".to_vec()));
        assert_eq!(store.get(dst, keys::WHERE_FROMS).unwrap(), Some(b"bplist00".to_vec()));
        assert_eq!(store.get(dst, "com.apple.quarantine").unwrap(), None);
    }

    #[test]
    fn test_carry_onto_self_is_noop() {
        let store = MemoryAttributeStore::new();
        let src = Path::new("/in/a.safetensors");
        tagged_source(&store, src);
        let writes = store.write_log().len();

        let report = MetadataCarrier::new(&store).carry(src, src).unwrap();

        assert!(report.copied.is_empty());
        assert_eq!(store.write_log().len(), writes);
    }

    #[test]
    fn test_failed_key_is_reported_and_others_still_copied() {
        let store = MemoryAttributeStore::new();
        let (src, dst) = (Path::new("/in/a.safetensors"), Path::new("/out/a.ckpt"));
        tagged_source(&store, src);
        store.fail_writes_for(keys::BASE_MODEL);

        let report = MetadataCarrier::new(&store).carry(src, dst).unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].key, keys::BASE_MODEL);
        assert_eq!(report.copied.len(), 3);
        let err = report.into_result(dst).unwrap_err();
        assert_eq!(err.kind(), "attribute_io");
        assert!(err.to_string().contains("partial propagation"));
    }

    #[test]
    fn test_capture_then_apply() {
        let store = MemoryAttributeStore::new();
        let path = Path::new("/in/a.safetensors");
        tagged_source(&store, path);
        let carrier = MetadataCarrier::new(&store);

        let captured = carrier.capture(path).unwrap();
        store.clear(path);
        let report = carrier.apply(path, &captured);

        assert!(report.is_complete());
        assert_eq!(captured.get(keys::BASE_MODEL), Some(&b"Pony"[..]));
        assert_eq!(store.get(path, keys::BASE_MODEL).unwrap(), Some(b"Pony".to_vec()));
    }
}
