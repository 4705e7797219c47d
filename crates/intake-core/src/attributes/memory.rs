//! In-process attribute store.

use super::AttributeStore;
use crate::{IntakeError, Result};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Attribute store backed by a map keyed by path.
///
/// Used for dry runs and tests. Individual keys can be made to fail on write
/// to exercise partial-propagation handling.
#[derive(Debug, Default)]
pub struct MemoryAttributeStore {
    attrs: RefCell<HashMap<PathBuf, BTreeMap<String, Vec<u8>>>>,
    failing_keys: RefCell<HashSet<String>>,
    writes: RefCell<Vec<(PathBuf, String)>>,
}

impl MemoryAttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `set` of `key` fail.
    pub fn fail_writes_for(&self, key: &str) {
        self.failing_keys.borrow_mut().insert(key.to_string());
    }

    /// Every successful `(path, key)` write, in order.
    pub fn write_log(&self) -> Vec<(PathBuf, String)> {
        self.writes.borrow().clone()
    }

    /// Drop every attribute on `path`.
    pub fn clear(&self, path: &Path) {
        self.attrs.borrow_mut().remove(path);
    }
}

impl AttributeStore for MemoryAttributeStore {
    fn get(&self, path: &Path, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .attrs
            .borrow()
            .get(path)
            .and_then(|m| m.get(key).cloned()))
    }

    fn set(&self, path: &Path, key: &str, value: &[u8]) -> Result<()> {
        if self.failing_keys.borrow().contains(key) {
            return Err(IntakeError::attribute(path, key, "injected write failure"));
        }
        self.attrs
            .borrow_mut()
            .entry(path.to_path_buf())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        self.writes
            .borrow_mut()
            .push((path.to_path_buf(), key.to_string()));
        Ok(())
    }

    fn list(&self, path: &Path) -> Result<Vec<String>> {
        Ok(self
            .attrs
            .borrow()
            .get(path)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn replaced(&self, staged: &Path, target: &Path) -> Result<()> {
        let mut attrs = self.attrs.borrow_mut();
        match attrs.remove(staged) {
            Some(moved) => {
                attrs.insert(target.to_path_buf(), moved);
            }
            None => {
                attrs.remove(target);
            }
        }
        Ok(())
    }

    fn discard(&self, path: &Path) -> Result<()> {
        self.clear(path);
        Ok(())
    }
}
