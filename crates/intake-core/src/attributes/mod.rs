//! Per-file attribute side-channel.
//!
//! Attributes are namespaced key/value pairs attached to a path but stored
//! outside the file's bytes, so they survive (or deliberately outlive) content
//! rewrites. Three backends are provided:
//! - `XattrStore`: OS extended attributes (Linux, macOS)
//! - [`SidecarStore`]: a `<file>.attrs.json` next to the file
//! - [`MemoryAttributeStore`]: in-process, for tests and dry runs

mod memory;
mod sidecar;
pub mod where_froms;
#[cfg(any(target_os = "linux", target_os = "macos"))]
mod xattr;

pub use memory::MemoryAttributeStore;
pub use sidecar::SidecarStore;
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub use xattr::XattrStore;

use crate::Result;
use std::path::Path;

/// Attribute keys shared with files tagged by earlier import tooling.
pub mod keys {
    /// Prefix for all provider-sourced metadata.
    pub const PROVIDER_PREFIX: &str = "civitai.";
    /// SHA-256 of the file before any modification. Write-once.
    pub const PRE_SHA256: &str = "civitai.sha256sum";
    /// Fix-state flags, decimal string.
    pub const FIX_STATE: &str = "kernkraft235.safetensors.fix-v1";
    /// OS-indexable origin URL (binary plist array).
    pub const WHERE_FROMS: &str = "com.apple.metadata:kMDItemWhereFroms";
    /// Metadata schema stamp written alongside provider fields.
    pub const METADATA_VERSION: &str = "civitai.metadata.version";

    pub const VERSION_ID: &str = "civitai.id";
    pub const MODEL_ID: &str = "civitai.modelId";
    pub const MODEL_TYPE: &str = "civitai.modelType";
    pub const BASE_MODEL: &str = "civitai.baseModel";
    pub const NSFW_LEVEL: &str = "civitai.nsfwLevel";
    pub const TRIGGER_WORDS: &str = "civitai.triggerWords";
    pub const NAME: &str = "civitai.name";
    pub const AIR: &str = "civitai.air";
    pub const FILE_NAME: &str = "civitai.fileName";
    pub const DESCRIPTION: &str = "civitai.description";
    pub const IMAGES: &str = "civitai.images";

    /// Whether a key belongs to the set carried from source to output files.
    pub fn is_carried(key: &str) -> bool {
        key.starts_with(PROVIDER_PREFIX) || key == FIX_STATE || key == WHERE_FROMS
    }
}

/// Capability over a per-path, namespaced key→bytes store.
///
/// Implementations must report every failure; a swallowed write here can
/// leave the persisted fix state out of step with the file's bytes.
pub trait AttributeStore {
    /// Read an attribute. `Ok(None)` when the key is absent.
    fn get(&self, path: &Path, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write an attribute, replacing any previous value.
    fn set(&self, path: &Path, key: &str, value: &[u8]) -> Result<()>;

    /// List the attribute keys present on `path`.
    fn list(&self, path: &Path) -> Result<Vec<String>>;

    /// Read an attribute as UTF-8 text (lossy).
    fn get_string(&self, path: &Path, key: &str) -> Result<Option<String>> {
        Ok(self
            .get(path, key)?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }

    /// Copy every key accepted by `predicate` from `src` to `dst`.
    ///
    /// Returns the copied keys on success, or the first error. Callers that
    /// need per-key accounting use [`crate::carrier::MetadataCarrier`].
    fn copy_all(&self, src: &Path, dst: &Path, predicate: &dyn Fn(&str) -> bool) -> Result<Vec<String>> {
        let mut copied = Vec::new();
        for key in self.list(src)? {
            if !predicate(&key) {
                continue;
            }
            if let Some(value) = self.get(src, &key)? {
                self.set(dst, &key, &value)?;
                copied.push(key);
            }
        }
        Ok(copied)
    }

    /// Note that `staged` has been renamed over `target`.
    ///
    /// After a content replacement `target` carries exactly the attributes
    /// that were on `staged`. Stores whose attributes live on the inode get
    /// this from the rename itself; path-keyed stores move them here.
    fn replaced(&self, _staged: &Path, _target: &Path) -> Result<()> {
        Ok(())
    }

    /// Drop whatever is recorded for a file that is about to be deleted.
    fn discard(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

impl<S: AttributeStore + ?Sized> AttributeStore for &S {
    fn get(&self, path: &Path, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(path, key)
    }

    fn set(&self, path: &Path, key: &str, value: &[u8]) -> Result<()> {
        (**self).set(path, key, value)
    }

    fn list(&self, path: &Path) -> Result<Vec<String>> {
        (**self).list(path)
    }

    fn replaced(&self, staged: &Path, target: &Path) -> Result<()> {
        (**self).replaced(staged, target)
    }

    fn discard(&self, path: &Path) -> Result<()> {
        (**self).discard(path)
    }
}

impl<S: AttributeStore + ?Sized> AttributeStore for Box<S> {
    fn get(&self, path: &Path, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(path, key)
    }

    fn set(&self, path: &Path, key: &str, value: &[u8]) -> Result<()> {
        (**self).set(path, key, value)
    }

    fn list(&self, path: &Path) -> Result<Vec<String>> {
        (**self).list(path)
    }

    fn replaced(&self, staged: &Path, target: &Path) -> Result<()> {
        (**self).replaced(staged, target)
    }

    fn discard(&self, path: &Path) -> Result<()> {
        (**self).discard(path)
    }
}
