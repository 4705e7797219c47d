//! Provenance state: the write-once pre-modification hash and the fix-state
//! flags that record which header repairs have been applied to a file.
//!
//! # State transitions
//!
//! ```text
//! (no hash, clean) --ensure_pre_hash--> (hash, clean) --mark_applied--> (hash, flags)
//! (no hash, flags) --ensure_pre_hash--> UnrecoverableProvenance
//! ```
//!
//! The only way to obtain a [`PreHash`] is [`ProvenanceState::ensure_pre_hash`],
//! and both the file rewrite and [`ProvenanceState::mark_applied`] require one,
//! so no flag can be persisted for a file whose original hash was never
//! captured.

pub mod hashing;

use crate::attributes::{keys, AttributeStore};
use crate::{IntakeError, Result};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Set of header repairs applied to a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FixFlags(u8);

impl FixFlags {
    pub const EMPTY: FixFlags = FixFlags(0);
    /// The `__metadata__` block was removed.
    pub const METADATA_STRIPPED: FixFlags = FixFlags(1);
    /// The `model.diffusion_model.` tensor-name prefix was removed.
    pub const KEYS_RENAMED: FixFlags = FixFlags(2);

    /// Every flag this version knows how to apply.
    pub const ALL: FixFlags = FixFlags(Self::METADATA_STRIPPED.0 | Self::KEYS_RENAMED.0);

    /// Flags from their persisted form. Unknown bits are kept so a newer
    /// writer's state is never narrowed on rewrite.
    pub const fn from_bits(bits: u8) -> Self {
        FixFlags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: FixFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn metadata_stripped(self) -> bool {
        self.contains(Self::METADATA_STRIPPED)
    }

    pub const fn keys_renamed(self) -> bool {
        self.contains(Self::KEYS_RENAMED)
    }

    /// Flags in `self` that are not in `other`.
    pub const fn difference(self, other: FixFlags) -> FixFlags {
        FixFlags(self.0 & !other.0)
    }

    pub fn insert(&mut self, other: FixFlags) {
        self.0 |= other.0;
    }
}

impl BitOr for FixFlags {
    type Output = FixFlags;

    fn bitor(self, rhs: FixFlags) -> FixFlags {
        FixFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for FixFlags {
    fn bitor_assign(&mut self, rhs: FixFlags) {
        self.insert(rhs);
    }
}

impl fmt::Display for FixFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "clean");
        }
        let mut parts = Vec::new();
        if self.metadata_stripped() {
            parts.push("metadata".to_string());
        }
        if self.keys_renamed() {
            parts.push("keys".to_string());
        }
        let unknown = self.difference(Self::ALL);
        if !unknown.is_empty() {
            parts.push(format!("0x{:02x}", unknown.0));
        }
        write!(f, "{}", parts.join("+"))
    }
}

/// Proof that a file's pre-modification hash is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreHash {
    path: PathBuf,
    digest: String,
}

impl PreHash {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lowercase hex SHA-256 of the original bytes.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

/// Snapshot of a file's provenance attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenanceRecord {
    pub pre_sha256: Option<String>,
    pub fix_state: FixFlags,
}

/// Provenance operations over an attribute store.
pub struct ProvenanceState<'a> {
    store: &'a dyn AttributeStore,
}

impl<'a> ProvenanceState<'a> {
    pub fn new(store: &'a dyn AttributeStore) -> Self {
        Self { store }
    }

    /// Persisted fix state; empty if the file was never touched.
    pub fn read(&self, path: &Path) -> Result<FixFlags> {
        let Some(raw) = self.store.get_string(path, keys::FIX_STATE)? else {
            return Ok(FixFlags::EMPTY);
        };
        // An unparseable state must not read as clean: that would allow
        // hashing an already-rewritten file as its original.
        raw.trim()
            .parse::<u8>()
            .map(FixFlags::from_bits)
            .map_err(|_| {
                IntakeError::attribute(path, keys::FIX_STATE, format!("invalid fix state {raw:?}"))
            })
    }

    /// Persisted pre-modification hash, if any.
    pub fn read_pre_hash(&self, path: &Path) -> Result<Option<String>> {
        match self.store.get_string(path, keys::PRE_SHA256)? {
            Some(value) if hashing::is_sha256_hex(value.trim()) => {
                Ok(Some(value.trim().to_ascii_lowercase()))
            }
            Some(value) => Err(IntakeError::attribute(
                path,
                keys::PRE_SHA256,
                format!("stored value {value:?} is not a SHA-256 digest"),
            )),
            None => Ok(None),
        }
    }

    pub fn record(&self, path: &Path) -> Result<ProvenanceRecord> {
        Ok(ProvenanceRecord {
            pre_sha256: self.read_pre_hash(path)?,
            fix_state: self.read(path)?,
        })
    }

    /// Return the persisted pre-modification hash, computing and persisting it
    /// first if the file is still clean.
    ///
    /// Fails with `UnrecoverableProvenance` (and writes nothing) when the file
    /// has fix flags but no hash: the original bytes are gone.
    pub fn ensure_pre_hash(&self, path: &Path) -> Result<PreHash> {
        if let Some(digest) = self.read_pre_hash(path)? {
            debug!("Pre-modification hash already recorded for {}", path.display());
            return Ok(PreHash {
                path: path.to_path_buf(),
                digest,
            });
        }

        let fix_state = self.read(path)?;
        if !fix_state.is_empty() {
            return Err(IntakeError::UnrecoverableProvenance {
                path: path.to_path_buf(),
                fix_state: fix_state.bits(),
            });
        }

        let digest = hashing::sha256_file(path)?;
        self.store.set(path, keys::PRE_SHA256, digest.as_bytes())?;
        info!("Recorded pre-modification hash {} for {}", digest, path.display());

        Ok(PreHash {
            path: path.to_path_buf(),
            digest,
        })
    }

    /// OR `flags` into the persisted fix state of `pre.path()`.
    ///
    /// Call only after the corresponding content change is durable on disk.
    pub fn mark_applied(&self, pre: &PreHash, flags: FixFlags) -> Result<FixFlags> {
        let current = self.read(pre.path())?;
        let updated = current | flags;
        if updated != current {
            self.store
                .set(pre.path(), keys::FIX_STATE, updated.bits().to_string().as_bytes())?;
            debug!("Fix state for {} is now {} ({})", pre.path().display(), updated.bits(), updated);
        }
        Ok(updated)
    }
}
