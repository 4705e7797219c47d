//! Header repair engine.
//!
//! Two repairs are known, each recorded by one [`FixFlags`] bit:
//! - removal of the `__metadata__` block
//! - removal of the `model.diffusion_model.` tensor-name prefix
//!
//! Repairs only touch header keys. Descriptors, offsets and the data region
//! are carried over unchanged, so every tensor still addresses the same bytes.

use crate::attributes::AttributeStore;
use crate::carrier::MetadataCarrier;
use crate::config::ContainerConfig;
use crate::container::codec::{encode_header, prefix_for};
use crate::container::{read_header, Container, ContainerHeader};
use crate::metadata::atomic_replace_staged;
use crate::provenance::{FixFlags, PreHash, ProvenanceState};
use crate::{IntakeError, Result};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Which repairs `header` needs, ignoring any recorded state.
pub fn detect(header: &ContainerHeader) -> FixFlags {
    let mut flags = FixFlags::EMPTY;
    if header.contains_key(ContainerConfig::METADATA_KEY) {
        flags |= FixFlags::METADATA_STRIPPED;
    }
    if header
        .tensor_names()
        .any(|name| name.starts_with(ContainerConfig::KEY_PREFIX))
    {
        flags |= FixFlags::KEYS_RENAMED;
    }
    flags
}

/// Apply the repairs `header` needs that are not in `already_applied`.
///
/// Returns the repaired header and the flags applied by this call. A header
/// that needs nothing comes back untouched, raw bytes included.
pub fn repair_header(
    mut header: ContainerHeader,
    already_applied: FixFlags,
) -> Result<(ContainerHeader, FixFlags)> {
    let needed = detect(&header).difference(already_applied);

    if needed.metadata_stripped() {
        header.remove(ContainerConfig::METADATA_KEY);
    }

    if needed.keys_renamed() {
        let prefixed: Vec<String> = header
            .tensor_names()
            .filter(|name| name.starts_with(ContainerConfig::KEY_PREFIX))
            .map(str::to_string)
            .collect();
        for name in prefixed {
            let stripped = &name[ContainerConfig::KEY_PREFIX.len()..];
            if !header.rename(&name, stripped) {
                return Err(IntakeError::MalformedContainer {
                    message: format!(
                        "stripping the key prefix from {name:?} collides with existing tensor {stripped:?}"
                    ),
                    path: None,
                });
            }
        }
    }

    Ok((header, needed))
}

/// In-memory repair of a fully buffered container.
pub fn repair(container: Container, already_applied: FixFlags) -> Result<(Container, FixFlags)> {
    let Container {
        header_length,
        header,
        data,
    } = container;
    let (header, applied) = repair_header(header, already_applied)?;
    let header_length = if applied.is_empty() {
        header_length
    } else {
        encode_header(&header)?.len() as u64
    };
    Ok((
        Container {
            header_length,
            header,
            data,
        },
        applied,
    ))
}

/// Result of [`RepairEngine::repair_file`].
#[derive(Debug, Clone)]
pub struct RepairReport {
    pub path: PathBuf,
    /// Hex SHA-256 of the file before any repair
    pub pre_sha256: String,
    /// Fix state found on the file
    pub previous: FixFlags,
    /// Repairs applied by this run
    pub applied: FixFlags,
    /// Carried attributes staged onto the rewritten file
    pub restored_attributes: usize,
}

impl RepairReport {
    pub fn rewrote(&self) -> bool {
        !self.applied.is_empty()
    }

    pub fn fix_state(&self) -> FixFlags {
        self.previous | self.applied
    }
}

/// File-level repair over an attribute store.
pub struct RepairEngine<'a> {
    store: &'a dyn AttributeStore,
}

impl<'a> RepairEngine<'a> {
    pub fn new(store: &'a dyn AttributeStore) -> Self {
        Self { store }
    }

    /// Repair `path` in place.
    ///
    /// The pre-modification hash is secured before anything else; a file with
    /// fix flags but no hash fails with `UnrecoverableProvenance` untouched.
    /// Carried attributes are staged on the rewritten file before it replaces
    /// the original, so the hash never goes missing. The fix state is only
    /// updated once the rewritten bytes are durable.
    pub fn repair_file(&self, path: &Path) -> Result<RepairReport> {
        let provenance = ProvenanceState::new(self.store);
        let pre = provenance.ensure_pre_hash(path)?;
        let previous = provenance.read(path)?;

        let file = File::open(path).map_err(|e| IntakeError::io_with_path(e, path))?;
        let metadata = file
            .metadata()
            .map_err(|e| IntakeError::io_with_path(e, path))?;
        let mut reader = BufReader::with_capacity(ContainerConfig::COPY_CHUNK_SIZE, file);
        let parsed = read_header(&mut reader, metadata.len()).map_err(|e| e.with_path(path))?;

        let (header, applied) =
            repair_header(parsed.header, previous).map_err(|e| e.with_path(path))?;

        let mut report = RepairReport {
            path: path.to_path_buf(),
            pre_sha256: pre.digest().to_string(),
            previous,
            applied,
            restored_attributes: 0,
        };

        if applied.is_empty() {
            if previous.is_empty() {
                info!("Header clean, no fix needed: {}", path.display());
            } else {
                info!("Header already fixed ({}): {}", previous, path.display());
            }
            return Ok(report);
        }

        let carrier = MetadataCarrier::new(self.store);
        let captured = carrier.capture(path)?;

        let encoded = encode_header(&header)?;
        let data_len = parsed.data_len;
        let permissions = metadata.permissions();
        let mut restored = 0;
        let staged = atomic_replace_staged(
            path,
            |out| {
                out.set_permissions(permissions)?;
                out.write_all(&prefix_for(&encoded))?;
                out.write_all(&encoded)?;
                let copied = io::copy(&mut reader.by_ref().take(data_len), out)?;
                if copied != data_len {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("data region shrank while copying: {copied} of {data_len} bytes"),
                    ));
                }
                Ok(())
            },
            |staged| {
                let staging = carrier
                    .apply(staged, &captured)
                    .into_result(path)
                    .and_then(|copied| {
                        self.confirm_pre_hash(&provenance, staged, &pre)?;
                        Ok(copied.len())
                    });
                match staging {
                    Ok(count) => {
                        restored = count;
                        Ok(())
                    }
                    Err(e) => {
                        if let Err(discard) = self.store.discard(staged) {
                            warn!("Failed to drop staged attributes: {}", discard);
                        }
                        Err(e)
                    }
                }
            },
        )?;
        self.store.replaced(&staged, path)?;
        report.restored_attributes = restored;
        debug!(
            "Rewrote header of {} ({} -> {} bytes)",
            path.display(),
            parsed.header_length,
            encoded.len()
        );

        provenance.mark_applied(&pre, applied)?;
        info!("Header fixed ({}): {}", applied, path.display());
        Ok(report)
    }

    // The staged file replaces the original; without the hash on it the next
    // run would take the rewritten bytes for the original.
    fn confirm_pre_hash(&self, provenance: &ProvenanceState<'_>, staged: &Path, pre: &PreHash) -> Result<()> {
        match provenance.read_pre_hash(staged)? {
            Some(digest) if digest == pre.digest() => Ok(()),
            _ => Err(IntakeError::attribute(
                pre.path(),
                crate::attributes::keys::PRE_SHA256,
                "pre-modification hash could not be staged on the rewritten file",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{keys, MemoryAttributeStore};
    use crate::container::{parse, serialize};
    use tempfile::TempDir;

    fn container_bytes(header: &str, data: &[u8]) -> Vec<u8> {
        let mut out = (header.len() as u64).to_le_bytes().to_vec();
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(data);
        out
    }

    const DIRTY: &str = r#"{"__metadata__":{"ss_network_module":"networks.lora"},"model.diffusion_model.foo":{"dtype":"F16","shape":[2,2],"data_offsets":[0,8]}}"#;
    const CLEAN: &str = r#"{"foo":{"dtype":"F16","shape":[2,2],"data_offsets":[0,8]}}"#;
    const DATA: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];

    #[test]
    fn test_detect() {
        let dirty = parse(&container_bytes(DIRTY, &DATA)).unwrap();
        assert_eq!(detect(&dirty.header).bits(), 3);
        let clean = parse(&container_bytes(CLEAN, &DATA)).unwrap();
        assert!(detect(&clean.header).is_empty());
    }

    #[test]
    fn test_repair_strips_both() {
        let container = parse(&container_bytes(DIRTY, &DATA)).unwrap();
        let (repaired, applied) = repair(container, FixFlags::EMPTY).unwrap();

        assert_eq!(applied.bits(), 3);
        assert_eq!(repaired.to_bytes().unwrap(), container_bytes(CLEAN, &DATA));
        assert_eq!(repaired.header_length, CLEAN.len() as u64);
    }

    #[test]
    fn test_repair_is_idempotent() {
        let container = parse(&container_bytes(DIRTY, &DATA)).unwrap();
        let (once, first) = repair(container, FixFlags::EMPTY).unwrap();
        let bytes_once = once.to_bytes().unwrap();

        let (twice, second) = repair(once, first).unwrap();
        assert!(second.is_empty());
        assert_eq!(twice.to_bytes().unwrap(), bytes_once);

        // Re-detecting on the repaired header finds nothing either.
        let (again, third) = repair(parse(&bytes_once).unwrap(), FixFlags::EMPTY).unwrap();
        assert!(third.is_empty());
        assert_eq!(again.to_bytes().unwrap(), bytes_once);
    }

    #[test]
    fn test_recorded_flag_skips_repair() {
        let container = parse(&container_bytes(DIRTY, &DATA)).unwrap();
        let (repaired, applied) = repair(container, FixFlags::METADATA_STRIPPED).unwrap();
        assert_eq!(applied, FixFlags::KEYS_RENAMED);
        assert!(repaired.header.metadata().is_some());
    }

    #[test]
    fn test_clean_container_passes_through_byte_identical() {
        let padded = format!("{CLEAN}   ");
        let bytes = container_bytes(&padded, &DATA);
        let (repaired, applied) = repair(parse(&bytes).unwrap(), FixFlags::EMPTY).unwrap();
        assert!(applied.is_empty());
        assert_eq!(serialize(&repaired.header, &repaired.data).unwrap(), bytes);
    }

    #[test]
    fn test_descriptors_keep_their_bytes() {
        let header = r#"{"model.diffusion_model.a":{"dtype":"U8","shape":[3],"data_offsets":[5,8]},"b":{"dtype":"U8","shape":[5],"data_offsets":[0,5]}}"#;
        let container = parse(&container_bytes(header, &DATA)).unwrap();
        let before: Vec<Vec<u8>> = container
            .header
            .tensors()
            .map(|(_, t)| container.data[t.start() as usize..t.end() as usize].to_vec())
            .collect();

        let (repaired, _) = repair(container, FixFlags::EMPTY).unwrap();
        let after: Vec<Vec<u8>> = repaired
            .header
            .tensors()
            .map(|(_, t)| repaired.data[t.start() as usize..t.end() as usize].to_vec())
            .collect();

        assert_eq!(before, after);
        let names: Vec<_> = repaired.header.tensor_names().collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_prefix_collision_is_malformed() {
        let header = r#"{"model.diffusion_model.a":{"dtype":"U8","shape":[2],"data_offsets":[0,2]},"a":{"dtype":"U8","shape":[2],"data_offsets":[2,4]}}"#;
        let container = parse(&container_bytes(header, &[0; 4])).unwrap();
        let err = repair(container, FixFlags::EMPTY).unwrap_err();
        assert_eq!(err.kind(), "malformed_container");
    }

    fn write_file(dir: &TempDir, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join("style.safetensors");
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_repair_file_end_to_end() {
        let dir = TempDir::new().unwrap();
        let original = container_bytes(DIRTY, &DATA);
        let path = write_file(&dir, &original);
        let store = MemoryAttributeStore::new();
        store.set(&path, keys::BASE_MODEL, b"Flux.1 D").unwrap();

        let report = RepairEngine::new(&store).repair_file(&path).unwrap();

        assert!(report.rewrote());
        assert_eq!(report.fix_state().bits(), 3);
        assert_eq!(std::fs::read(&path).unwrap(), container_bytes(CLEAN, &DATA));
        assert_eq!(
            store.get_string(&path, keys::PRE_SHA256).unwrap().unwrap(),
            crate::provenance::hashing::sha256_reader(original.as_slice()).unwrap()
        );
        assert_eq!(store.get_string(&path, keys::FIX_STATE).unwrap().as_deref(), Some("3"));
        assert_eq!(
            store.get_string(&path, keys::BASE_MODEL).unwrap().as_deref(),
            Some("Flux.1 D")
        );
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_second_run_does_not_rewrite() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, &container_bytes(DIRTY, &DATA));
        let store = MemoryAttributeStore::new();
        let engine = RepairEngine::new(&store);
        let first = engine.repair_file(&path).unwrap();
        let writes = store.write_log().len();

        let second = engine.repair_file(&path).unwrap();

        assert!(!second.rewrote());
        assert_eq!(second.pre_sha256, first.pre_sha256);
        assert_eq!(store.write_log().len(), writes);
    }

    #[test]
    fn test_clean_file_gets_hash_but_no_state() {
        let dir = TempDir::new().unwrap();
        let bytes = container_bytes(CLEAN, &DATA);
        let path = write_file(&dir, &bytes);
        let store = MemoryAttributeStore::new();

        let report = RepairEngine::new(&store).repair_file(&path).unwrap();

        assert!(!report.rewrote());
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
        assert!(store.get(&path, keys::PRE_SHA256).unwrap().is_some());
        assert_eq!(store.get(&path, keys::FIX_STATE).unwrap(), None);
    }

    #[test]
    fn test_fixed_file_without_hash_is_untouched() {
        let dir = TempDir::new().unwrap();
        let bytes = container_bytes(DIRTY, &DATA);
        let path = write_file(&dir, &bytes);
        let store = MemoryAttributeStore::new();
        store.set(&path, keys::FIX_STATE, b"1").unwrap();

        let err = RepairEngine::new(&store).repair_file(&path).unwrap_err();

        assert_eq!(err.kind(), "unrecoverable_provenance");
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
        assert_eq!(store.get_string(&path, keys::FIX_STATE).unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_malformed_file_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, b"\x02\x00");
        let store = MemoryAttributeStore::new();

        let err = RepairEngine::new(&store).repair_file(&path).unwrap_err();

        match err {
            IntakeError::MalformedContainer { path: Some(p), .. } => assert_eq!(p, path),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_failed_state_write_leaves_flag_unset() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, &container_bytes(DIRTY, &DATA));
        let store = MemoryAttributeStore::new();
        store.fail_writes_for(keys::FIX_STATE);

        let err = RepairEngine::new(&store).repair_file(&path).unwrap_err();

        assert_eq!(err.kind(), "attribute_io");
        assert_eq!(store.get(&path, keys::FIX_STATE).unwrap(), None);
        // Content is already repaired and the original hash is kept.
        let pre = store.get_string(&path, keys::PRE_SHA256).unwrap().unwrap();
        let rerun = RepairEngine::new(&store).repair_file(&path).unwrap();
        assert!(!rerun.rewrote());
        assert_eq!(rerun.pre_sha256, pre);
    }

    #[cfg(unix)]
    #[test]
    fn test_rewrite_keeps_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, &container_bytes(DIRTY, &DATA));
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        let store = MemoryAttributeStore::new();

        RepairEngine::new(&store).repair_file(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
    }

    #[test]
    fn test_replacement_keeps_only_staged_attributes() {
        let dir = TempDir::new().unwrap();
        let original = container_bytes(DIRTY, &DATA);
        let path = write_file(&dir, &original);
        let store = MemoryAttributeStore::new();
        store.set(&path, keys::BASE_MODEL, b"Flux.1 D").unwrap();
        store.set(&path, "com.apple.quarantine", b"0081").unwrap();

        let report = RepairEngine::new(&store).repair_file(&path).unwrap();

        // The rewritten file is a new inode: uncarried keys do not follow it.
        assert_eq!(store.get(&path, "com.apple.quarantine").unwrap(), None);
        assert_eq!(report.restored_attributes, 2);
        assert_eq!(
            store.get_string(&path, keys::PRE_SHA256).unwrap().unwrap(),
            crate::provenance::hashing::sha256_reader(original.as_slice()).unwrap()
        );
        assert_eq!(store.get_string(&path, keys::FIX_STATE).unwrap().as_deref(), Some("3"));
        assert_eq!(
            store.get_string(&path, keys::BASE_MODEL).unwrap().as_deref(),
            Some("Flux.1 D")
        );
    }

    #[test]
    fn test_failed_staging_keeps_original_recoverable() {
        let dir = TempDir::new().unwrap();
        let original = container_bytes(DIRTY, &DATA);
        let path = write_file(&dir, &original);
        let store = MemoryAttributeStore::new();
        store.set(&path, keys::BASE_MODEL, b"Flux.1 D").unwrap();
        store.fail_writes_for(keys::BASE_MODEL);

        let err = RepairEngine::new(&store).repair_file(&path).unwrap_err();

        assert_eq!(err.kind(), "attribute_io");
        assert_eq!(std::fs::read(&path).unwrap(), original);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        let staged_paths: Vec<PathBuf> = store
            .write_log()
            .into_iter()
            .map(|(p, _)| p)
            .filter(|p| p != &path)
            .collect();
        assert!(!staged_paths.is_empty());
        assert!(staged_paths.iter().all(|p| store.list(p).unwrap().is_empty()));

        // A later run still finds the hash of the original bytes.
        let provenance = ProvenanceState::new(&store);
        let pre = provenance.ensure_pre_hash(&path).unwrap();
        assert_eq!(
            pre.digest(),
            crate::provenance::hashing::sha256_reader(original.as_slice()).unwrap()
        );
        assert!(provenance.read(&path).unwrap().is_empty());
    }
}
