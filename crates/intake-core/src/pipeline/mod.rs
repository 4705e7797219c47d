//! Per-file and per-batch import orchestration.
//!
//! A file goes through: pre-hash, provider tagging, header repair, the
//! pre-flight checks, name/version/trigger resolution, conversion, attribute
//! propagation onto the output and finally a registry upsert. Modes and step
//! overrides cut the sequence short. The registry is loaded once per batch
//! and saved once at the end.

mod inputs;
mod summary;

pub use inputs::collect_inputs;
pub use summary::{BatchSummary, FileOutcome, FileReport, ImportPlan, ImportedFile};

use crate::attributes::{keys, AttributeStore};
use crate::carrier::MetadataCarrier;
use crate::config::ImportSettings;
use crate::container::read_header;
use crate::conversion::{convert_and_collect, ConversionRequest, Converter};
use crate::provenance::{PreHash, ProvenanceState};
use crate::provider::{MetadataProvider, ProviderTagger};
use crate::registry::{CarriedProvenance, Registry, RegistryEntry, UpsertOutcome};
use crate::repair::RepairEngine;
use crate::resolve::{derive_name, format_trigger_words, is_loha, parse_trigger_words, VersionResolver};
use crate::{IntakeError, Result};
use serde_json::Map;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Which part of the pipeline runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImportMode {
    /// Hash, tag, repair, convert and register
    #[default]
    Full,
    /// Hash, tag and repair only
    FixOnly,
    /// Hash and tag only
    TagOnly,
}

impl fmt::Display for ImportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImportMode::Full => "full pipeline",
            ImportMode::FixOnly => "fix-only",
            ImportMode::TagOnly => "tag-only",
        })
    }
}

/// Run-wide switches.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub mode: ImportMode,
    pub skip_fix: bool,
    pub skip_lookup: bool,
    pub skip_convert: bool,
    /// Resolve everything but neither convert nor touch the registry
    pub dry_run: bool,
    pub stop_on_first_error: bool,
    /// Import files already present in the registry, refreshing their entry
    pub reimport: bool,
    /// Display name override, single-input batches only
    pub name_override: Option<String>,
}

impl PipelineOptions {
    /// Whether files reach the conversion and registry stages.
    pub fn converts(&self) -> bool {
        self.mode == ImportMode::Full && !self.skip_convert
    }

    fn repairs(&self) -> bool {
        self.mode != ImportMode::TagOnly && !self.skip_fix
    }
}

/// Batch importer over injected collaborators.
pub struct ImportPipeline<'a> {
    store: &'a dyn AttributeStore,
    provider: Option<&'a dyn MetadataProvider>,
    converter: Option<&'a dyn Converter>,
    settings: ImportSettings,
    options: PipelineOptions,
}

impl<'a> ImportPipeline<'a> {
    pub fn new(store: &'a dyn AttributeStore, settings: ImportSettings, options: PipelineOptions) -> Self {
        Self {
            store,
            provider: None,
            converter: None,
            settings,
            options,
        }
    }

    pub fn with_provider(mut self, provider: &'a dyn MetadataProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_converter(mut self, converter: &'a dyn Converter) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn settings(&self) -> &ImportSettings {
        &self.settings
    }

    /// Process `files` one at a time.
    ///
    /// File-local failures are recorded in the summary; only a batch-fatal
    /// error (a corrupt registry) or a failed registry save is returned as
    /// `Err`.
    pub fn run(&self, files: &[PathBuf]) -> Result<BatchSummary> {
        if self.options.name_override.is_some() && files.len() > 1 {
            return Err(IntakeError::Config {
                message: format!("--name can only be used with a single file, got {}", files.len()),
            });
        }

        let converts = self.options.converts();
        if converts && !self.options.dry_run && self.converter.is_none() {
            return Err(IntakeError::Config {
                message: "conversion requested but no converter is configured".into(),
            });
        }

        let mut registry = if converts {
            Some(Registry::load(&self.settings.registry_path, &self.settings.backup_dir)?)
        } else {
            None
        };

        if converts && !self.options.dry_run {
            std::fs::create_dir_all(&self.settings.output_dir)
                .map_err(|e| IntakeError::io_with_path(e, &self.settings.output_dir))?;
        }

        info!("Processing {} file(s) [{}]", files.len(), self.options.mode);

        let mut summary = BatchSummary::default();
        for path in files {
            let outcome = match self.process_file(path, registry.as_mut()) {
                Ok(outcome) => outcome,
                Err(error) if error.is_batch_fatal() => return Err(error),
                Err(error) => {
                    warn!("{}: {}", path.display(), error);
                    FileOutcome::Failed { error }
                }
            };
            if let FileOutcome::Skipped { reason } = &outcome {
                info!("Skipped {}: {}", path.display(), reason);
            }
            let failed = matches!(outcome, FileOutcome::Failed { .. });
            summary.files.push(FileReport {
                path: path.clone(),
                outcome,
            });
            if failed && self.options.stop_on_first_error {
                summary.stopped_early = summary.files.len() < files.len();
                break;
            }
        }

        if let Some(registry) = &registry {
            if !self.options.dry_run && summary.succeeded() > 0 {
                summary.registry_backup = registry.save()?;
                summary.registry_saved = true;
            }
        }

        info!(
            "Done: {} succeeded, {} skipped, {} failed",
            summary.succeeded(),
            summary.skipped(),
            summary.failed()
        );
        Ok(summary)
    }

    /// Run the pipeline for one file.
    pub fn process_file(&self, path: &Path, registry: Option<&mut Registry>) -> Result<FileOutcome> {
        info!("Processing {}", path.display());
        let mut imported = ImportedFile::default();

        let pre = ProvenanceState::new(self.store).ensure_pre_hash(path)?;
        imported.pre_sha256 = pre.digest().to_string();
        debug!("Pre-modification hash {}", pre.digest());

        if !self.options.skip_lookup {
            match self.provider {
                Some(provider) => {
                    imported.tag = Some(ProviderTagger::new(self.store).ensure_tagged(&pre, provider)?);
                }
                None => debug!("No metadata provider configured, lookup skipped"),
            }
        }

        if self.options.repairs() {
            imported.repair = Some(RepairEngine::new(self.store).repair_file(path)?);
        }

        if !self.options.converts() {
            info!("{} complete for {}", self.options.mode, path.display());
            return Ok(FileOutcome::Succeeded(Box::new(imported)));
        }

        if let Some(reason) = self.preflight(path, &pre, registry.as_deref())? {
            return Ok(FileOutcome::Skipped { reason });
        }

        let plan = self.plan(path)?;
        info!(
            "{}: name {:?}, version {}, prefix {:?}, LoHa {}",
            path.display(),
            plan.name,
            plan.version.as_ref().map_or("(unresolved)", |v| v.version.as_str()),
            plan.prefix,
            plan.is_loha
        );

        if self.options.dry_run {
            info!("Dry run: would convert and register {}", path.display());
            imported.plan = Some(plan);
            return Ok(FileOutcome::Succeeded(Box::new(imported)));
        }

        let (Some(converter), Some(registry)) = (self.converter, registry) else {
            return Err(IntakeError::Config {
                message: "conversion requires a converter and a loaded registry".into(),
            });
        };

        let request = ConversionRequest {
            source: path.to_path_buf(),
            name: plan.name.clone(),
            output_dir: self.settings.output_dir.clone(),
            version: plan.version.as_ref().map(|v| v.version.clone()),
            scale_factor: self.settings.scale_factor.clone(),
        };
        let output = convert_and_collect(converter, &request)?;

        let copied = MetadataCarrier::new(self.store)
            .carry(path, &output.path)?
            .into_result(&output.path)?;
        debug!("Carried {} attributes onto {}", copied.len(), output.file_name);

        let entry = registry_entry(&pre, &plan, &output.file_name, &output.sha256);
        let registered = registry.upsert(entry);
        if let UpsertOutcome::Replaced { reason, previous_name, .. } = &registered {
            info!("Replaced registry entry {:?} ({} match)", previous_name, reason);
        }

        imported.plan = Some(plan);
        imported.output = Some(output);
        imported.registered = Some(registered);
        Ok(FileOutcome::Succeeded(Box::new(imported)))
    }

    /// Checks run before conversion. `Some(reason)` means skip the file.
    fn preflight(&self, path: &Path, pre: &PreHash, registry: Option<&Registry>) -> Result<Option<String>> {
        let size = std::fs::metadata(path)
            .map_err(|e| IntakeError::io_with_path(e, path))?
            .len();
        let limit_mb = self.settings.size_limit_mb;
        if limit_mb > 0 && size > limit_mb.saturating_mul(BYTES_PER_MB) {
            return Ok(Some(format!(
                "file too large ({} MB > {} MB limit)",
                size / BYTES_PER_MB,
                limit_mb
            )));
        }

        if let Some(model_type) = self.store.get_string(path, keys::MODEL_TYPE)? {
            if !model_type.eq_ignore_ascii_case("LORA") {
                return Ok(Some(format!("not a LoRA (provider model type {model_type:?})")));
            }
        }

        if self.options.reimport {
            return Ok(None);
        }
        let Some(registry) = registry else {
            return Ok(None);
        };

        if let Some(existing) = registry.find_by_pre_hash(pre.digest()) {
            return Ok(Some(format!("already imported as {:?} (pre-hash match)", existing.name)));
        }
        if let Some(version_id) = self.store.get_string(path, keys::VERSION_ID)? {
            if let Some(existing) = registry.find_by_version_id(version_id.trim()) {
                return Ok(Some(format!(
                    "already imported as {:?} (version id match)",
                    existing.name
                )));
            }
        }
        Ok(None)
    }

    /// Resolve name, version, trigger words and adapter kind for `path`.
    pub fn plan(&self, path: &Path) -> Result<ImportPlan> {
        let file = File::open(path).map_err(|e| IntakeError::io_with_path(e, path))?;
        let len = file
            .metadata()
            .map_err(|e| IntakeError::io_with_path(e, path))?
            .len();
        let mut reader = BufReader::new(file);
        let parsed = read_header(&mut reader, len).map_err(|e| e.with_path(path))?;

        let base_model = self.store.get_string(path, keys::BASE_MODEL)?;
        let provider_name = self.store.get_string(path, keys::NAME)?;

        let version = VersionResolver::new(self.settings.version_override.clone())
            .resolve(base_model.as_deref(), Some(&parsed.header));
        if version.is_none() {
            warn!(
                "No version resolved for {}; the converter will detect it",
                path.display()
            );
        }

        let name = derive_name(
            self.options.name_override.as_deref(),
            provider_name.as_deref(),
            path,
            base_model.as_deref(),
        );
        let words = self
            .store
            .get_string(path, keys::TRIGGER_WORDS)?
            .map(|raw| parse_trigger_words(&raw))
            .unwrap_or_default();
        let prefix = format_trigger_words(&words, version.as_ref().map(|v| v.version.as_str()));

        Ok(ImportPlan {
            name,
            version,
            prefix,
            is_loha: is_loha(&parsed.header),
            provenance: CarriedProvenance::from_attributes(self.store, path)?,
        })
    }
}

fn registry_entry(pre: &PreHash, plan: &ImportPlan, file: &str, output_sha256: &str) -> RegistryEntry {
    let mut provenance = plan.provenance.clone().unwrap_or_default();
    provenance.sha256 = Some(pre.digest().to_string());
    provenance.output_sha256 = Some(output_sha256.to_string());
    RegistryEntry {
        sha256: output_sha256.to_string(),
        name: plan.name.clone(),
        version: plan
            .version
            .as_ref()
            .map(|v| v.version.clone())
            .unwrap_or_default(),
        file: file.to_string(),
        prefix: plan.prefix.clone(),
        is_lo_ha: plan.is_loha,
        civitai: Some(provenance),
        extra: Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::MemoryAttributeStore;
    use crate::container::{serialize, ContainerHeader, HeaderEntry, TensorDescriptor};
    use crate::conversion::ConversionOutput;
    use std::cell::Cell;
    use tempfile::TempDir;

    struct FakeConverter {
        calls: Cell<usize>,
    }

    impl Converter for FakeConverter {
        fn convert(&self, request: &ConversionRequest) -> Result<ConversionOutput> {
            self.calls.set(self.calls.get() + 1);
            let file = format!("{}_lora_f16.ckpt", request.name.to_lowercase());
            std::fs::write(request.output_dir.join(file), b"converted").unwrap();
            Ok(ConversionOutput::default())
        }
    }

    fn write_source(dir: &Path, name: &str) -> PathBuf {
        let mut header = ContainerHeader::new();
        header.insert(
            "lora_unet_down.alpha",
            HeaderEntry::Tensor(TensorDescriptor::new("F16", vec![2, 2], 0, 8)),
        );
        let path = dir.join(name);
        std::fs::write(&path, serialize(&header, &[7u8; 8]).unwrap()).unwrap();
        path
    }

    fn settings(dir: &TempDir) -> ImportSettings {
        ImportSettings {
            output_dir: dir.path().join("out"),
            registry_path: dir.path().join("out/custom_lora.json"),
            backup_dir: dir.path().join("backups"),
            version_override: Some("sdxl_base_v0.9".into()),
            scale_factor: None,
            size_limit_mb: 0,
        }
    }

    #[test]
    fn test_name_override_needs_single_input() {
        let dir = TempDir::new().unwrap();
        let store = MemoryAttributeStore::new();
        let options = PipelineOptions {
            name_override: Some("Neon".into()),
            ..Default::default()
        };
        let pipeline = ImportPipeline::new(&store, settings(&dir), options);

        let err = pipeline
            .run(&[dir.path().join("a.safetensors"), dir.path().join("b.safetensors")])
            .unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn test_tag_only_stops_before_repair() {
        let dir = TempDir::new().unwrap();
        let store = MemoryAttributeStore::new();
        let source = write_source(dir.path(), "neon.safetensors");
        let options = PipelineOptions {
            mode: ImportMode::TagOnly,
            ..Default::default()
        };

        let summary = ImportPipeline::new(&store, settings(&dir), options)
            .run(&[source.clone()])
            .unwrap();

        assert_eq!(summary.succeeded(), 1);
        assert!(!summary.registry_saved);
        assert!(store.get(&source, keys::PRE_SHA256).unwrap().is_some());
        assert_eq!(store.get(&source, keys::FIX_STATE).unwrap(), None);
    }

    #[test]
    fn test_converts_and_registers() {
        let dir = TempDir::new().unwrap();
        let store = MemoryAttributeStore::new();
        let source = write_source(dir.path(), "Neon.safetensors");
        let converter = FakeConverter { calls: Cell::new(0) };

        let summary = ImportPipeline::new(&store, settings(&dir), PipelineOptions::default())
            .with_converter(&converter)
            .run(&[source.clone()])
            .unwrap();

        assert_eq!(summary.succeeded(), 1);
        assert!(summary.registry_saved);
        let registry = Registry::load(dir.path().join("out/custom_lora.json"), dir.path()).unwrap();
        let entry = &registry.entries()[0];
        assert_eq!(entry.file, "neon_f16.ckpt");
        assert_eq!(entry.name, "Neon");
        assert_eq!(entry.version, "sdxl_base_v0.9");
        let pre = store.get_string(&source, keys::PRE_SHA256).unwrap();
        assert_eq!(entry.pre_sha256(), pre.as_deref());

        let output = dir.path().join("out/neon_f16.ckpt");
        assert_eq!(store.get_string(&output, keys::PRE_SHA256).unwrap(), pre);
    }

    #[test]
    fn test_already_registered_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = MemoryAttributeStore::new();
        let source = write_source(dir.path(), "Neon.safetensors");
        let converter = FakeConverter { calls: Cell::new(0) };
        let pipeline = ImportPipeline::new(&store, settings(&dir), PipelineOptions::default())
            .with_converter(&converter);

        pipeline.run(&[source.clone()]).unwrap();
        let second = pipeline.run(&[source]).unwrap();

        assert_eq!(second.skipped(), 1);
        assert!(!second.registry_saved);
        assert_eq!(converter.calls.get(), 1);
    }

    #[test]
    fn test_non_lora_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = MemoryAttributeStore::new();
        let checkpoint = write_source(dir.path(), "base.safetensors");
        store.set(&checkpoint, keys::MODEL_TYPE, b"Checkpoint").unwrap();
        let options = PipelineOptions {
            dry_run: true,
            ..Default::default()
        };

        let summary = ImportPipeline::new(&store, settings(&dir), options)
            .run(&[checkpoint])
            .unwrap();

        match &summary.files[0].outcome {
            FileOutcome::Skipped { reason } => assert!(reason.contains("not a LoRA")),
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_size_limit_skips_large_files() {
        let dir = TempDir::new().unwrap();
        let store = MemoryAttributeStore::new();
        let large = dir.path().join("large.safetensors");
        std::fs::write(&large, vec![0u8; 2 * BYTES_PER_MB as usize]).unwrap();
        let mut limited = settings(&dir);
        limited.size_limit_mb = 1;
        let options = PipelineOptions {
            skip_fix: true,
            dry_run: true,
            ..Default::default()
        };

        let summary = ImportPipeline::new(&store, limited, options).run(&[large]).unwrap();

        match &summary.files[0].outcome {
            FileOutcome::Skipped { reason } => {
                assert_eq!(reason, "file too large (2 MB > 1 MB limit)")
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_huge_size_limit_does_not_overflow() {
        let dir = TempDir::new().unwrap();
        let store = MemoryAttributeStore::new();
        let source = write_source(dir.path(), "Neon.safetensors");
        let mut unlimited = settings(&dir);
        unlimited.size_limit_mb = u64::MAX;
        let options = PipelineOptions {
            dry_run: true,
            ..Default::default()
        };

        let summary = ImportPipeline::new(&store, unlimited, options).run(&[source]).unwrap();

        assert!(summary.files[0].outcome.is_success(), "{}", summary.files[0].outcome);
    }

    #[test]
    fn test_dry_run_plans_without_converting() {
        let dir = TempDir::new().unwrap();
        let store = MemoryAttributeStore::new();
        let source = write_source(dir.path(), "Neon.safetensors");
        store.set(&source, keys::TRIGGER_WORDS, br#"["neon","glow"]"#).unwrap();
        let converter = FakeConverter { calls: Cell::new(0) };
        let options = PipelineOptions {
            dry_run: true,
            ..Default::default()
        };

        let summary = ImportPipeline::new(&store, settings(&dir), options)
            .with_converter(&converter)
            .run(&[source])
            .unwrap();

        assert_eq!(converter.calls.get(), 0);
        assert!(!summary.registry_saved);
        assert!(!dir.path().join("out/custom_lora.json").exists());
        let FileOutcome::Succeeded(imported) = &summary.files[0].outcome else {
            panic!("expected success");
        };
        let plan = imported.plan.as_ref().unwrap();
        assert_eq!(plan.prefix, "neon, glow, ");
        assert!(!plan.is_loha);
    }

    #[test]
    fn test_stop_on_first_error() {
        let dir = TempDir::new().unwrap();
        let store = MemoryAttributeStore::new();
        let broken = dir.path().join("broken.safetensors");
        std::fs::write(&broken, b"\x02\0\0\0\0\0\0\0{").unwrap();
        let good = write_source(dir.path(), "good.safetensors");
        let options = PipelineOptions {
            mode: ImportMode::FixOnly,
            stop_on_first_error: true,
            ..Default::default()
        };

        let summary = ImportPipeline::new(&store, settings(&dir), options)
            .run(&[broken, good])
            .unwrap();

        assert_eq!(summary.files.len(), 1);
        assert!(summary.stopped_early);
        assert!(summary.has_failures());
    }
}
