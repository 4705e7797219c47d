//! Metadata provider lookup and attribute tagging.
//!
//! A provider resolves a file's pre-modification hash to a model-version
//! record. The fields the rest of the pipeline needs are written onto the
//! source file as `civitai.*` attributes, together with the model page URL
//! as the file's where-from origin.

#[cfg(feature = "civitai-client")]
mod civitai;

#[cfg(feature = "civitai-client")]
pub use civitai::CivitaiClient;

use crate::attributes::{keys, where_froms, AttributeStore};
use crate::config::ProviderConfig;
use crate::provenance::PreHash;
use crate::Result;
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};

/// A model-version record as returned by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRecord {
    raw: Value,
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl ProviderRecord {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Model-version id.
    pub fn version_id(&self) -> Option<String> {
        self.raw.get("id").and_then(scalar_text)
    }

    pub fn model_id(&self) -> Option<String> {
        self.raw.get("modelId").and_then(scalar_text)
    }

    pub fn model_type(&self) -> Option<String> {
        self.raw.pointer("/model/type").and_then(scalar_text)
    }

    pub fn base_model(&self) -> Option<String> {
        self.raw.get("baseModel").and_then(scalar_text)
    }

    /// Model display name.
    pub fn name(&self) -> Option<String> {
        self.raw.pointer("/model/name").and_then(scalar_text)
    }

    /// Name of the primary downloadable file, falling back to the first one.
    pub fn file_name(&self) -> Option<String> {
        let files = self.raw.get("files")?.as_array()?;
        files
            .iter()
            .find(|f| f.get("primary").and_then(Value::as_bool) == Some(true))
            .or_else(|| files.first())
            .and_then(|f| f.get("name"))
            .and_then(scalar_text)
    }

    /// Preview image URLs.
    pub fn image_urls(&self) -> Vec<String> {
        self.raw
            .get("images")
            .and_then(Value::as_array)
            .map(|images| {
                images
                    .iter()
                    .filter_map(|i| i.get("url").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Model page URL recorded as the where-from origin.
    pub fn model_page_url(&self) -> Option<String> {
        self.model_id()
            .map(|id| format!("{}{}", ProviderConfig::MODEL_PAGE_URL, id))
    }

    /// Attribute key/value pairs for every field present in the record.
    ///
    /// Lists and objects are stored as compact JSON, scalars as text.
    pub fn attribute_values(&self) -> Vec<(&'static str, Vec<u8>)> {
        let fields: [(&str, Option<&Value>); 9] = [
            (keys::VERSION_ID, self.raw.get("id")),
            (keys::MODEL_ID, self.raw.get("modelId")),
            (keys::MODEL_TYPE, self.raw.pointer("/model/type")),
            (keys::BASE_MODEL, self.raw.get("baseModel")),
            (keys::NSFW_LEVEL, self.raw.get("nsfwLevel")),
            (keys::TRIGGER_WORDS, self.raw.get("trainedWords")),
            (keys::NAME, self.raw.pointer("/model/name")),
            (keys::AIR, self.raw.get("air")),
            (keys::DESCRIPTION, self.raw.get("description")),
        ];

        let mut values: Vec<(&'static str, Vec<u8>)> = fields
            .into_iter()
            .filter_map(|(key, value)| attribute_bytes(value?).map(|bytes| (key, bytes)))
            .collect();
        if let Some(file_name) = self.file_name() {
            values.push((keys::FILE_NAME, file_name.into_bytes()));
        }
        let images = self.image_urls();
        if !images.is_empty() {
            if let Ok(encoded) = serde_json::to_vec(&images) {
                values.push((keys::IMAGES, encoded));
            }
        }
        values
    }
}

fn attribute_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.as_bytes().to_vec()),
        Value::Bool(_) | Value::Number(_) => Some(value.to_string().into_bytes()),
        Value::Array(_) | Value::Object(_) => serde_json::to_vec(value).ok(),
    }
}

/// Outcome of a provider lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    Found(ProviderRecord),
    NotFound,
}

/// Capability resolving a SHA-256 to provider metadata.
///
/// Transport failures and timeouts are `ExternalStepFailed`; an unknown hash
/// is `Ok(LookupOutcome::NotFound)`.
pub trait MetadataProvider {
    fn lookup(&self, sha256: &str) -> Result<LookupOutcome>;
}

impl<P: MetadataProvider + ?Sized> MetadataProvider for &P {
    fn lookup(&self, sha256: &str) -> Result<LookupOutcome> {
        (**self).lookup(sha256)
    }
}

impl<P: MetadataProvider + ?Sized> MetadataProvider for Box<P> {
    fn lookup(&self, sha256: &str) -> Result<LookupOutcome> {
        (**self).lookup(sha256)
    }
}

/// What [`ProviderTagger::ensure_tagged`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagOutcome {
    /// Provider attributes were already present
    AlreadyTagged,
    /// Fresh attributes were written
    Tagged {
        fields: usize,
        where_from: Option<String>,
    },
    /// The provider does not know this hash
    NotFound,
}

/// Writes provider records onto files as attributes.
pub struct ProviderTagger<'a> {
    store: &'a dyn AttributeStore,
}

impl<'a> ProviderTagger<'a> {
    pub fn new(store: &'a dyn AttributeStore) -> Self {
        Self { store }
    }

    /// Whether `path` already carries provider metadata.
    pub fn has_provider_data(&self, path: &Path) -> Result<bool> {
        Ok(self.store.get(path, keys::BASE_MODEL)?.is_some())
    }

    /// Write `record`'s fields, the metadata version stamp and the where-from
    /// URL onto `path`. Returns the number of record fields written.
    pub fn tag(&self, path: &Path, record: &ProviderRecord) -> Result<TagOutcome> {
        let values = record.attribute_values();
        for (key, value) in &values {
            self.store.set(path, key, value)?;
        }
        self.store.set(
            path,
            keys::METADATA_VERSION,
            ProviderConfig::METADATA_VERSION.as_bytes(),
        )?;

        let where_from = record.model_page_url();
        if let Some(url) = &where_from {
            self.store
                .set(path, keys::WHERE_FROMS, &where_froms::encode(&[url.as_str()]))?;
        }

        Ok(TagOutcome::Tagged {
            fields: values.len(),
            where_from,
        })
    }

    /// Look up and tag `pre.path()` unless provider data is already present.
    pub fn ensure_tagged(&self, pre: &PreHash, provider: &dyn MetadataProvider) -> Result<TagOutcome> {
        let path = pre.path();
        if self.has_provider_data(path)? {
            debug!("Provider attributes already present on {}", path.display());
            return Ok(TagOutcome::AlreadyTagged);
        }

        match provider.lookup(pre.digest())? {
            LookupOutcome::Found(record) => {
                let outcome = self.tag(path, &record)?;
                if let TagOutcome::Tagged { fields, where_from } = &outcome {
                    info!(
                        "Tagged {} with {} provider fields (origin: {})",
                        path.display(),
                        fields,
                        where_from.as_deref().unwrap_or("none")
                    );
                }
                Ok(outcome)
            }
            LookupOutcome::NotFound => {
                info!("No provider record for {}", path.display());
                Ok(TagOutcome::NotFound)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::MemoryAttributeStore;
    use crate::provenance::ProvenanceState;
    use crate::IntakeError;
    use serde_json::json;
    use std::cell::Cell;
    use tempfile::TempDir;

    fn sample_record() -> ProviderRecord {
        ProviderRecord::new(json!({
            "id": 67890,
            "modelId": 12345,
            "name": "v1.0",
            "baseModel": "Pony",
            "nsfwLevel": 1,
            "trainedWords": ["neon", "glow"],
            "air": "urn:air:sdxl:lora:civitai:12345@67890",
            "description": null,
            "model": {"name": "Neon Glow", "type": "LORA"},
            "files": [
                {"name": "extra.zip", "primary": false},
                {"name": "neon_glow.safetensors", "primary": true}
            ],
            "images": [{"url": "https://image.example/1.jpeg"}]
        }))
    }

    struct CountingProvider {
        calls: Cell<usize>,
        outcome: Option<LookupOutcome>,
    }

    impl MetadataProvider for CountingProvider {
        fn lookup(&self, _sha256: &str) -> Result<LookupOutcome> {
            self.calls.set(self.calls.get() + 1);
            self.outcome
                .clone()
                .ok_or_else(|| IntakeError::external("metadata lookup", "connection refused"))
        }
    }

    #[test]
    fn test_record_accessors() {
        let record = sample_record();
        assert_eq!(record.version_id().as_deref(), Some("67890"));
        assert_eq!(record.model_type().as_deref(), Some("LORA"));
        assert_eq!(record.name().as_deref(), Some("Neon Glow"));
        assert_eq!(record.file_name().as_deref(), Some("neon_glow.safetensors"));
        assert_eq!(
            record.model_page_url().as_deref(),
            Some("https://civitai.com/models/12345")
        );
    }

    #[test]
    fn test_attribute_encoding() {
        let values = sample_record().attribute_values();
        let get = |key: &str| {
            values
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| String::from_utf8(v.clone()).unwrap())
        };
        assert_eq!(get(keys::TRIGGER_WORDS).as_deref(), Some(r#"["neon","glow"]"#));
        assert_eq!(get(keys::NSFW_LEVEL).as_deref(), Some("1"));
        assert_eq!(get(keys::BASE_MODEL).as_deref(), Some("Pony"));
        assert_eq!(get(keys::IMAGES).as_deref(), Some(r#"["https://image.example/1.jpeg"]"#));
        assert_eq!(get(keys::DESCRIPTION), None);
    }

    fn hashed_file(dir: &TempDir, store: &MemoryAttributeStore) -> PreHash {
        let path = dir.path().join("neon.safetensors");
        std::fs::write(&path, b"abc").unwrap();
        ProvenanceState::new(store).ensure_pre_hash(&path).unwrap()
    }

    #[test]
    fn test_ensure_tagged_writes_fields_and_origin() {
        let dir = TempDir::new().unwrap();
        let store = MemoryAttributeStore::new();
        let pre = hashed_file(&dir, &store);
        let provider = CountingProvider {
            calls: Cell::new(0),
            outcome: Some(LookupOutcome::Found(sample_record())),
        };

        let outcome = ProviderTagger::new(&store).ensure_tagged(&pre, &provider).unwrap();

        assert!(matches!(outcome, TagOutcome::Tagged { fields: 10, .. }));
        assert_eq!(
            store.get_string(pre.path(), keys::METADATA_VERSION).unwrap().as_deref(),
            Some("1")
        );
        let origin = store.get(pre.path(), keys::WHERE_FROMS).unwrap().unwrap();
        assert_eq!(
            where_froms::decode(&origin),
            Some(vec!["https://civitai.com/models/12345".to_string()])
        );
    }

    #[test]
    fn test_already_tagged_skips_lookup() {
        let dir = TempDir::new().unwrap();
        let store = MemoryAttributeStore::new();
        let pre = hashed_file(&dir, &store);
        store.set(pre.path(), keys::BASE_MODEL, b"SDXL 1.0").unwrap();
        let provider = CountingProvider {
            calls: Cell::new(0),
            outcome: None,
        };

        let outcome = ProviderTagger::new(&store).ensure_tagged(&pre, &provider).unwrap();

        assert_eq!(outcome, TagOutcome::AlreadyTagged);
        assert_eq!(provider.calls.get(), 0);
    }

    #[test]
    fn test_not_found_and_error() {
        let dir = TempDir::new().unwrap();
        let store = MemoryAttributeStore::new();
        let pre = hashed_file(&dir, &store);
        let tagger = ProviderTagger::new(&store);

        let missing = CountingProvider {
            calls: Cell::new(0),
            outcome: Some(LookupOutcome::NotFound),
        };
        assert_eq!(tagger.ensure_tagged(&pre, &missing).unwrap(), TagOutcome::NotFound);

        let failing = CountingProvider {
            calls: Cell::new(0),
            outcome: None,
        };
        let err = tagger.ensure_tagged(&pre, &failing).unwrap_err();
        assert_eq!(err.kind(), "external_step_failed");
        assert_eq!(store.get(pre.path(), keys::BASE_MODEL).unwrap(), None);
    }
}
