//! Registry entry types.

use crate::attributes::{keys, AttributeStore};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// One converted model as listed in the consuming application's index.
///
/// Fields the application adds on its own are kept in `extra` so entries that
/// are not replaced round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// SHA-256 of the output file
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub name: String,
    /// Target version tag, empty when unresolved
    #[serde(default)]
    pub version: String,
    /// Output filename, relative to the output directory
    #[serde(default)]
    pub file: String,
    /// Trigger-word prompt prefix
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub is_lo_ha: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub civitai: Option<CarriedProvenance>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RegistryEntry {
    /// Pre-modification hash of the source file, if recorded.
    pub fn pre_sha256(&self) -> Option<&str> {
        self.civitai
            .as_ref()
            .and_then(|c| c.sha256.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// Provider version id derived from the resource identifier.
    pub fn version_id(&self) -> Option<String> {
        self.civitai.as_ref().and_then(CarriedProvenance::version_id)
    }
}

/// Provenance carried from the source file into its registry entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CarriedProvenance {
    /// Pre-modification SHA-256 of the source file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(rename = "baseModel", default, skip_serializing_if = "Option::is_none")]
    pub base_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Resource identifier, e.g. `urn:air:sdxl:lora:civitai:12345@67890`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub air: Option<String>,
    #[serde(rename = "nsfwLevel", default, skip_serializing_if = "Option::is_none")]
    pub nsfw_level: Option<Value>,
    /// SHA-256 of the produced output file
    #[serde(rename = "outputSha256", default, skip_serializing_if = "Option::is_none")]
    pub output_sha256: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CarriedProvenance {
    /// Collect carried provenance from the attributes on `path`.
    ///
    /// Returns `None` when the file carries none of the fields.
    pub fn from_attributes(store: &dyn AttributeStore, path: &Path) -> Result<Option<Self>> {
        let carried = CarriedProvenance {
            sha256: store.get_string(path, keys::PRE_SHA256)?,
            base_model: store.get_string(path, keys::BASE_MODEL)?,
            name: store.get_string(path, keys::NAME)?,
            air: store.get_string(path, keys::AIR)?,
            nsfw_level: store
                .get_string(path, keys::NSFW_LEVEL)?
                .map(|raw| serde_json::from_str(&raw).unwrap_or(Value::String(raw))),
            output_sha256: None,
            extra: Map::new(),
        };
        Ok((carried != CarriedProvenance::default()).then_some(carried))
    }

    /// Version id: the trailing numeric component of the resource identifier,
    /// or an explicit `id` field written by older tooling.
    pub fn version_id(&self) -> Option<String> {
        self.air
            .as_deref()
            .and_then(version_id_from_air)
            .or_else(|| match self.extra.get("id") {
                Some(Value::Number(n)) => Some(n.to_string()),
                Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
                _ => None,
            })
    }
}

/// Trailing run of ASCII digits in a resource identifier.
pub fn version_id_from_air(air: &str) -> Option<String> {
    let trimmed = air.trim();
    let digits = trimmed
        .bytes()
        .rev()
        .take_while(u8::is_ascii_digit)
        .count();
    (digits > 0).then(|| trimmed[trimmed.len() - digits..].to_string())
}
