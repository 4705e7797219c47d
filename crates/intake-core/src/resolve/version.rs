//! Target version resolution.
//!
//! Sources, first non-empty wins:
//! 1. explicit override
//! 2. the provider's base-model label
//! 3. tensor-name heuristics over the container header

use crate::container::ContainerHeader;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;
use tracing::debug;

/// Version tags the converter accepts.
pub const KNOWN_VERSIONS: &[&str] = &[
    "z_image",
    "flux2_9b",
    "flux2_4b",
    "flux2",
    "qwen_image",
    "sdxl_base_v0.9",
    "sd3",
    "sd3_large",
    "pixart",
    "auraflow",
    "flux1",
    "v1",
    "v2",
];

/// Provider base-model label → version tag.
const BASE_MODEL_VERSIONS: &[(&str, &str)] = &[
    ("ZImageTurbo", "z_image"),
    ("Flux.2 Klein 9B", "flux2_9b"),
    ("Flux.2 Klein 4B", "flux2_4b"),
    ("Pony", "sdxl_base_v0.9"),
    ("Illustrious", "sdxl_base_v0.9"),
    ("SDXL 1.0", "sdxl_base_v0.9"),
    ("Qwen", "qwen_image"),
];

const ARCHITECTURE_KEY: &str = "modelspec.architecture";

static TRANSFORMER_BLOCK_INDEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[._])transformer_blocks[._](\d+)[._]")
        .expect("transformer block regex must compile")
});

/// Where a resolved version came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionSource {
    Override,
    BaseModel,
    TensorNames,
}

impl fmt::Display for VersionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSource::Override => write!(f, "override"),
            VersionSource::BaseModel => write!(f, "base model"),
            VersionSource::TensorNames => write!(f, "tensor names"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVersion {
    pub version: String,
    pub source: VersionSource,
}

/// Version tag for a provider base-model label: exact match first, then the
/// first table label contained in `base_model`.
pub fn version_for_base_model(base_model: &str) -> Option<&'static str> {
    let label = base_model.trim();
    if label.is_empty() {
        return None;
    }
    BASE_MODEL_VERSIONS
        .iter()
        .find(|(known, _)| *known == label)
        .or_else(|| {
            let lower = label.to_lowercase();
            BASE_MODEL_VERSIONS
                .iter()
                .find(|(known, _)| lower.contains(&known.to_lowercase()))
        })
        .map(|(_, version)| *version)
}

/// Guess the version from tensor names, for files without provider data.
pub fn detect_version_from_header(header: &ContainerHeader) -> Option<&'static str> {
    let names: HashSet<&str> = header.tensor_names().collect();
    let joined = names.iter().copied().collect::<Vec<_>>().join(" ");
    let has = |needles: &[&str]| needles.iter().any(|n| joined.contains(n));

    let architecture = header
        .metadata()
        .and_then(|m| m.get(ARCHITECTURE_KEY))
        .and_then(|v| v.as_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    // Flux architectures fall through to block counting for the variant.
    if !architecture.is_empty() && !architecture.contains("flux") {
        if architecture.contains("sdxl") {
            return Some("sdxl_base_v0.9");
        }
        if architecture.contains("z_image") || architecture.contains("zimageturbo") {
            return Some("z_image");
        }
        if architecture.contains("qwen") {
            return Some("qwen_image");
        }
    }

    // Last single block index per Flux.2 variant.
    for (index, version) in [(39, "flux2"), (23, "flux2_9b"), (19, "flux2_4b")] {
        let needles = [
            format!("single_blocks.{index}.linear1"),
            format!("single_blocks_{index}_linear1"),
            format!("single_transformer_blocks.{index}."),
            format!("single_transformer_blocks_{index}_"),
        ];
        if needles.iter().any(|n| joined.contains(n.as_str())) {
            return Some(version);
        }
    }

    if has(&["layers.29.feed_forward.w3.", "layers_29_feed_forward_w3"]) {
        return Some("z_image");
    }

    if has(&[
        "transformer_blocks.59.txt_mlp.",
        "transformer_blocks_59_txt_mlp",
        "transformer_blocks.37.attn.",
        "transformer_blocks_37_attn_",
    ]) {
        return Some("qwen_image");
    }

    // Diffusers-style naming: count transformer blocks.
    let max_block = names
        .iter()
        .filter_map(|n| TRANSFORMER_BLOCK_INDEX.captures(n))
        .filter_map(|c| c[1].parse::<u32>().ok())
        .max();
    let double_stream = names.iter().any(|n| n.contains("double_stream_modulation"));
    if max_block.is_some() || double_stream {
        let flux_family = double_stream || architecture.contains("flux");
        let max_block = max_block.unwrap_or(0);
        if flux_family || max_block >= 19 {
            return Some(match max_block {
                24.. => "flux2",
                20..=23 => "flux2_9b",
                _ => "flux2_4b",
            });
        }
    }

    for (name, tensor) in header.tensors() {
        if name.replace('.', "_").contains("input_blocks_4_1_transformer_blocks_0_attn2_to_k")
            && tensor.shape.last() == Some(&2048)
        {
            return Some("sdxl_base_v0.9");
        }
    }

    None
}

/// Resolves the version tag for each file of a batch.
#[derive(Debug, Clone, Default)]
pub struct VersionResolver {
    override_version: Option<String>,
}

impl VersionResolver {
    pub fn new(override_version: Option<String>) -> Self {
        Self {
            override_version: override_version.filter(|v| !v.trim().is_empty()),
        }
    }

    pub fn resolve(
        &self,
        base_model: Option<&str>,
        header: Option<&ContainerHeader>,
    ) -> Option<ResolvedVersion> {
        let resolved = if let Some(version) = &self.override_version {
            Some((version.clone(), VersionSource::Override))
        } else if let Some(version) = base_model.and_then(version_for_base_model) {
            Some((version.to_string(), VersionSource::BaseModel))
        } else {
            header
                .and_then(detect_version_from_header)
                .map(|v| (v.to_string(), VersionSource::TensorNames))
        };

        resolved.map(|(version, source)| {
            debug!("Resolved version {} from {}", version, source);
            ResolvedVersion { version, source }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{HeaderEntry, TensorDescriptor};
    use serde_json::{json, Map};

    fn header(names: &[&str]) -> ContainerHeader {
        let mut header = ContainerHeader::new();
        for name in names {
            header.insert(*name, HeaderEntry::Tensor(TensorDescriptor::new("F16", vec![0], 0, 0)));
        }
        header
    }

    #[test]
    fn test_override_always_wins() {
        let resolver = VersionResolver::new(Some("flux2_9b".into()));
        let h = header(&["single_transformer_blocks.39.attn.to_q.lora_A.weight"]);
        let resolved = resolver.resolve(Some("Pony"), Some(&h)).unwrap();
        assert_eq!(resolved.version, "flux2_9b");
        assert_eq!(resolved.source, VersionSource::Override);
    }

    #[test]
    fn test_base_model_table() {
        assert_eq!(version_for_base_model("Flux.2 Klein 9B"), Some("flux2_9b"));
        assert_eq!(version_for_base_model("Illustrious"), Some("sdxl_base_v0.9"));
        assert_eq!(version_for_base_model("Qwen 2"), Some("qwen_image"));
        assert_eq!(version_for_base_model("SD 1.5"), None);
        assert_eq!(version_for_base_model(""), None);
    }

    #[test]
    fn test_base_model_beats_heuristics() {
        let resolver = VersionResolver::default();
        let h = header(&["single_blocks.39.linear1.lora_down.weight"]);
        let resolved = resolver.resolve(Some("ZImageTurbo"), Some(&h)).unwrap();
        assert_eq!(resolved.version, "z_image");
        assert_eq!(resolved.source, VersionSource::BaseModel);

        let fallback = resolver.resolve(Some("Unknown"), Some(&h)).unwrap();
        assert_eq!(fallback.version, "flux2");
        assert_eq!(fallback.source, VersionSource::TensorNames);
    }

    #[test]
    fn test_single_block_counts() {
        let nine = header(&["lora_unet_single_blocks_23_linear1.lora_up.weight"]);
        assert_eq!(detect_version_from_header(&nine), Some("flux2_9b"));
        let four = header(&["single_transformer_blocks.19.proj_out.lora_A.weight"]);
        assert_eq!(detect_version_from_header(&four), Some("flux2_4b"));
    }

    #[test]
    fn test_diffusers_block_counting() {
        let h = header(&[
            "transformer_blocks.0.attn.to_q.lora_A.weight",
            "transformer_blocks.21.attn.to_q.lora_A.weight",
        ]);
        assert_eq!(detect_version_from_header(&h), Some("flux2_9b"));

        let small = header(&["double_stream_modulation_img.lin.lora_A.weight"]);
        assert_eq!(detect_version_from_header(&small), Some("flux2_4b"));
    }

    #[test]
    fn test_z_image_and_qwen_signatures() {
        let z = header(&["diffusion_model.layers.29.feed_forward.w3.lora_A.weight"]);
        assert_eq!(detect_version_from_header(&z), Some("z_image"));
        let q = header(&["transformer_blocks.59.txt_mlp.net.2.lora_A.weight"]);
        assert_eq!(detect_version_from_header(&q), Some("qwen_image"));
    }

    #[test]
    fn test_sdxl_by_cross_attention_width() {
        let mut h = ContainerHeader::new();
        h.insert(
            "lora_unet_input_blocks_4_1_transformer_blocks_0_attn2_to_k.lora_down.weight",
            HeaderEntry::Tensor(TensorDescriptor::new("F16", vec![8, 2048], 0, 32768)),
        );
        assert_eq!(detect_version_from_header(&h), Some("sdxl_base_v0.9"));
    }

    #[test]
    fn test_architecture_metadata() {
        let mut h = header(&["unet.some.weight"]);
        let mut meta = Map::new();
        meta.insert(ARCHITECTURE_KEY.into(), json!("stable-diffusion-xl-v1-base/lora sdxl"));
        h.insert("__metadata__", HeaderEntry::Metadata(meta));
        assert_eq!(detect_version_from_header(&h), Some("sdxl_base_v0.9"));
    }

    #[test]
    fn test_unresolved() {
        let resolver = VersionResolver::new(Some("  ".into()));
        assert_eq!(resolver.resolve(None, Some(&header(&["x.weight"]))), None);
        assert_eq!(resolver.resolve(None, None), None);
    }
}
