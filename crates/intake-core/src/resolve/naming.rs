//! Display-name derivation for imported models.
//!
//! The target application already filters models by architecture, so
//! architecture tokens in provider names are noise and get removed. A short
//! base-model prefix (`PD-`, `IL-`, `XL-`) is added instead for the families
//! that share one architecture.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

/// Architecture and format tokens removed from names (case-insensitive,
/// whole words). Longer spellings come first so they win over their prefixes.
const STRIP_TOKENS: &[&str] = &[
    "Klein-9b", "Klein-4b", "Klein 9b", "Klein 4b", "SDXL", "SD 1.5", "SD1.5", "SD 2.1", "SD2.1",
    "Flux.2", "Flux.1", "Flux 2", "Flux 1", "Flux", "Pony", "Illustrious", "Z-Image", "LoRA",
    "LoHa", "LoCon", "9B", "4B",
];

/// Base model label → name prefix.
const NAME_PREFIXES: &[(&str, &str)] = &[("Pony", "PD-"), ("Illustrious", "IL-"), ("SDXL 1.0", "XL-")];

/// Release tokens moved to the front of Qwen model names, most recent first.
const QWEN_RELEASE_TOKENS: &[&str] = &["2512", "2511", "2509"];

static PARENTHESIZED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\([^)]*\)").expect("parenthesized regex must compile"));

static ARCH_TOKENS: LazyLock<Regex> = LazyLock::new(|| {
    let alternatives: Vec<String> = STRIP_TOKENS.iter().map(|t| regex::escape(t)).collect();
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|")))
        .expect("architecture token regex must compile")
});

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex must compile"));
static TRAILING_PIPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\|\s*$").expect("trailing pipe regex must compile"));
static LEADING_PIPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\|\s*").expect("leading pipe regex must compile"));
static INNER_PIPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\|\s*").expect("inner pipe regex must compile"));
static LEADING_JUNK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\s\-_|]+").expect("leading junk regex must compile"));
static TRAILING_JUNK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s\-_|]+$").expect("trailing junk regex must compile"));

fn collapse_whitespace(s: &str) -> String {
    WHITESPACE.replace_all(s, " ").trim().to_string()
}

/// Name prefix for a base model label, if that family has one.
pub fn base_model_prefix(base_model: &str) -> Option<&'static str> {
    NAME_PREFIXES
        .iter()
        .find(|(label, _)| *label == base_model)
        .map(|(_, prefix)| *prefix)
}

/// Clean a raw model name.
///
/// # Rules Applied
/// 1. Remove parenthesized substrings
/// 2. Remove architecture tokens
/// 3. Collapse whitespace and drop orphaned `|` separators
/// 4. Trim leading/trailing `-`, `_` and `|`
/// 5. For Qwen models, move a release token (`2512`, ...) to the front
/// 6. Add the base-model prefix unless already present
///
/// # Examples
///
/// ```
/// use lora_intake::resolve::normalize_display_name;
///
/// assert_eq!(normalize_display_name("Cinematic Light (Flux) LoRA", None), "Cinematic Light");
/// assert_eq!(normalize_display_name("Neon Style | SDXL", Some("Pony")), "PD-Neon Style");
/// ```
pub fn normalize_display_name(raw: &str, base_model: Option<&str>) -> String {
    let mut name = PARENTHESIZED.replace_all(raw, "").trim().to_string();
    name = ARCH_TOKENS.replace_all(&name, "").to_string();

    name = collapse_whitespace(&name);
    name = TRAILING_PIPE.replace_all(&name, "").to_string();
    name = LEADING_PIPE.replace_all(&name, "").to_string();
    name = INNER_PIPE.replace_all(&name, " ").to_string();
    name = LEADING_JUNK.replace_all(&name, "").to_string();
    name = TRAILING_JUNK.replace_all(&name, "").to_string();
    name = collapse_whitespace(&name);

    if base_model == Some("Qwen") {
        if let Some(token) = QWEN_RELEASE_TOKENS.iter().find(|t| name.contains(*t)) {
            let rest = name
                .replace(token, "")
                .trim_matches(|c| matches!(c, ' ' | '-' | '_'))
                .to_string();
            let rest = collapse_whitespace(&rest);
            name = if rest.is_empty() {
                token.to_string()
            } else {
                format!("{token}-{rest}")
            };
        }
    }

    if let Some(prefix) = base_model.and_then(base_model_prefix) {
        if !name.starts_with(prefix) {
            name = format!("{prefix}{name}");
        }
    }

    name
}

/// Pick the raw name: explicit override, then the provider name, then the
/// file stem. Empty values count as absent.
pub fn raw_name(override_name: Option<&str>, provider_name: Option<&str>, path: &Path) -> String {
    override_name
        .filter(|s| !s.is_empty())
        .or_else(|| provider_name.filter(|s| !s.is_empty()))
        .map(str::to_string)
        .unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
}

/// Derive the display name for a source file.
pub fn derive_name(
    override_name: Option<&str>,
    provider_name: Option<&str>,
    path: &Path,
    base_model: Option<&str>,
) -> String {
    normalize_display_name(&raw_name(override_name, provider_name, path), base_model)
}
