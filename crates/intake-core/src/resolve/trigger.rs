//! Trigger-word prefixes and adapter-kind detection.

use crate::container::ContainerHeader;
use serde_json::Value;

/// Versions whose text encoder is T5 or an LLM; their prompts read better
/// as sentences than as comma lists.
pub const SENTENCE_PROMPT_VERSIONS: &[&str] =
    &["flux2", "flux2_9b", "flux2_4b", "flux1", "qwen_image", "z_image"];

const LOHA_MARKERS: &[&str] = &[".hada_w1_a", ".hada_w1_b", "_hada_w1_a", "_hada_w1_b"];

/// Parse the stored trigger-word attribute: a JSON array, or a bare string
/// taken as a single word.
pub fn parse_trigger_words(raw: &str) -> Vec<String> {
    let words = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                Value::Null | Value::Bool(false) => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Ok(Value::String(s)) => vec![s],
        Ok(_) => Vec::new(),
        Err(_) => vec![raw.to_string()],
    };
    words
        .into_iter()
        .map(|w| w.trim().to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

/// Format trigger words as the registry's prompt prefix.
///
/// Sentence-style versions get `"word. word. "`; everything else gets
/// `"word, word, "`. No words yields an empty string.
pub fn format_trigger_words(words: &[String], version: Option<&str>) -> String {
    if words.is_empty() {
        return String::new();
    }
    let sentence_style = version.is_some_and(|v| SENTENCE_PROMPT_VERSIONS.contains(&v));
    if sentence_style {
        let parts: Vec<String> = words
            .iter()
            .map(|w| {
                let w = w.trim_end_matches(',').trim();
                if w.ends_with('.') {
                    w.to_string()
                } else {
                    format!("{w}.")
                }
            })
            .collect();
        format!("{} ", parts.join(" "))
    } else {
        let parts: Vec<&str> = words
            .iter()
            .map(|w| w.trim_end_matches([',', '.']).trim())
            .collect();
        format!("{}, ", parts.join(", "))
    }
}

/// Whether the adapter uses the Hadamard-product (LoHa) decomposition.
pub fn is_loha(header: &ContainerHeader) -> bool {
    header
        .tensor_names()
        .any(|name| LOHA_MARKERS.iter().any(|m| name.contains(m)))
}
