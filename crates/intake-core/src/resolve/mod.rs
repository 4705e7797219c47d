//! Pure derivations over provider metadata and container headers: display
//! names, version tags, trigger-word prefixes.

mod naming;
mod trigger;
mod version;

pub use naming::{base_model_prefix, derive_name, normalize_display_name, raw_name};
pub use trigger::{format_trigger_words, is_loha, parse_trigger_words, SENTENCE_PROMPT_VERSIONS};
pub use version::{
    detect_version_from_header, version_for_base_model, ResolvedVersion, VersionResolver,
    VersionSource, KNOWN_VERSIONS,
};
