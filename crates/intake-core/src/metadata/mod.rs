//! Metadata persistence.
//!
//! This module provides atomic file replacement, used for JSON files
//! (registry, attribute sidecars) and for rewritten container files.

mod atomic;

pub use atomic::{atomic_read_json, atomic_replace_staged, atomic_replace_with, atomic_write_json};
