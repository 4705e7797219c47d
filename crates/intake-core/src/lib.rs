//! LoRA intake - headless library for importing third-party LoRA archives.
//!
//! The crate repairs safetensors-style container headers in place, records
//! each file's original hash and repair state as file attributes, carries
//! that provenance onto converted outputs and keeps a deduplicated JSON
//! registry of everything imported.
//!
//! # Example
//!
//! ```rust,no_run
//! use lora_intake::attributes::SidecarStore;
//! use lora_intake::repair::RepairEngine;
//!
//! fn main() -> lora_intake::Result<()> {
//!     let store = SidecarStore::new();
//!     let report = RepairEngine::new(&store).repair_file("style.safetensors".as_ref())?;
//!     println!("fix state: {}", report.fix_state());
//!     Ok(())
//! }
//! ```

pub mod attributes;
pub mod carrier;
pub mod config;
pub mod container;
pub mod conversion;
pub mod error;
pub mod metadata;
pub mod pipeline;
pub mod provenance;
pub mod provider;
pub mod registry;
pub mod repair;
pub mod resolve;

// Re-export commonly used types
pub use attributes::{AttributeStore, MemoryAttributeStore, SidecarStore};
pub use carrier::MetadataCarrier;
pub use config::ImportSettings;
pub use error::{IntakeError, Result};
pub use pipeline::{BatchSummary, FileOutcome, ImportMode, ImportPipeline, PipelineOptions};
pub use provenance::{FixFlags, PreHash, ProvenanceState};
pub use registry::{Registry, RegistryEntry};
pub use repair::RepairEngine;
