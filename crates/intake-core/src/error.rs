//! Error types for the LoRA intake pipeline.
//!
//! Every failure a single file can hit during import maps onto one variant
//! here, so batch reporting can keep per-file outcomes without string
//! matching.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the intake library.
#[derive(Debug, Error)]
pub enum IntakeError {
    // Container format errors
    #[error("Malformed container {path:?}: {message}")]
    MalformedContainer {
        message: String,
        path: Option<PathBuf>,
    },

    // Provenance errors
    #[error("Unrecoverable provenance for {path}: fix state {fix_state} is set but the pre-modification hash is missing")]
    UnrecoverableProvenance { path: PathBuf, fix_state: u8 },

    // Attribute side-channel errors
    #[error("Attribute {key} on {path}: {message}")]
    AttributeIo {
        path: PathBuf,
        key: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Registry errors
    #[error("Registry {path} is corrupt: {message}")]
    RegistryCorrupt { path: PathBuf, message: String },

    // External collaborators (metadata provider, converter)
    #[error("{step} failed: {message}")]
    ExternalStepFailed {
        step: String,
        message: String,
        timed_out: bool,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for intake operations.
pub type Result<T> = std::result::Result<T, IntakeError>;

impl From<std::io::Error> for IntakeError {
    fn from(err: std::io::Error) -> Self {
        IntakeError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for IntakeError {
    fn from(err: serde_json::Error) -> Self {
        IntakeError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl IntakeError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        IntakeError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a malformed-container error for a file on disk.
    pub fn malformed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        IntakeError::MalformedContainer {
            message: message.into(),
            path: Some(path.into()),
        }
    }

    /// Create an attribute error without an underlying OS error.
    pub fn attribute(
        path: impl Into<PathBuf>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        IntakeError::AttributeIo {
            path: path.into(),
            key: key.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create an external-step error.
    pub fn external(step: impl Into<String>, message: impl Into<String>) -> Self {
        IntakeError::ExternalStepFailed {
            step: step.into(),
            message: message.into(),
            timed_out: false,
        }
    }

    /// Attach a path to a malformed-container error raised by the pure codec.
    pub fn with_path(self, path: impl Into<PathBuf>) -> Self {
        match self {
            IntakeError::MalformedContainer {
                message,
                path: None,
            } => IntakeError::MalformedContainer {
                message,
                path: Some(path.into()),
            },
            other => other,
        }
    }

    /// Whether this error must abort the whole batch rather than one file.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(self, IntakeError::RegistryCorrupt { .. })
    }

    /// Short machine-readable kind, used in batch summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            IntakeError::MalformedContainer { .. } => "malformed_container",
            IntakeError::UnrecoverableProvenance { .. } => "unrecoverable_provenance",
            IntakeError::AttributeIo { .. } => "attribute_io",
            IntakeError::RegistryCorrupt { .. } => "registry_corrupt",
            IntakeError::ExternalStepFailed { .. } => "external_step_failed",
            IntakeError::Io { .. } => "io",
            IntakeError::Json { .. } => "json",
            IntakeError::Config { .. } => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IntakeError::UnrecoverableProvenance {
            path: PathBuf::from("/models/a.safetensors"),
            fix_state: 3,
        };
        assert_eq!(
            err.to_string(),
            "Unrecoverable provenance for /models/a.safetensors: fix state 3 is set but the pre-modification hash is missing"
        );
    }

    #[test]
    fn test_only_registry_corruption_is_batch_fatal() {
        assert!(IntakeError::RegistryCorrupt {
            path: PathBuf::from("custom_lora.json"),
            message: "expected value".into(),
        }
        .is_batch_fatal());
        assert!(!IntakeError::external("LoRAConverter", "exit 1").is_batch_fatal());
        assert!(!IntakeError::malformed("a.safetensors", "short").is_batch_fatal());
    }

    #[test]
    fn test_with_path_fills_missing_path_only() {
        let err = IntakeError::MalformedContainer {
            message: "bad".into(),
            path: None,
        }
        .with_path("x.safetensors");
        match err {
            IntakeError::MalformedContainer { path, .. } => {
                assert_eq!(path, Some(PathBuf::from("x.safetensors")))
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = IntakeError::external("lookup", "boom").with_path("x");
        assert_eq!(err.kind(), "external_step_failed");
    }
}
