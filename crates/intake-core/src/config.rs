//! Centralized configuration for the intake pipeline.
//!
//! Compile-time constants live in unit structs, like the rest of the code
//! expects. Runtime settings are resolved from CLI values, the user config
//! file, the environment and defaults, in that order.

use crate::{IntakeError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Container format limits.
pub struct ContainerConfig;

impl ContainerConfig {
    /// Sanity cap on the declared JSON header length.
    pub const MAX_HEADER_BYTES: u64 = 100 * 1024 * 1024;
    /// Reserved non-tensor header key.
    pub const METADATA_KEY: &'static str = "__metadata__";
    /// Tensor-name prefix left behind by some trainers.
    pub const KEY_PREFIX: &'static str = "model.diffusion_model.";
    /// Read buffer for hashing and data-region copies (16MB).
    pub const COPY_CHUNK_SIZE: usize = 16 * 1024 * 1024;
}

/// Registry persistence.
pub struct RegistryConfig;

impl RegistryConfig {
    pub const DEFAULT_FILE_NAME: &'static str = "custom_lora.json";
    pub const MAX_BACKUPS: usize = 10;
    pub const BACKUP_TIMESTAMP_FORMAT: &'static str = "%Y%m%d_%H%M%S_%6f";
}

/// Metadata provider.
pub struct ProviderConfig;

impl ProviderConfig {
    pub const BY_HASH_URL: &'static str = "https://civitai.com/api/v1/model-versions/by-hash/";
    pub const MODEL_PAGE_URL: &'static str = "https://civitai.com/models/";
    pub const USER_AGENT: &'static str = concat!("lora-intake/", env!("CARGO_PKG_VERSION"));
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
    pub const METADATA_VERSION: &'static str = "1";
}

/// External conversion step.
pub struct ConversionConfig;

impl ConversionConfig {
    pub const CONVERTER_BINARY: &'static str = "LoRAConverter";
    pub const OUTPUT_EXTENSION: &'static str = "ckpt";
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1800);
    pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
}

/// Shared directory and path configuration.
pub struct PathsConfig;

impl PathsConfig {
    pub const CONFIG_SUBPATH: &'static str = "dt-model-helper/config";
    pub const DEFAULT_OUTPUT_SUBPATH: &'static str =
        "Library/Containers/com.liuliu.draw-things/Data/Documents/Models";
    pub const BACKUP_SUBPATH: &'static str = ".cache/kernkraft235";
    pub const OUTPUT_DIR_ENV: &'static str = "DT_OUTPUT_DIR";
    pub const JSON_FILE_ENV: &'static str = "DT_JSON_FILE";
    pub const DEFAULT_SIZE_LIMIT_MB: u64 = 1200;
}

/// Key/value pairs from the user config file.
///
/// Keys are CLI flag names without the leading `--`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserConfig {
    values: HashMap<String, String>,
}

impl UserConfig {
    /// Default config file location: `$XDG_CONFIG_HOME/dt-model-helper/config`,
    /// falling back to `~/.config/dt-model-helper/config`.
    pub fn default_path() -> Option<PathBuf> {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))?;
        Some(base.join(PathsConfig::CONFIG_SUBPATH))
    }

    /// Load the config file if present. A missing file yields an empty config.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text =
            std::fs::read_to_string(path).map_err(|e| IntakeError::io_with_path(e, path))?;
        debug!("Loaded config from {}", path.display());
        Ok(Self::parse(&text))
    }

    /// Parse `key=value` lines; `#` starts a comment line, surrounding quotes
    /// are stripped from values.
    pub fn parse(text: &str) -> Self {
        let values = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .filter_map(|(key, value)| {
                let key = key.trim();
                let value = value.trim().trim_matches(|c| c == '\'' || c == '"');
                (!key.is_empty()).then(|| (key.to_string(), value.to_string()))
            })
            .collect();
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn flag(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }
}

/// Values supplied on the command line. `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub output_dir: Option<PathBuf>,
    pub json_file: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub version: Option<String>,
    pub scale_factor: Option<String>,
    pub size_limit_mb: Option<u64>,
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSettings {
    pub output_dir: PathBuf,
    pub registry_path: PathBuf,
    pub backup_dir: PathBuf,
    pub version_override: Option<String>,
    pub scale_factor: Option<String>,
    /// Maximum source size in MB; 0 disables the check.
    pub size_limit_mb: u64,
}

impl ImportSettings {
    /// Resolve settings with precedence CLI > config file > environment > default.
    ///
    /// `env` is injected so resolution can be tested without touching the
    /// process environment.
    pub fn resolve(
        cli: &CliOverrides,
        config: &UserConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let home = dirs::home_dir();

        let output_dir = cli
            .output_dir
            .clone()
            .or_else(|| config.get("output-dir").map(PathBuf::from))
            .or_else(|| env(PathsConfig::OUTPUT_DIR_ENV).map(PathBuf::from))
            .or_else(|| home.as_ref().map(|h| h.join(PathsConfig::DEFAULT_OUTPUT_SUBPATH)))
            .ok_or_else(|| IntakeError::Config {
                message: "no output directory configured and no home directory found".into(),
            })?;

        let registry_path = cli
            .json_file
            .clone()
            .or_else(|| config.get("json-file").map(PathBuf::from))
            .or_else(|| env(PathsConfig::JSON_FILE_ENV).map(PathBuf::from))
            .unwrap_or_else(|| output_dir.join(RegistryConfig::DEFAULT_FILE_NAME));

        let backup_dir = cli
            .backup_dir
            .clone()
            .or_else(|| config.get("backup-dir").map(PathBuf::from))
            .or_else(|| home.as_ref().map(|h| h.join(PathsConfig::BACKUP_SUBPATH)))
            .ok_or_else(|| IntakeError::Config {
                message: "no backup directory configured and no home directory found".into(),
            })?;

        let size_limit_mb = match (cli.size_limit_mb, config.get("size-limit")) {
            (Some(limit), _) => limit,
            (None, Some(raw)) => raw.parse().map_err(|_| IntakeError::Config {
                message: format!("size-limit must be a whole number of MB, got {raw:?}"),
            })?,
            (None, None) => PathsConfig::DEFAULT_SIZE_LIMIT_MB,
        };

        Ok(Self {
            output_dir,
            registry_path,
            backup_dir,
            version_override: cli
                .version
                .clone()
                .or_else(|| config.get("version").map(str::to_string)),
            scale_factor: cli
                .scale_factor
                .clone()
                .or_else(|| config.get("scale-factor").map(str::to_string)),
            size_limit_mb,
        })
    }
}
