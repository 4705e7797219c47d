//! LoRA intake - command-line import pipeline.
//!
//! Hashes, tags and repairs third-party LoRA files, converts them with the
//! external converter and registers the results in the Draw Things custom
//! LoRA index.

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser};
use lora_intake::attributes::{AttributeStore, SidecarStore};
use lora_intake::config::{CliOverrides, ConversionConfig, ImportSettings, UserConfig};
use lora_intake::conversion::ProcessConverter;
use lora_intake::pipeline::{collect_inputs, BatchSummary, ImportMode, ImportPipeline, PipelineOptions};
use lora_intake::provider::CivitaiClient;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "lora-intake")]
#[command(about = "Import LoRA files: hash, tag, fix headers, convert and register")]
#[command(group(ArgGroup::new("mode").args(["fix_only", "tag_only"])))]
struct Args {
    /// Files or directories to import
    #[arg(required = true, value_name = "FILE_OR_DIR")]
    inputs: Vec<PathBuf>,

    /// Directory the converter writes into
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Registry file (default: <output-dir>/custom_lora.json)
    #[arg(long)]
    json_file: Option<PathBuf>,

    /// Where registry backups are kept
    #[arg(long)]
    backup_dir: Option<PathBuf>,

    /// Version tag passed to the converter, overriding detection
    #[arg(long)]
    version: Option<String>,

    #[arg(long)]
    scale_factor: Option<String>,

    /// Display name override (single input only)
    #[arg(long)]
    name: Option<String>,

    /// Maximum source size in MB (0 = unlimited)
    #[arg(long, value_name = "MB")]
    size_limit: Option<u64>,

    /// Config file (default: $XDG_CONFIG_HOME/dt-model-helper/config)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hash, tag and fix headers only
    #[arg(long)]
    fix_only: bool,

    /// Hash and tag only
    #[arg(long)]
    tag_only: bool,

    #[arg(long)]
    skip_fix: bool,

    /// Skip the metadata provider lookup (offline / private files)
    #[arg(long)]
    skip_lookup: bool,

    /// Stop after tagging and fixing
    #[arg(long)]
    skip_convert: bool,

    /// Resolve names and versions without converting or registering
    #[arg(long)]
    dry_run: bool,

    #[arg(long)]
    stop_on_first_error: bool,

    /// Import files that are already registered, refreshing their entry
    #[arg(long)]
    reimport: bool,

    /// Keep attributes in `<file>.attrs.json` sidecars instead of xattrs
    #[arg(long)]
    sidecar: bool,

    /// Converter executable
    #[arg(long, default_value = ConversionConfig::CONVERTER_BINARY)]
    converter: PathBuf,

    /// Converter timeout in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn mode(&self) -> ImportMode {
        if self.fix_only {
            ImportMode::FixOnly
        } else if self.tag_only {
            ImportMode::TagOnly
        } else {
            ImportMode::Full
        }
    }
}

fn init_logging(debug: bool) {
    let log_level = if debug { Level::DEBUG } else { Level::INFO };
    let builder = FmtSubscriber::builder()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact();
    match EnvFilter::try_from_default_env() {
        Ok(filter) => builder.with_env_filter(filter).init(),
        Err(_) => builder.with_max_level(log_level).init(),
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn attribute_store(sidecar: bool) -> Box<dyn AttributeStore> {
    if sidecar {
        Box::new(SidecarStore::new())
    } else {
        Box::new(lora_intake::attributes::XattrStore::new())
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn attribute_store(_sidecar: bool) -> Box<dyn AttributeStore> {
    Box::new(SidecarStore::new())
}

fn print_summary(summary: &BatchSummary) {
    for report in &summary.files {
        println!("{}: {}", report.path.display(), report.outcome);
    }
    if let Some(backup) = &summary.registry_backup {
        println!("registry backup: {}", backup.display());
    }
    if summary.stopped_early {
        println!("stopped after the first failure");
    }
    println!(
        "Done: {} processed, {} skipped, {} failed",
        summary.succeeded(),
        summary.skipped(),
        summary.failed()
    );
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.debug);

    let config_path = args.config.clone().or_else(UserConfig::default_path);
    let config = match &config_path {
        Some(path) => UserConfig::load(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => UserConfig::default(),
    };

    let cli = CliOverrides {
        output_dir: args.output_dir.clone(),
        json_file: args.json_file.clone(),
        backup_dir: args.backup_dir.clone(),
        version: args.version.clone(),
        scale_factor: args.scale_factor.clone(),
        size_limit_mb: args.size_limit,
    };
    let settings = ImportSettings::resolve(&cli, &config, |key| std::env::var(key).ok())?;
    debug!("Settings: {:?}", settings);

    let files = collect_inputs(&args.inputs);
    if files.is_empty() {
        bail!("no .safetensors files found");
    }

    let options = PipelineOptions {
        mode: args.mode(),
        skip_fix: args.skip_fix,
        skip_lookup: args.skip_lookup,
        skip_convert: args.skip_convert,
        dry_run: args.dry_run,
        stop_on_first_error: args.stop_on_first_error || config.flag("stop-on-first-error"),
        reimport: args.reimport,
        name_override: args.name.clone(),
    };

    let mut converter = ProcessConverter::new(args.converter.clone());
    if let Some(secs) = args.timeout {
        converter = converter.with_timeout(Duration::from_secs(secs));
    }
    if options.converts() && !options.dry_run && !converter.is_available() {
        bail!("{} not found on PATH", converter.program().display());
    }

    let provider = CivitaiClient::new()?;
    let store = attribute_store(args.sidecar || config.flag("sidecar"));

    if options.converts() {
        info!("Output: {}", settings.output_dir.display());
        info!("Registry: {}", settings.registry_path.display());
    }

    let pipeline = ImportPipeline::new(store.as_ref(), settings, options)
        .with_provider(&provider)
        .with_converter(&converter);
    let summary = pipeline.run(&files)?;
    print_summary(&summary);

    Ok(if summary.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
