//! External checkpoint conversion.
//!
//! The converter itself is an opaque external program; this module only
//! describes the request, runs the program behind the [`Converter`] trait and
//! locates the file it produced.

mod output;
mod process;

pub use output::{clean_output_name, convert_and_collect, newest_new_output, snapshot_outputs, ConvertedOutput};
pub use process::{find_on_path, ProcessConverter};

use crate::Result;
use std::ffi::OsString;
use std::path::PathBuf;

/// Inputs for one conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub source: PathBuf,
    /// Display name the converter embeds and derives the output name from
    pub name: String,
    pub output_dir: PathBuf,
    /// Target version tag; the converter's own detection is used when absent
    pub version: Option<String>,
    pub scale_factor: Option<String>,
}

impl ConversionRequest {
    /// Command-line arguments for the converter.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--file".into(),
            self.source.clone().into_os_string(),
            "--name".into(),
            self.name.clone().into(),
            "--output-directory".into(),
            self.output_dir.clone().into_os_string(),
        ];
        if let Some(version) = &self.version {
            args.push("--version".into());
            args.push(version.into());
        }
        if let Some(scale) = &self.scale_factor {
            args.push("--scale-factor".into());
            args.push(scale.into());
        }
        args
    }
}

/// Captured converter output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversionOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Capability running one conversion to completion.
///
/// A non-zero exit or a timeout is `ExternalStepFailed`.
pub trait Converter {
    fn convert(&self, request: &ConversionRequest) -> Result<ConversionOutput>;
}

impl<C: Converter + ?Sized> Converter for &C {
    fn convert(&self, request: &ConversionRequest) -> Result<ConversionOutput> {
        (**self).convert(request)
    }
}

impl<C: Converter + ?Sized> Converter for Box<C> {
    fn convert(&self, request: &ConversionRequest) -> Result<ConversionOutput> {
        (**self).convert(request)
    }
}
