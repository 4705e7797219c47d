//! Converter backed by an external program.

use super::{ConversionOutput, ConversionRequest, Converter};
use crate::config::ConversionConfig;
use crate::{IntakeError, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Resolve `program` against `PATH`, or check it directly if it has a
/// directory component.
pub fn find_on_path(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Read `reader` to the end, keeping whatever arrived before a read error.
fn read_lossy<R: Read>(stream: &str, mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf) {
        warn!("Failed to read converter {}: {}", stream, e);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn drain<R: Read + Send + 'static>(stream: &'static str, reader: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || reader.map(|r| read_lossy(stream, r)).unwrap_or_default())
}

fn spawn(program: &Path, request: &ConversionRequest) -> std::io::Result<Child> {
    let mut attempts = 0;
    loop {
        let result = Command::new(program)
            .args(request.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        match result {
            // A freshly installed binary can still be open for writing in a
            // forked child elsewhere.
            #[cfg(unix)]
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempts < 5 => {
                attempts += 1;
                thread::sleep(Duration::from_millis(50));
            }
            other => return other,
        }
    }
}

/// Runs the converter binary with a wall-clock timeout.
#[derive(Debug, Clone)]
pub struct ProcessConverter {
    program: PathBuf,
    timeout: Duration,
}

impl Default for ProcessConverter {
    fn default() -> Self {
        Self {
            program: PathBuf::from(ConversionConfig::CONVERTER_BINARY),
            timeout: ConversionConfig::DEFAULT_TIMEOUT,
        }
    }
}

impl ProcessConverter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn is_available(&self) -> bool {
        find_on_path(&self.program).is_some()
    }

    fn step(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

impl Converter for ProcessConverter {
    fn convert(&self, request: &ConversionRequest) -> Result<ConversionOutput> {
        let step = self.step();
        debug!("Running {} {:?}", self.program.display(), request.args());

        let mut child = spawn(&self.program, request)
            .map_err(|e| IntakeError::external(&step, format!("failed to start: {e}")))?;

        // Pipes are drained on their own threads so a chatty converter cannot
        // block on a full pipe while we wait for it.
        let stdout = drain("stdout", child.stdout.take());
        let stderr = drain("stderr", child.stderr.take());

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= self.timeout => {
                    warn!("{} exceeded {:?}, killing it", step, self.timeout);
                    if let Err(e) = child.kill().and_then(|()| child.wait().map(drop)) {
                        warn!("Failed to stop {}: {}", step, e);
                    }
                    return Err(IntakeError::ExternalStepFailed {
                        step,
                        message: format!("timed out after {}s", self.timeout.as_secs()),
                        timed_out: true,
                    });
                }
                Ok(None) => thread::sleep(ConversionConfig::POLL_INTERVAL),
                Err(e) => {
                    if let Err(kill) = child.kill() {
                        warn!("Failed to stop {}: {}", step, kill);
                    }
                    return Err(IntakeError::external(&step, format!("wait failed: {e}")));
                }
            }
        };

        let output = ConversionOutput {
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        };

        if !status.success() {
            let detail = output.stderr.trim();
            let code = status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Err(IntakeError::external(
                step,
                if detail.is_empty() {
                    format!("exit status {code}")
                } else {
                    format!("exit status {code}: {detail}")
                },
            ));
        }

        Ok(output)
    }
}
