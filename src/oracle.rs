//! Process-backed oracle: runs the external disassembler on one probe.
//!
//! Every call gets its own scratch artifact, so probes never share state and
//! may run concurrently.

use std::fmt;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;

use crate::config::ProbeConfig;
use crate::{ArchitectureProfile, Encoding, Invocation, Oracle, ProbeError};

/// Marks a field the disassembler could not decode.
const UNCERTAINTY_MARKER: char = '?';
/// Lower-cased substrings that mark a rejected encoding.
const ERROR_MARKERS: [&str; 2] = ["error", "fatal"];
/// How often a running child is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Errors the oracle can answer with
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    /// Output contains the uncertainty marker
    #[error("ambiguous decode")]
    Ambiguous,

    /// Output contains an error marker, or nothing at all
    #[error("disassembler fault: {0}")]
    Fault(String),

    /// The tool could not be launched, or did not finish in time
    #[error("process failure: {0}")]
    ProcessFailure(String),
}

impl OracleError {
    /// Only launch failures are worth retrying; the others are answers.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OracleError::ProcessFailure(_))
    }
}

/// Classify raw tool output into a decode or an error answer.
pub fn classify_output(output: String) -> Result<String, OracleError> {
    if output.trim().is_empty() {
        return Err(OracleError::Fault("empty output".to_string()));
    }
    if output.contains(UNCERTAINTY_MARKER) {
        return Err(OracleError::Ambiguous);
    }
    let lowered = output.to_lowercase();
    if ERROR_MARKERS.iter().any(|m| lowered.contains(m)) {
        let line = output
            .lines()
            .find(|l| {
                let l = l.to_lowercase();
                ERROR_MARKERS.iter().any(|m| l.contains(m))
            })
            .unwrap_or("")
            .trim()
            .to_string();
        return Err(OracleError::Fault(line));
    }
    Ok(output)
}

/// An oracle that shells out to `nvdisasm` / `cuobjdump` (or whatever tool
/// the profile names).
#[derive(Debug, Clone)]
pub struct ProcessOracle {
    timeout: Duration,
    retries: u32,
}

impl ProcessOracle {
    /// Build an oracle using the timeout and retry budget from `config`.
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            retries: config.retries,
        }
    }

    /// Make sure the profile's tool can be launched at all.
    ///
    /// Any exit status counts as success; only a spawn failure or a hang
    /// is reported, as [`ProbeError::Oracle`].
    pub fn check(&self, profile: &ArchitectureProfile) -> Result<(), ProbeError> {
        let mut cmd = Command::new(&profile.tool);
        cmd.arg("--version");
        let banner = run_bounded(cmd, &profile.tool, self.timeout)?;
        log::debug!(
            "{} is available: {}",
            profile.tool,
            banner.lines().next().unwrap_or("").trim()
        );
        Ok(())
    }

    /// Write the probe into a fresh scratch artifact.
    fn scratch(
        &self,
        encoding: Encoding,
        profile: &ArchitectureProfile,
    ) -> Result<NamedTempFile, OracleError> {
        let image = match &profile.invocation {
            Invocation::RawBinary => encoding.to_le_bytes().to_vec(),
            Invocation::Templated { template, patch_offset } => {
                patch_template(template, *patch_offset, encoding)?
            }
        };
        let suffix = match profile.invocation {
            Invocation::RawBinary => ".bin",
            Invocation::Templated { .. } => ".cubin",
        };

        let mut file = tempfile::Builder::new()
            .prefix("bitsieve-")
            .suffix(suffix)
            .tempfile()
            .map_err(|e| scratch_failure(&e))?;
        file.write_all(&image).map_err(|e| scratch_failure(&e))?;
        file.flush().map_err(|e| scratch_failure(&e))?;
        Ok(file)
    }

    fn probe_once(
        &self,
        encoding: Encoding,
        profile: &ArchitectureProfile,
    ) -> Result<String, OracleError> {
        let scratch = self.scratch(encoding, profile)?;
        let mut cmd = Command::new(&profile.tool);
        cmd.args(&profile.tool_args).arg(scratch.path());
        let output = run_bounded(cmd, &profile.tool, self.timeout)?;
        // scratch is removed here, after the tool has exited
        drop(scratch);
        classify_output(output)
    }
}

impl fmt::Display for ProcessOracle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessOracle(timeout={:?}, retries={})", self.timeout, self.retries)
    }
}

impl Oracle for ProcessOracle {
    fn disassemble(
        &self,
        encoding: Encoding,
        profile: &ArchitectureProfile,
    ) -> Result<String, OracleError> {
        let mut attempt = 0;
        loop {
            match self.probe_once(encoding, profile) {
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    log::debug!("{}: {} (retry {}/{})", encoding, e, attempt, self.retries);
                }
                other => return other,
            }
        }
    }
}

/// Copy of `template` with the encoding written at `offset`.
fn patch_template(template: &Path, offset: u64, encoding: Encoding) -> Result<Vec<u8>, OracleError> {
    let mut image = std::fs::read(template).map_err(|e| {
        OracleError::ProcessFailure(format!("cannot read template {}: {}", template.display(), e))
    })?;
    let start = usize::try_from(offset)
        .ok()
        .filter(|s| s.checked_add(8).is_some_and(|end| end <= image.len()))
        .ok_or_else(|| {
            OracleError::ProcessFailure(format!(
                "patch offset {} outside template {} ({} bytes)",
                offset,
                template.display(),
                image.len()
            ))
        })?;
    image[start..start + 8].copy_from_slice(&encoding.to_le_bytes());
    Ok(image)
}

fn scratch_failure(e: &std::io::Error) -> OracleError {
    OracleError::ProcessFailure(format!("cannot create scratch file: {}", e))
}

/// Run `cmd` to completion with stdout and stderr merged, killing it after
/// `timeout`.
fn run_bounded(mut cmd: Command, tool: &str, timeout: Duration) -> Result<String, OracleError> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| OracleError::ProcessFailure(format!("failed to launch {}: {}", tool, e)))?;

    let stdout = child.stdout.take().map(|s| thread::spawn(move || drain(s)));
    let stderr = child.stderr.take().map(|s| thread::spawn(move || drain(s)));

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(OracleError::ProcessFailure(format!(
                    "{} timed out after {:?}",
                    tool, timeout
                )));
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                let _ = child.kill();
                return Err(OracleError::ProcessFailure(format!("waiting on {}: {}", tool, e)));
            }
        }
    }

    let mut output = String::new();
    for reader in [stdout, stderr].into_iter().flatten() {
        let text = reader
            .join()
            .map_err(|_| OracleError::ProcessFailure(format!("{} output reader panicked", tool)))?;
        output.push_str(&text);
    }
    Ok(output)
}

fn drain<R: Read>(mut pipe: R) -> String {
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}
