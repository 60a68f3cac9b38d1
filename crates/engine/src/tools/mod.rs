//! External codec tools.
//!
//! Every codec operation goes through the [`AudioTools`] trait. The real
//! backend, [`ExternalTools`], shells out to `flac` and to the configured
//! transcoder; tests substitute an in-memory fake.

pub mod flac;
pub mod transcoder;

use crate::config::Config;
use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

pub use transcoder::Transcoder;

/// Version tags of the tools found at startup. A missing tool has no tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolVersions {
    pub flac: Option<String>,
    pub transcoder: Option<String>,
}

/// Error type for external tool invocations
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with code {code}: {stderr}")]
    Failed {
        tool: &'static str,
        code: i32,
        stderr: String,
    },

    #[error("{tool} was terminated by a signal")]
    Terminated { tool: &'static str },

    #[error("{tool} timed out after {secs}s")]
    Timeout { tool: &'static str, secs: u64 },
}

/// Result of an integrity test that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,
    /// The decoder reported a problem; carries its diagnostics.
    Failed(String),
}

/// Codec capabilities the workers need.
#[async_trait]
pub trait AudioTools: Send + Sync {
    /// Probe the installed tools. Never fails; missing tools have no tag.
    async fn detect_versions(&self) -> ToolVersions;

    /// Decode `src` fully and check its integrity.
    async fn test(&self, src: &Path) -> Result<TestOutcome, ToolError>;

    /// Re-encode the FLAC file `src` into `dst`.
    async fn reencode(&self, src: &Path, dst: &Path) -> Result<(), ToolError>;

    /// Produce the lossy rendition of `src` at `dst`.
    async fn transcode(&self, src: &Path, dst: &Path) -> Result<(), ToolError>;
}

/// Backend that runs the real command-line tools.
#[derive(Debug, Clone)]
pub struct ExternalTools {
    transcoder: Transcoder,
    opus_bitrate: u32,
    flac_padding: u32,
    timeout: Duration,
}

impl ExternalTools {
    pub fn new(transcoder: Transcoder, opus_bitrate: u32, flac_padding: u32, timeout: Duration) -> Self {
        Self {
            transcoder,
            opus_bitrate,
            flac_padding,
            timeout,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            Transcoder::from(cfg.codec.transcoder),
            cfg.codec.opus_bitrate,
            cfg.codec.flac_padding,
            Duration::from_secs(cfg.workers.tool_timeout_secs),
        )
    }

    pub fn transcoder(&self) -> Transcoder {
        self.transcoder
    }
}

#[async_trait]
impl AudioTools for ExternalTools {
    async fn detect_versions(&self) -> ToolVersions {
        let flac = probe(flac::version_command(), flac::PROGRAM, self.timeout)
            .await
            .and_then(|out| flac::parse_version(&out));
        let transcoder = probe(self.transcoder.version_command(), self.transcoder.program(), self.timeout)
            .await
            .and_then(|out| self.transcoder.parse_version(&out));
        ToolVersions { flac, transcoder }
    }

    async fn test(&self, src: &Path) -> Result<TestOutcome, ToolError> {
        match run_tool(flac::test_command(src), flac::PROGRAM, self.timeout).await {
            Ok(_) => Ok(TestOutcome::Passed),
            Err(ToolError::Failed { stderr, .. }) => Ok(TestOutcome::Failed(stderr)),
            Err(e) => Err(e),
        }
    }

    async fn reencode(&self, src: &Path, dst: &Path) -> Result<(), ToolError> {
        let cmd = flac::reencode_command(src, dst, self.flac_padding);
        run_tool(cmd, flac::PROGRAM, self.timeout).await.map(drop)
    }

    async fn transcode(&self, src: &Path, dst: &Path) -> Result<(), ToolError> {
        let cmd = self.transcoder.command(src, dst, self.opus_bitrate);
        run_tool(cmd, self.transcoder.program(), self.timeout).await.map(drop)
    }
}

/// Run a version probe, returning its combined output on success.
async fn probe(cmd: Command, tool: &'static str, timeout: Duration) -> Option<String> {
    match run_tool(cmd, tool, timeout).await {
        Ok(output) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            if text.trim().is_empty() {
                text = String::from_utf8_lossy(&output.stderr).into_owned();
            }
            Some(text)
        }
        Err(e) => {
            debug!(tool, error = %e, "Tool probe failed");
            None
        }
    }
}

/// Run `cmd` to completion under `timeout`.
///
/// The child gets its own process group so a terminal Ctrl-C reaches only
/// this process, and is killed if the returned future is dropped.
pub async fn run_tool(mut cmd: Command, tool: &'static str, timeout: Duration) -> Result<Output, ToolError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(result) => result.map_err(|source| ToolError::Spawn { tool, source })?,
        Err(_) => {
            return Err(ToolError::Timeout {
                tool,
                secs: timeout.as_secs(),
            })
        }
    };

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if output.status.success() {
        if !stderr.is_empty() {
            warn!(tool, stderr = %stderr, "Tool reported warnings");
        }
        return Ok(output);
    }
    match output.status.code() {
        Some(code) => Err(ToolError::Failed { tool, code, stderr }),
        None => Err(ToolError::Terminated { tool }),
    }
}
