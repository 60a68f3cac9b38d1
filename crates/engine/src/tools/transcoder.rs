//! Lossy transcoder backends.
//!
//! Two encoders can produce the Opus mirror: `opusenc` from opus-tools, or
//! `ffmpeg` with libopus. The choice is made once from the configuration.

use crate::config::TranscoderKind;
use std::path::Path;
use tokio::process::Command;

/// Extension of every transcoded mirror file.
pub const OUTPUT_EXTENSION: &str = "opus";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transcoder {
    Opusenc,
    Ffmpeg,
}

impl From<TranscoderKind> for Transcoder {
    fn from(kind: TranscoderKind) -> Self {
        match kind {
            TranscoderKind::Opusenc => Transcoder::Opusenc,
            TranscoderKind::Ffmpeg => Transcoder::Ffmpeg,
        }
    }
}

impl Transcoder {
    pub fn program(&self) -> &'static str {
        match self {
            Transcoder::Opusenc => "opusenc",
            Transcoder::Ffmpeg => "ffmpeg",
        }
    }

    pub fn version_command(&self) -> Command {
        let mut cmd = Command::new(self.program());
        match self {
            Transcoder::Opusenc => cmd.arg("--version"),
            Transcoder::Ffmpeg => cmd.arg("-version"),
        };
        cmd
    }

    /// Extract the version tag from the probe output.
    pub fn parse_version(&self, output: &str) -> Option<String> {
        match self {
            Transcoder::Opusenc => parse_opusenc_version(output),
            Transcoder::Ffmpeg => parse_ffmpeg_version(output).map(|v| format!("ffmpeg {}", v)),
        }
    }

    /// Build the command encoding `src` into an Opus file at `dst`.
    ///
    /// `bitrate` is in kbit/s.
    pub fn command(&self, src: &Path, dst: &Path, bitrate: u32) -> Command {
        let mut cmd = Command::new(self.program());
        match self {
            Transcoder::Opusenc => {
                cmd.arg("--quiet")
                    .arg("--music")
                    .arg("--bitrate")
                    .arg(bitrate.to_string())
                    .arg(src)
                    .arg(dst);
            }
            Transcoder::Ffmpeg => {
                cmd.arg("-nostdin")
                    .arg("-hide_banner")
                    .arg("-loglevel")
                    .arg("error")
                    .arg("-y")
                    .arg("-i")
                    .arg(src)
                    // Audio only; cover art streams are dropped
                    .arg("-map")
                    .arg("0:a")
                    .arg("-c:a")
                    .arg("libopus")
                    .arg("-b:a")
                    .arg(format!("{}k", bitrate))
                    .arg(dst);
            }
        }
        cmd
    }
}

/// First non-empty line, e.g. `opusenc opus-tools 0.2 (using libopus 1.4)`.
pub fn parse_opusenc_version(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(String::from)
}

/// Version token of `ffmpeg -version` output.
///
/// Handles release builds (`ffmpeg version 6.1.1 Copyright ...`) and
/// git builds (`ffmpeg version n7.0-12-gabc ...`, `N-113000-g...`).
pub fn parse_ffmpeg_version(output: &str) -> Option<String> {
    let line = output
        .lines()
        .find(|line| line.to_lowercase().starts_with("ffmpeg version"))?;
    let token = line.get("ffmpeg version".len()..)?.split_whitespace().next()?;
    let token = token.strip_prefix('n').unwrap_or(token);
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}
