//! Command lines for the reference FLAC encoder.

use std::path::Path;
use tokio::process::Command;

pub const PROGRAM: &str = "flac";

pub fn version_command() -> Command {
    let mut cmd = Command::new(PROGRAM);
    cmd.arg("--version");
    cmd
}

/// Turn `flac --version` output (`flac 1.4.3`) into the tag stored in stamps.
pub fn parse_version(output: &str) -> Option<String> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let version = line.strip_prefix("flac")?.trim();
    if version.is_empty() {
        return None;
    }
    Some(format!("reference libFLAC {}", version))
}

/// Full decode test; warnings count as errors.
pub fn test_command(src: &Path) -> Command {
    let mut cmd = Command::new(PROGRAM);
    cmd.arg("-t").arg("-w").arg("-s").arg(src);
    cmd
}

/// Best-compression re-encode of `src` into `dst`, verified while encoding.
pub fn reencode_command(src: &Path, dst: &Path, padding: u32) -> Command {
    let mut cmd = Command::new(PROGRAM);
    cmd.arg("--silent")
        .arg("--best")
        .arg("--verify")
        .arg(format!("--padding={}", padding))
        .arg("--no-preserve-modtime")
        .arg(src)
        .arg("-o")
        .arg(dst);
    cmd
}
