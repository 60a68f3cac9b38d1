//! Startup checks run before a lane touches anything.
//!
//! Checks are run in order:
//! 1. Semantic configuration validation
//! 2. Library paths on disk
//! 3. Tools and permissions the lane depends on
//!
//! Any failure aborts the run before the store is opened for writing.

use crate::config::{Config, ConfigError, MirrorMethod};
use crate::mirror_ops::same_device;
use crate::resolve::Lane;
use crate::tools::{ToolVersions, Transcoder};
use thiserror::Error;
use tracing::{info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("Library path {0} does not exist or is not a directory")]
    SourceMissing(String),

    #[error("Playlist path {0} does not exist or is not a directory")]
    PlaylistsMissing(String),

    #[error("No playlist directories configured; set library.playlists and library.portable_playlists")]
    PlaylistsNotConfigured,

    #[error("{tool} not available; is it installed and in PATH?")]
    ToolUnavailable { tool: &'static str },

    #[error("library.allow_modification is disabled; enable it to allow reencoding the library")]
    ModificationNotAllowed,
}

/// Validate the configuration and the library root.
pub fn check_library(cfg: &Config, cpu_count: u32) -> Result<(), StartupError> {
    cfg.validate(cpu_count)?;
    if !cfg.library.source.is_dir() {
        return Err(StartupError::SourceMissing(
            cfg.library.source.display().to_string(),
        ));
    }
    Ok(())
}

/// Check that the tools and permissions `lane` needs are present.
pub fn check_lane(cfg: &Config, lane: Lane, versions: &ToolVersions) -> Result<(), StartupError> {
    let needs_flac = lane.testing() || lane == Lane::Reencode;
    if needs_flac && versions.flac.is_none() {
        return Err(StartupError::ToolUnavailable { tool: "flac" });
    }
    if lane == Lane::Reencode && !cfg.library.allow_modification {
        return Err(StartupError::ModificationNotAllowed);
    }
    if lane == Lane::Mirror {
        if versions.transcoder.is_none() {
            let tool = Transcoder::from(cfg.codec.transcoder).program();
            return Err(StartupError::ToolUnavailable { tool });
        }
        warn_on_cross_volume_links(cfg);
    }
    Ok(())
}

/// Hard links across filesystems fail per item; say so once up front.
fn warn_on_cross_volume_links(cfg: &Config) {
    if cfg.mirror.method != MirrorMethod::HardLink {
        return;
    }
    let mirror = &cfg.library.mirror;
    // The mirror may not exist yet; its nearest existing ancestor decides
    let Some(existing) = mirror.ancestors().find(|p| p.exists()) else {
        return;
    };
    if let Ok(false) = same_device(&cfg.library.source, existing) {
        warn!(
            source = %cfg.library.source.display(),
            mirror = %mirror.display(),
            "Library and mirror are on different filesystems; hard links will fail"
        );
    }
}

/// Check the playlist directories for a conversion pass.
pub fn check_playlists(cfg: &Config) -> Result<(), StartupError> {
    let (Some(library), Some(_portable)) = (&cfg.library.playlists, &cfg.library.portable_playlists) else {
        return Err(StartupError::PlaylistsNotConfigured);
    };
    if !library.is_dir() {
        return Err(StartupError::PlaylistsMissing(library.display().to_string()));
    }
    Ok(())
}

/// Run all startup checks for `lane` in order.
pub fn run_startup_checks(
    cfg: &Config,
    lane: Lane,
    versions: &ToolVersions,
    cpu_count: u32,
) -> Result<(), StartupError> {
    check_library(cfg, cpu_count)?;
    check_lane(cfg, lane, versions)?;
    info!(
        lane = lane.as_str(),
        flac = versions.flac.as_deref().unwrap_or("-"),
        transcoder = versions.transcoder.as_deref().unwrap_or("-"),
        "Startup checks passed"
    );
    Ok(())
}
