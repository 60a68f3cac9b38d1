//! Error types that end a run.
//!
//! Failures of individual items never surface here. Tool and cross-volume
//! failures are per-item (`ActionError`) and are collected into the run
//! summary instead.

use crate::playlist::PlaylistError;
use crate::scan::ScanError;
use crate::startup::StartupError;
use crate::store::StoreError;
use std::path::PathBuf;
use thiserror::Error;

/// Error type for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration or environment is unusable; nothing was touched.
    #[error("Configuration error: {0}")]
    FatalConfig(#[from] StartupError),

    /// The persisted store could not be trusted; nothing was touched.
    #[error("{0}")]
    CorruptStore(StoreError),

    /// Persisting the store failed.
    #[error("{0}")]
    Store(StoreError),

    /// The source tree could not be scanned completely.
    #[error("Scan failed: {0}")]
    Scan(ScanError),

    /// The run was interrupted before any change was made.
    #[error("Run cancelled")]
    Cancelled,

    #[error("Playlist conversion failed: {0}")]
    Playlist(#[from] PlaylistError),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Corrupt { .. } => EngineError::CorruptStore(err),
            other => EngineError::Store(other),
        }
    }
}

impl From<ScanError> for EngineError {
    fn from(err: ScanError) -> Self {
        match err {
            ScanError::Cancelled => EngineError::Cancelled,
            other => EngineError::Scan(other),
        }
    }
}
