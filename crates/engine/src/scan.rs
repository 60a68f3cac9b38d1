//! Scanner module for discovering items in the source library.
//!
//! Walks the library depth-first in file-name order and fingerprints every
//! regular file it visits. Directories are never items.

use crate::fingerprint::{Fingerprint, FingerprintKind};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};
use walkdir::{DirEntry, WalkDir};

/// Audio file extensions handled by the codec tools (case-insensitive matching).
pub const AUDIO_EXTENSIONS: &[&str] = &[".flac"];

/// Errors that stop a scan.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to walk {root}: {source}")]
    Walk {
        root: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("failed to fingerprint {path}: {source}")]
    Fingerprint {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("scan interrupted")]
    Cancelled,
}

/// What an item is, which decides the actions it can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Audio,
    Other,
}

impl ItemKind {
    pub fn of(path: &Path) -> Self {
        if is_audio_file(path) {
            ItemKind::Audio
        } else {
            ItemKind::Other
        }
    }
}

/// One source-tree file observed by a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// `/`-separated path relative to the library root.
    pub key: String,
    pub path: PathBuf,
    pub kind: ItemKind,
    pub fingerprint: Fingerprint,
}

/// Entries for which this returns true are skipped; directories are pruned
/// with everything below them.
pub type IgnorePredicate = fn(&DirEntry) -> bool;

/// Matches dot-named files and directories.
pub fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

/// Matches nothing.
pub fn ignore_nothing(_entry: &DirEntry) -> bool {
    false
}

/// Checks if a file has an audio extension (case-insensitive).
pub fn is_audio_file(path: &Path) -> bool {
    has_extension(path, AUDIO_EXTENSIONS)
}

/// Case-insensitive extension check against `.ext` entries.
pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            extensions.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// Build the store key for `path` under `root`, or None for non-UTF-8 paths.
pub fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
    let parts = parts?;
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// A lazy, restartable walk over one library root.
#[derive(Debug, Clone)]
pub struct Scanner {
    root: PathBuf,
    fingerprint_kind: FingerprintKind,
    ignore: IgnorePredicate,
}

impl Scanner {
    pub fn new(root: impl Into<PathBuf>, fingerprint_kind: FingerprintKind) -> Self {
        Self {
            root: root.into(),
            fingerprint_kind,
            ignore: ignore_nothing,
        }
    }

    pub fn ignore(mut self, predicate: IgnorePredicate) -> Self {
        self.ignore = predicate;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk the tree from the start. Each call begins a fresh walk.
    pub fn items(&self) -> impl Iterator<Item = Result<Item, ScanError>> + '_ {
        let ignore = self.ignore;
        WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            // The root itself is never pruned, even if its name matches
            .filter_entry(move |entry| entry.depth() == 0 || !ignore(entry))
            .filter_map(move |entry| self.visit(entry))
    }

    fn visit(&self, entry: walkdir::Result<DirEntry>) -> Option<Result<Item, ScanError>> {
        let entry = match entry {
            Ok(entry) => entry,
            Err(source) => {
                return Some(Err(ScanError::Walk {
                    root: self.root.clone(),
                    source,
                }))
            }
        };
        let path = entry.path();
        if entry.file_type().is_dir() || !path.is_file() {
            return None;
        }

        let Some(key) = relative_key(&self.root, path) else {
            warn!(path = %path.display(), "Skipping file with a non-UTF-8 path");
            return None;
        };

        let fingerprint = match Fingerprint::compute(path, self.fingerprint_kind) {
            Ok(fingerprint) => fingerprint,
            Err(source) => {
                return Some(Err(ScanError::Fingerprint {
                    path: path.to_path_buf(),
                    source,
                }))
            }
        };
        trace!(key = %key, fingerprint = %fingerprint.value, "Scanned");

        Some(Ok(Item {
            key,
            path: path.to_path_buf(),
            kind: ItemKind::of(path),
            fingerprint,
        }))
    }

    /// Run the walk to completion, stopping early if `cancel` fires.
    pub fn collect(&self, cancel: &CancellationToken) -> Result<Vec<Item>, ScanError> {
        let mut items = Vec::new();
        for item in self.items() {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            items.push(item?);
        }
        Ok(items)
    }
}
