//! Fingerprint computation for source items.
//!
//! A fingerprint summarizes an item's content state. Two kinds exist and their
//! values are never comparable with each other.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224};
use std::fs::File;
use std::io;
use std::path::Path;

pub use crate::config::FingerprintKind;

/// A fingerprint value tagged with the kind that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub kind: FingerprintKind,
    pub value: String,
}

impl Fingerprint {
    pub fn new(kind: FingerprintKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }

    /// Compute the fingerprint of the file at `path`.
    pub fn compute(path: &Path, kind: FingerprintKind) -> io::Result<Self> {
        let value = match kind {
            FingerprintKind::Mtime => mtime_fingerprint(path)?,
            FingerprintKind::ContentHash => content_hash(path)?,
        };
        Ok(Self { kind, value })
    }
}

/// RFC 3339 UTC timestamp of the last modification, with nanoseconds.
pub fn mtime_fingerprint(path: &Path) -> io::Result<String> {
    let modified = std::fs::metadata(path)?.modified()?;
    let timestamp: DateTime<Utc> = modified.into();
    Ok(timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true))
}

/// Lowercase hex SHA-224 digest of the file contents.
pub fn content_hash(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha224::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}
