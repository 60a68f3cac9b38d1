//! Fingerprint store: the persisted record of what has been processed and with what.
//!
//! The store is one TOML document with a table per item key. Records are kept
//! in a `BTreeMap`, so the serialized key order is deterministic and a diff of
//! two flushes shows only what changed. Fields a user adds by hand to a record
//! are carried through load and flush untouched.
//!
//! Writes never touch the persisted file in place: a flush writes a temporary
//! file next to it and renames it over the old one.

use crate::fingerprint::{Fingerprint, FingerprintKind};
use crate::scan::ItemKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

/// Version of the on-disk layout this build reads and writes.
pub const STORE_FORMAT: u32 = 1;

/// Errors raised by the fingerprint store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The persisted file exists but cannot be trusted.
    #[error("fingerprint store {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("failed to read fingerprint store {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write fingerprint store {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize fingerprint store: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The run has stopped; no mutation may reach the store any more.
    #[error("fingerprint store is sealed")]
    Sealed,
}

/// Outcome of an action, keyed to the fingerprint it was performed against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub fingerprint: String,
    /// Tool-version tag (for mirrored files, the mirror method).
    pub tool: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStamp {
    pub fingerprint: String,
    pub tool: String,
    pub passed: bool,
}

/// Persisted metadata for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub kind: ItemKind,
    pub fingerprint: String,
    pub fingerprint_kind: FingerprintKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<TestStamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reencode: Option<Stamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcode: Option<Stamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<Stamp>,
    /// Fields this build does not know about, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

impl Record {
    pub fn new(kind: ItemKind, fingerprint: Fingerprint) -> Self {
        Self {
            kind,
            fingerprint: fingerprint.value,
            fingerprint_kind: fingerprint.kind,
            test: None,
            reencode: None,
            transcode: None,
            mirror: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn current_fingerprint(&self) -> Fingerprint {
        Fingerprint::new(self.fingerprint_kind, self.fingerprint.clone())
    }
}

/// All records, ordered by key.
pub type Records = BTreeMap<String, Record>;

#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default = "default_format")]
    format: u32,
    #[serde(default)]
    records: Records,
}

fn default_format() -> u32 {
    STORE_FORMAT
}

/// A successful action, as recorded in the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StampUpdate {
    Tested {
        fingerprint: String,
        tool: String,
        passed: bool,
    },
    /// The source file was rewritten in place; `previous` is its fingerprint
    /// before the rewrite.
    Reencoded {
        previous: String,
        fingerprint: String,
        tool: String,
    },
    Transcoded {
        fingerprint: String,
        tool: String,
    },
    Mirrored {
        fingerprint: String,
        method: String,
    },
}

/// One change to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Create the record or refresh its fingerprint, keeping action stamps.
    Observe {
        key: String,
        kind: ItemKind,
        fingerprint: Fingerprint,
    },
    Stamp {
        key: String,
        update: StampUpdate,
    },
    Delete {
        key: String,
    },
}

impl Mutation {
    pub fn key(&self) -> &str {
        match self {
            Mutation::Observe { key, .. } | Mutation::Stamp { key, .. } | Mutation::Delete { key } => {
                key
            }
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    records: Records,
    dirty: bool,
    sealed: bool,
}

/// Shared, mutex-guarded fingerprint store backed by one file.
#[derive(Debug)]
pub struct FingerprintStore {
    path: PathBuf,
    state: Mutex<StoreState>,
    /// Serializes flushes so an older snapshot never replaces a newer one.
    flush_lock: Mutex<()>,
}

impl FingerprintStore {
    /// Open the store at `path`, loading any persisted records.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = Self::load(&path)?;
        debug!(path = %path.display(), records = records.len(), "Loaded fingerprint store");
        Ok(Self {
            path,
            state: Mutex::new(StoreState {
                records,
                dirty: false,
                sealed: false,
            }),
            flush_lock: Mutex::new(()),
        })
    }

    /// Read the persisted records at `path`.
    ///
    /// A missing or empty file yields no records. Anything that does not
    /// parse is reported as corrupt and never repaired.
    pub fn load(path: &Path) -> Result<Records, StoreError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Records::new()),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(StoreError::Corrupt {
                    path: path.to_path_buf(),
                    reason: "file is not valid UTF-8".to_string(),
                })
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        parse_document(&content).map_err(|reason| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consistent point-in-time copy of every record.
    pub fn snapshot(&self) -> Records {
        self.state().records.clone()
    }

    pub fn get(&self, key: &str) -> Option<Record> {
        self.state().records.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when mutations have been applied since the last flush.
    pub fn is_dirty(&self) -> bool {
        self.state().dirty
    }

    /// Apply mutations as one atomic merge.
    pub fn apply(&self, mutations: impl IntoIterator<Item = Mutation>) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.sealed {
            return Err(StoreError::Sealed);
        }
        for mutation in mutations {
            apply_one(&mut state.records, mutation);
        }
        state.dirty = true;
        Ok(())
    }

    /// Refuse every later mutation.
    pub fn seal(&self) {
        self.state().sealed = true;
    }

    /// Durably persist the current records.
    ///
    /// Safe to call repeatedly. The previous file stays intact if any step fails.
    pub fn flush(&self) -> Result<(), StoreError> {
        let _flushing = self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let records = {
            let mut state = self.state();
            state.dirty = false;
            state.records.clone()
        };

        let result = render_document(&records)
            .and_then(|text| write_atomic(&self.path, text.as_bytes()));
        if result.is_err() {
            self.state().dirty = true;
        } else {
            debug!(path = %self.path.display(), records = records.len(), "Flushed fingerprint store");
        }
        result
    }

    /// Copy the persisted file to `<path>.bak`, if it exists.
    pub fn backup(&self) -> Result<Option<PathBuf>, StoreError> {
        if !self.path.is_file() {
            return Ok(None);
        }
        let backup = backup_path(&self.path);
        fs::copy(&self.path, &backup).map_err(|source| StoreError::Write {
            path: backup.clone(),
            source,
        })?;
        Ok(Some(backup))
    }
}

/// `<path>.bak`
pub fn backup_path(path: &Path) -> PathBuf {
    let mut backup = path.as_os_str().to_owned();
    backup.push(".bak");
    PathBuf::from(backup)
}

fn parse_document(content: &str) -> Result<Records, String> {
    if content.trim().is_empty() {
        return Ok(Records::new());
    }
    let document: StoreDocument = toml::from_str(content).map_err(|e| e.to_string())?;
    if document.format != STORE_FORMAT {
        return Err(format!(
            "unsupported store format {} (expected {})",
            document.format, STORE_FORMAT
        ));
    }
    Ok(document.records)
}

fn render_document(records: &Records) -> Result<String, StoreError> {
    #[derive(Serialize)]
    struct Borrowed<'a> {
        format: u32,
        records: &'a Records,
    }
    let body = toml::to_string_pretty(&Borrowed {
        format: STORE_FORMAT,
        records,
    })?;
    Ok(format!("# tunemirror fingerprint store\n{}", body))
}

fn apply_one(records: &mut Records, mutation: Mutation) {
    match mutation {
        Mutation::Observe {
            key,
            kind,
            fingerprint,
        } => match records.get_mut(&key) {
            Some(record) => {
                record.kind = kind;
                record.fingerprint = fingerprint.value;
                record.fingerprint_kind = fingerprint.kind;
            }
            None => {
                records.insert(key, Record::new(kind, fingerprint));
            }
        },
        Mutation::Stamp { key, update } => {
            let Some(record) = records.get_mut(&key) else {
                warn!(key = %key, "Dropping action result for an item with no record");
                return;
            };
            apply_stamp(record, update);
        }
        Mutation::Delete { key } => {
            records.remove(&key);
        }
    }
}

fn apply_stamp(record: &mut Record, update: StampUpdate) {
    match update {
        StampUpdate::Tested {
            fingerprint,
            tool,
            passed,
        } => {
            record.test = Some(TestStamp {
                fingerprint,
                tool,
                passed,
            });
        }
        StampUpdate::Reencoded {
            previous,
            fingerprint,
            tool,
        } => {
            // A transcode made from the pre-reencode file is still a faithful
            // rendition of the rewritten one.
            if let Some(transcode) = record.transcode.as_mut() {
                if transcode.fingerprint == previous {
                    transcode.fingerprint = fingerprint.clone();
                }
            }
            record.fingerprint = fingerprint.clone();
            record.test = Some(TestStamp {
                fingerprint: fingerprint.clone(),
                tool: tool.clone(),
                passed: true,
            });
            record.reencode = Some(Stamp { fingerprint, tool });
        }
        StampUpdate::Transcoded { fingerprint, tool } => {
            record.transcode = Some(Stamp { fingerprint, tool });
        }
        StampUpdate::Mirrored {
            fingerprint,
            method,
        } => {
            record.mirror = Some(Stamp {
                fingerprint,
                tool: method,
            });
        }
    }
}

/// Write `contents` to `path` through a synced temporary file and a rename.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let write_err = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(write_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(write_err)?;
    tmp.write_all(contents).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;

    #[cfg(unix)]
    {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}
