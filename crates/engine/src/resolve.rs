//! Action resolver: decides what must happen to each item, without doing it.
//!
//! Rules, first match wins:
//! 1. removed from the source -> `DeleteStaleRecord`
//! 2. no native action in this lane -> `Skip`
//! 3. force-all -> native action
//! 4. new, changed, or the lane's stamp is missing or was made from another
//!    fingerprint -> native action
//! 5. tool-update recheck and the stamp's tool tag differs from the detected
//!    one -> native action
//! 6. otherwise `Skip`
//!
//! Resolution is followed by [`settle_mirror_paths`], which gives every
//! mirror path a single owner.

use crate::config::MirrorMethod;
use crate::mirror_ops::{mirror_path, transcode_path};
use crate::plan::{Change, PlanEntry, ReconciliationPlan};
use crate::scan::{Item, ItemKind};
use crate::store::Record;
use crate::tools::ToolVersions;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The concrete operation chosen for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Skip,
    Test,
    Reencode,
    Transcode,
    MirrorCopy,
    MirrorLink,
    DeleteStaleRecord,
}

/// What an interruption does to an action already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    /// Runs to completion; its result is applied.
    Cooperative,
    /// Killed on interruption; counted as not done.
    MustTerminate,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Skip => "skip",
            Action::Test => "test",
            Action::Reencode => "reencode",
            Action::Transcode => "transcode",
            Action::MirrorCopy => "mirror_copy",
            Action::MirrorLink => "mirror_link",
            Action::DeleteStaleRecord => "delete_stale_record",
        }
    }

    pub fn interruption(&self) -> Interruption {
        match self {
            Action::Test | Action::Transcode => Interruption::MustTerminate,
            Action::Skip
            | Action::Reencode
            | Action::MirrorCopy
            | Action::MirrorLink
            | Action::DeleteStaleRecord => Interruption::Cooperative,
        }
    }

    /// Whether executing this action touches files or the store.
    pub fn is_work(&self) -> bool {
        *self != Action::Skip
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The operation a run is performing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Record the library; test audio items when `testing` is set.
    Scan { testing: bool },
    /// Rewrite audio items in place.
    Reencode,
    /// Bring the mirror up to date.
    Mirror,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Scan { .. } => "scan",
            Lane::Reencode => "reencode",
            Lane::Mirror => "mirror",
        }
    }

    pub fn testing(&self) -> bool {
        matches!(self, Lane::Scan { testing: true })
    }
}

/// Flags steering the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveOptions {
    pub lane: Lane,
    pub force_all: bool,
    pub tool_update: bool,
    pub mirror_method: MirrorMethod,
}

impl ResolveOptions {
    pub fn new(lane: Lane) -> Self {
        Self {
            lane,
            force_all: false,
            tool_update: false,
            mirror_method: MirrorMethod::default(),
        }
    }
}

/// One resolved (item, action) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAction {
    pub key: String,
    pub action: Action,
    /// What the item gets in this lane when it needs work.
    pub native: Option<Action>,
    /// Present unless the item was removed.
    pub item: Option<Item>,
    /// The record before this run, if any.
    pub record: Option<Record>,
}

impl PlannedAction {
    /// Action kind this entry is reported under: skips count against the
    /// native action they stand in for.
    pub fn counted_as(&self) -> Action {
        match (self.action, self.native) {
            (Action::Skip, Some(native)) => native,
            (action, _) => action,
        }
    }
}

/// The action an item receives in `lane` whenever it needs work.
pub fn native_action(lane: Lane, kind: ItemKind, method: MirrorMethod) -> Option<Action> {
    match (lane, kind) {
        (Lane::Scan { testing: true }, ItemKind::Audio) => Some(Action::Test),
        (Lane::Scan { .. }, _) => None,
        (Lane::Reencode, ItemKind::Audio) => Some(Action::Reencode),
        (Lane::Reencode, ItemKind::Other) => None,
        (Lane::Mirror, ItemKind::Audio) => Some(Action::Transcode),
        (Lane::Mirror, ItemKind::Other) => match method {
            MirrorMethod::Copy => Some(Action::MirrorCopy),
            MirrorMethod::SoftLink | MirrorMethod::HardLink => Some(Action::MirrorLink),
        },
    }
}

/// Fingerprint and tool tag last recorded for `action` on `record`.
fn stamp_for(record: &Record, action: Action) -> Option<(&str, &str)> {
    // Test stamps carry an outcome and live in their own type
    if action == Action::Test {
        return record
            .test
            .as_ref()
            .map(|s| (s.fingerprint.as_str(), s.tool.as_str()));
    }
    let stamp = match action {
        Action::Reencode => record.reencode.as_ref(),
        Action::Transcode => record.transcode.as_ref(),
        Action::MirrorCopy | Action::MirrorLink => record.mirror.as_ref(),
        Action::Test | Action::Skip | Action::DeleteStaleRecord => None,
    };
    stamp.map(|s| (s.fingerprint.as_str(), s.tool.as_str()))
}

/// Tool tag that would perform `action` now.
fn current_tool<'a>(
    action: Action,
    versions: &'a ToolVersions,
    method: MirrorMethod,
) -> Option<&'a str> {
    match action {
        Action::Test | Action::Reencode => versions.flac.as_deref(),
        Action::Transcode => versions.transcoder.as_deref(),
        Action::MirrorCopy | Action::MirrorLink => Some(method.as_str()),
        Action::Skip | Action::DeleteStaleRecord => None,
    }
}

/// Decide the action for one plan entry.
pub fn resolve_entry(entry: &PlanEntry, options: &ResolveOptions, versions: &ToolVersions) -> Action {
    if entry.change == Change::Removed {
        return Action::DeleteStaleRecord;
    }
    let Some(item) = entry.item.as_ref() else {
        return Action::Skip;
    };
    let Some(native) = native_action(options.lane, item.kind, options.mirror_method) else {
        return Action::Skip;
    };
    if options.force_all {
        return native;
    }
    if matches!(entry.change, Change::New | Change::Changed) {
        return native;
    }

    let stamp = entry.record.as_ref().and_then(|r| stamp_for(r, native));
    let Some((stamped_fingerprint, stamped_tool)) = stamp else {
        return native;
    };
    if stamped_fingerprint != item.fingerprint.value {
        return native;
    }

    if options.tool_update {
        if let Some(current) = current_tool(native, versions, options.mirror_method) {
            if current != stamped_tool {
                return native;
            }
        }
    }

    Action::Skip
}

/// Resolve every plan entry, in key order.
pub fn resolve(
    plan: &ReconciliationPlan,
    options: &ResolveOptions,
    versions: &ToolVersions,
) -> Vec<PlannedAction> {
    plan.entries()
        .map(|entry| PlannedAction {
            key: entry.key.clone(),
            action: resolve_entry(entry, options, versions),
            native: entry
                .item
                .as_ref()
                .and_then(|item| native_action(options.lane, item.kind, options.mirror_method)),
            item: entry.item.clone(),
            record: entry.record.clone(),
        })
        .collect()
}

/// Path an item of `kind` occupies under the mirror root.
pub fn mirror_target(key: &str, kind: ItemKind) -> PathBuf {
    match kind {
        ItemKind::Audio => transcode_path(Path::new(""), key),
        ItemKind::Other => mirror_path(Path::new(""), key),
    }
}

/// A present item whose mirror path belongs to another item.
#[derive(Debug, Clone, PartialEq)]
pub struct PathConflict {
    /// Carries the native action the item could not perform.
    pub planned: PlannedAction,
    pub claimed_by: String,
}

/// Give every mirror path a single owner.
///
/// Present items claim their mirror paths in key order. In the mirror lane
/// a later item landing on a claimed path (`x.flac` and `x.FLAC`, or
/// `x.flac` and `x.opus`) is withdrawn and returned as a conflict. In every
/// lane a removed record loses the stamps of artifacts at claimed paths, so
/// its deletion cannot remove another item's output.
pub fn settle_mirror_paths(
    lane: Lane,
    actions: Vec<PlannedAction>,
) -> (Vec<PlannedAction>, Vec<PathConflict>) {
    let mut owners: HashMap<PathBuf, &str> = HashMap::new();
    let mut losers: HashMap<String, String> = HashMap::new();
    for planned in &actions {
        let Some(item) = &planned.item else { continue };
        let target = mirror_target(&planned.key, item.kind);
        match owners.get(&target) {
            Some(owner) => {
                losers.insert(planned.key.clone(), owner.to_string());
            }
            None => {
                owners.insert(target, &planned.key);
            }
        }
    }
    let claimed = |path: PathBuf| owners.contains_key(&path);

    let mut kept = Vec::with_capacity(actions.len());
    let mut conflicts = Vec::new();
    for mut planned in actions.iter().cloned() {
        if planned.action == Action::DeleteStaleRecord {
            if let Some(record) = planned.record.as_mut() {
                if claimed(transcode_path(Path::new(""), &planned.key)) {
                    record.transcode = None;
                }
                if claimed(mirror_path(Path::new(""), &planned.key)) {
                    record.mirror = None;
                }
            }
        }
        match losers.remove(&planned.key) {
            Some(claimed_by) if lane == Lane::Mirror => {
                planned.action = planned.native.unwrap_or(planned.action);
                conflicts.push(PathConflict { planned, claimed_by });
            }
            _ => kept.push(planned),
        }
    }
    (kept, conflicts)
}
