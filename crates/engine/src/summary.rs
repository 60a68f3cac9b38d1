//! Run summary: per-action counts and named failures.

use crate::resolve::{Action, Lane, PlannedAction};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Counters for one action kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActionCounts {
    pub planned: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Planned but never completed because the run was interrupted.
    pub interrupted: usize,
    pub skipped: usize,
}

/// An item whose action did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub key: String,
    pub action: Action,
    pub reason: String,
}

/// How one planned action ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed(String),
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub lane: Lane,
    pub dry_run: bool,
    pub interrupted: bool,
    pub counts: BTreeMap<Action, ActionCounts>,
    pub failures: Vec<Failure>,
}

impl RunSummary {
    pub fn new(lane: Lane, dry_run: bool) -> Self {
        Self {
            lane,
            dry_run,
            interrupted: false,
            counts: BTreeMap::new(),
            failures: Vec::new(),
        }
    }

    fn counts_mut(&mut self, action: Action) -> &mut ActionCounts {
        self.counts.entry(action).or_default()
    }

    pub fn counts(&self, action: Action) -> ActionCounts {
        self.counts.get(&action).copied().unwrap_or_default()
    }

    /// Count a resolved action before execution. A skip is counted under
    /// the native action of its item, or under `skip` when it has none.
    pub fn plan(&mut self, planned: &PlannedAction) {
        let counts = self.counts_mut(planned.counted_as());
        if planned.action.is_work() {
            counts.planned += 1;
        } else {
            counts.skipped += 1;
        }
    }

    pub fn record(&mut self, key: &str, action: Action, outcome: Outcome) {
        match outcome {
            Outcome::Succeeded => self.counts_mut(action).succeeded += 1,
            Outcome::Interrupted => self.counts_mut(action).interrupted += 1,
            Outcome::Failed(reason) => {
                self.counts_mut(action).failed += 1;
                self.failures.push(Failure {
                    key: key.to_string(),
                    action,
                    reason,
                });
            }
        }
    }

    /// Sum of `field` across every action kind.
    pub fn total(&self, field: impl Fn(&ActionCounts) -> usize) -> usize {
        self.counts.values().map(field).sum()
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Log the summary, naming every failed item.
    pub fn log(&self) {
        for (action, c) in &self.counts {
            if self.dry_run {
                info!(
                    lane = self.lane.as_str(),
                    action = action.as_str(),
                    planned = c.planned,
                    skipped = c.skipped,
                    "Dry run"
                );
            } else {
                info!(
                    lane = self.lane.as_str(),
                    action = action.as_str(),
                    succeeded = c.succeeded,
                    failed = c.failed,
                    interrupted = c.interrupted,
                    skipped = c.skipped,
                    "Run summary"
                );
            }
        }
        for failure in &self.failures {
            warn!(key = %failure.key, action = failure.action.as_str(), reason = %failure.reason, "Failed");
        }
        if self.interrupted {
            warn!("Run was interrupted; remaining items will be processed next run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planned(key: &str, action: Action, native: Option<Action>) -> PlannedAction {
        PlannedAction {
            key: key.to_string(),
            action,
            native,
            item: None,
            record: None,
        }
    }

    #[test]
    fn test_counts_by_action() {
        let mut summary = RunSummary::new(Lane::Mirror, false);
        summary.plan(&planned("a.flac", Action::Transcode, Some(Action::Transcode)));
        summary.plan(&planned("b.flac", Action::Transcode, Some(Action::Transcode)));
        summary.plan(&planned("d.flac", Action::Skip, Some(Action::Transcode)));
        summary.plan(&planned("e.jpg", Action::Skip, Some(Action::MirrorCopy)));
        summary.plan(&planned("c.txt", Action::MirrorCopy, Some(Action::MirrorCopy)));

        summary.record("a.flac", Action::Transcode, Outcome::Succeeded);
        summary.record("b.flac", Action::Transcode, Outcome::Failed("exit 1".into()));
        summary.record("c.txt", Action::MirrorCopy, Outcome::Interrupted);

        let transcode = summary.counts(Action::Transcode);
        assert_eq!(
            (transcode.planned, transcode.succeeded, transcode.failed, transcode.skipped),
            (2, 1, 1, 1)
        );
        let copy = summary.counts(Action::MirrorCopy);
        assert_eq!((copy.planned, copy.interrupted, copy.skipped), (1, 1, 1));
        assert_eq!(summary.counts(Action::Skip), ActionCounts::default());
        assert_eq!(summary.counts(Action::Test), ActionCounts::default());
        assert_eq!(summary.total(|c| c.planned), 3);
        assert!(summary.has_failures());
        assert_eq!(summary.failures[0].key, "b.flac");
    }

    #[test]
    fn test_skip_without_native_action() {
        let mut summary = RunSummary::new(Lane::Scan { testing: false }, false);
        summary.plan(&planned("a.flac", Action::Skip, None));
        assert_eq!(summary.counts(Action::Skip).skipped, 1);
    }

    #[test]
    fn test_json_shape() {
        let mut summary = RunSummary::new(Lane::Scan { testing: true }, true);
        summary.plan(&planned("a.flac", Action::Test, Some(Action::Test)));
        let json = serde_json::to_value(&summary).unwrap();

        assert_eq!(json["dry_run"], true);
        assert_eq!(json["lane"]["scan"]["testing"], true);
        assert_eq!(json["counts"]["test"]["planned"], 1);
        assert!(json["failures"].as_array().unwrap().is_empty());
    }
}
