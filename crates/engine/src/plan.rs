//! Reconciliation of a scan against the stored records.

use crate::scan::{Item, ItemKind};
use crate::store::{Mutation, Record, Records};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// How an item relates to its stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Unchanged,
    Changed,
    New,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanEntry {
    pub key: String,
    pub change: Change,
    /// The item as scanned; None when removed.
    pub item: Option<Item>,
    /// The stored record before this scan; None when new.
    pub record: Option<Record>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    /// Audio items with no test outcome count as changed.
    pub testing_requested: bool,
}

/// Every key from the previous records and the current scan, classified once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconciliationPlan {
    entries: BTreeMap<String, PlanEntry>,
}

impl ReconciliationPlan {
    pub fn entries(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries.values()
    }

    pub fn get(&self, key: &str) -> Option<&PlanEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, change: Change) -> usize {
        self.entries.values().filter(|e| e.change == change).count()
    }

    /// Store mutations recording what this scan observed.
    ///
    /// Only new items and items whose fingerprint moved produce a mutation.
    pub fn observations(&self) -> Vec<Mutation> {
        self.entries
            .values()
            .filter_map(|entry| {
                let item = entry.item.as_ref()?;
                let unchanged = entry.record.as_ref().is_some_and(|record| {
                    record.kind == item.kind && record.current_fingerprint() == item.fingerprint
                });
                if unchanged {
                    return None;
                }
                Some(Mutation::Observe {
                    key: entry.key.clone(),
                    kind: item.kind,
                    fingerprint: item.fingerprint.clone(),
                })
            })
            .collect()
    }
}

/// Classify the union of stored and scanned keys.
pub fn diff(
    previous: &Records,
    current: impl IntoIterator<Item = Item>,
    options: DiffOptions,
) -> ReconciliationPlan {
    let mut entries = BTreeMap::new();

    for item in current {
        let record = previous.get(&item.key).cloned();
        let change = match &record {
            None => Change::New,
            Some(record) if is_changed(record, &item, options) => Change::Changed,
            Some(_) => Change::Unchanged,
        };
        entries.insert(
            item.key.clone(),
            PlanEntry {
                key: item.key.clone(),
                change,
                item: Some(item),
                record,
            },
        );
    }

    for (key, record) in previous {
        if !entries.contains_key(key) {
            entries.insert(
                key.clone(),
                PlanEntry {
                    key: key.clone(),
                    change: Change::Removed,
                    item: None,
                    record: Some(record.clone()),
                },
            );
        }
    }

    ReconciliationPlan { entries }
}

fn is_changed(record: &Record, item: &Item, options: DiffOptions) -> bool {
    // Fingerprints of different kinds are never comparable
    if record.fingerprint_kind != item.fingerprint.kind || record.fingerprint != item.fingerprint.value {
        return true;
    }
    options.testing_requested && item.kind == ItemKind::Audio && record.test.is_none()
}

/// Items synthesized from the stored records, for runs that skip the scan.
///
/// Every record is taken as present with its stored fingerprint.
pub fn items_from_records(root: &Path, records: &Records) -> Vec<Item> {
    records
        .iter()
        .map(|(key, record)| Item {
            key: key.clone(),
            path: root.join(key),
            kind: record.kind,
            fingerprint: record.current_fingerprint(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{Fingerprint, FingerprintKind};
    use crate::store::TestStamp;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn item(key: &str, value: &str) -> Item {
        Item {
            key: key.to_string(),
            path: PathBuf::from("/lib").join(key),
            kind: ItemKind::of(Path::new(key)),
            fingerprint: Fingerprint::new(FingerprintKind::ContentHash, value),
        }
    }

    fn record(key: &str, value: &str) -> Record {
        Record::new(
            ItemKind::of(Path::new(key)),
            Fingerprint::new(FingerprintKind::ContentHash, value),
        )
    }

    #[test]
    fn test_empty_store_everything_new() {
        let plan = diff(
            &Records::new(),
            vec![item("a.flac", "H1"), item("b.txt", "H2")],
            DiffOptions::default(),
        );
        assert_eq!(plan.count(Change::New), 2);
        assert_eq!(plan.observations().len(), 2);
    }

    #[test]
    fn test_classification() {
        let mut previous = Records::new();
        previous.insert("same.flac".into(), record("same.flac", "H1"));
        previous.insert("edited.flac".into(), record("edited.flac", "old"));
        previous.insert("gone.txt".into(), record("gone.txt", "H3"));

        let plan = diff(
            &previous,
            vec![
                item("same.flac", "H1"),
                item("edited.flac", "new"),
                item("added.txt", "H4"),
            ],
            DiffOptions::default(),
        );

        assert_eq!(plan.get("same.flac").unwrap().change, Change::Unchanged);
        assert_eq!(plan.get("edited.flac").unwrap().change, Change::Changed);
        assert_eq!(plan.get("added.txt").unwrap().change, Change::New);
        let gone = plan.get("gone.txt").unwrap();
        assert_eq!(gone.change, Change::Removed);
        assert!(gone.item.is_none());
        assert!(gone.record.is_some());

        let observed: Vec<String> = plan.observations().iter().map(|m| m.key().to_string()).collect();
        assert_eq!(observed, vec!["added.txt".to_string(), "edited.flac".to_string()]);
    }

    #[test]
    fn test_tool_tags_do_not_affect_classification() {
        let mut stored = record("a.flac", "H1");
        stored.test = Some(TestStamp {
            fingerprint: "H0".into(),
            tool: "ancient".into(),
            passed: false,
        });
        let mut previous = Records::new();
        previous.insert("a.flac".into(), stored);

        let plan = diff(&previous, vec![item("a.flac", "H1")], DiffOptions::default());
        assert_eq!(plan.get("a.flac").unwrap().change, Change::Unchanged);
    }

    #[test]
    fn test_untested_audio_is_changed_when_testing() {
        let mut previous = Records::new();
        previous.insert("a.flac".into(), record("a.flac", "H1"));
        previous.insert("b.txt".into(), record("b.txt", "H2"));
        let current = vec![item("a.flac", "H1"), item("b.txt", "H2")];

        let plan = diff(&previous, current.clone(), DiffOptions::default());
        assert_eq!(plan.count(Change::Unchanged), 2);

        let plan = diff(&previous, current, DiffOptions { testing_requested: true });
        assert_eq!(plan.get("a.flac").unwrap().change, Change::Changed);
        assert_eq!(plan.get("b.txt").unwrap().change, Change::Unchanged);
        // Nothing moved, so nothing to record
        assert!(plan.observations().is_empty());
    }

    #[test]
    fn test_fingerprint_kind_switch_changes_everything() {
        let mut previous = Records::new();
        previous.insert("a.flac".into(), record("a.flac", "same"));

        let mut switched = item("a.flac", "same");
        switched.fingerprint.kind = FingerprintKind::Mtime;
        let plan = diff(&previous, vec![switched], DiffOptions::default());
        assert_eq!(plan.get("a.flac").unwrap().change, Change::Changed);
    }

    #[test]
    fn test_items_from_records_round_trip_unchanged() {
        let mut previous = Records::new();
        previous.insert("x/a.flac".into(), record("x/a.flac", "H1"));
        previous.insert("x/b.jpg".into(), record("x/b.jpg", "H2"));

        let items = items_from_records(Path::new("/lib"), &previous);
        assert_eq!(items[0].path, PathBuf::from("/lib/x/a.flac"));

        let plan = diff(&previous, items, DiffOptions::default());
        assert_eq!(plan.count(Change::Unchanged), 2);
    }

    // Every key from either side lands in exactly one class, and the class
    // matches the definition.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_diff_partitions_union(
            stored in proptest::collection::btree_map("[a-e]{1,2}\\.flac", "[0-3]", 0..10),
            scanned in proptest::collection::btree_map("[a-e]{1,2}\\.flac", "[0-3]", 0..10),
        ) {
            let previous: Records = stored
                .iter()
                .map(|(k, v)| (k.clone(), record(k, v)))
                .collect();
            let current: Vec<Item> = scanned.iter().map(|(k, v)| item(k, v)).collect();

            let plan = diff(&previous, current, DiffOptions::default());

            let union: BTreeSet<&String> = stored.keys().chain(scanned.keys()).collect();
            prop_assert_eq!(plan.len(), union.len());

            for key in union {
                let entry = plan.get(key).unwrap();
                let expected = match (stored.get(key), scanned.get(key)) {
                    (None, Some(_)) => Change::New,
                    (Some(_), None) => Change::Removed,
                    (Some(a), Some(b)) if a == b => Change::Unchanged,
                    (Some(_), Some(_)) => Change::Changed,
                    (None, None) => unreachable!(),
                };
                prop_assert_eq!(entry.change, expected);
            }
        }
    }
}
