//! Bounded history of committed roots
//!
//! Every commit records the root it produced together with the before and
//! after value of each key it changed. The history backs change proofs and
//! lets proofs be generated at recent roots other than the current one.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use log::trace;

use crate::crypto::hash::Id;
use crate::storage::trie::key::Key;

/// Value of a key before and after a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueChange {
    pub before: Option<Bytes>,
    pub after: Option<Bytes>,
}

/// Changes made by one commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSummary {
    /// Root after the commit
    pub root_id: Id,
    /// Changed keys
    pub values: BTreeMap<Key, ValueChange>,
}

/// Why changes between two roots could not be produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryLookupError {
    /// End root is not in the history
    NoEndRoot,
    /// Start root is not in the history before the end root
    InsufficientHistory,
}

/// Most recent commits, oldest first
#[derive(Debug, Clone)]
pub struct TrieHistory {
    /// Maximum number of summaries kept
    max_length: usize,
    history: VecDeque<ChangeSummary>,
}

impl TrieHistory {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(1),
            history: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Append a commit, dropping the oldest one if the history is full
    pub fn record(&mut self, summary: ChangeSummary) {
        trace!("Recording root {} with {} changes", summary.root_id, summary.values.len());
        self.history.push_back(summary);
        while self.history.len() > self.max_length {
            if let Some(dropped) = self.history.pop_front() {
                trace!("Dropped root {} from history", dropped.root_id);
            }
        }
    }

    /// True iff `root` is one of the recorded roots
    pub fn contains(&self, root: &Id) -> bool {
        self.last_index_of(root).is_some()
    }

    fn last_index_of(&self, root: &Id) -> Option<usize> {
        self.history.iter().rposition(|summary| summary.root_id == *root)
    }

    /// Net changes to keys in `[start, end]` going from `start_root` to
    /// `end_root`, limited to the `max_length` smallest keys. Keys changed
    /// and then changed back are left out.
    pub fn get_value_changes(
        &self,
        start_root: &Id,
        end_root: &Id,
        start: Option<&Key>,
        end: Option<&Key>,
        max_length: usize,
    ) -> Result<BTreeMap<Key, ValueChange>, HistoryLookupError> {
        let end_index = self.last_index_of(end_root).ok_or(HistoryLookupError::NoEndRoot)?;
        if start_root == end_root {
            return Ok(BTreeMap::new());
        }
        let start_index = self
            .history
            .iter()
            .take(end_index)
            .rposition(|summary| summary.root_id == *start_root)
            .ok_or(HistoryLookupError::InsufficientHistory)?;

        let mut combined: BTreeMap<Key, ValueChange> = BTreeMap::new();
        for summary in self.history.range(start_index + 1..=end_index) {
            for (key, change) in &summary.values {
                if start.map_or(false, |s| key < s) || end.map_or(false, |e| key > e) {
                    continue;
                }
                combined
                    .entry(key.clone())
                    .and_modify(|existing| existing.after = change.after.clone())
                    .or_insert_with(|| change.clone());
            }
        }

        Ok(combined
            .into_iter()
            .filter(|(_, change)| change.before != change.after)
            .take(max_length)
            .collect())
    }

    /// Changes to undo, newest first, to go from the latest root back to
    /// `root`. `None` if `root` is not in the history.
    pub fn changes_since(&self, root: &Id) -> Option<impl Iterator<Item = &ChangeSummary>> {
        let index = self.last_index_of(root)?;
        Some(self.history.range(index + 1..).rev())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(n: u8) -> Id {
        Id::new([n; 32])
    }

    fn key(s: &str) -> Key {
        Key::from_bytes(s.as_bytes())
    }

    fn val(s: &str) -> Option<Bytes> {
        Some(Bytes::copy_from_slice(s.as_bytes()))
    }

    fn summary(n: u8, changes: &[(&str, Option<Bytes>, Option<Bytes>)]) -> ChangeSummary {
        ChangeSummary {
            root_id: root(n),
            values: changes
                .iter()
                .map(|(k, before, after)| {
                    (key(k), ValueChange { before: before.clone(), after: after.clone() })
                })
                .collect(),
        }
    }

    fn sample_history() -> TrieHistory {
        let mut history = TrieHistory::new(10);
        history.record(summary(0, &[]));
        history.record(summary(1, &[("a", None, val("1")), ("b", None, val("1"))]));
        history.record(summary(2, &[("a", val("1"), val("2")), ("c", None, val("1"))]));
        history.record(summary(3, &[("b", val("1"), None), ("c", val("1"), None)]));
        history
    }

    #[test]
    fn test_value_changes() {
        let history = sample_history();
        let changes = history.get_value_changes(&root(0), &root(3), None, None, 100).unwrap();
        // c was added and removed again
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[&key("a")], ValueChange { before: None, after: val("2") });

        let changes = history.get_value_changes(&root(1), &root(2), None, None, 100).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[&key("a")], ValueChange { before: val("1"), after: val("2") });
    }

    #[test]
    fn test_value_changes_range_and_limit() {
        let history = sample_history();
        let changes = history
            .get_value_changes(&root(0), &root(2), Some(&key("b")), None, 100)
            .unwrap();
        let keys: Vec<_> = changes.keys().cloned().collect();
        assert_eq!(keys, vec![key("b"), key("c")]);

        let changes = history.get_value_changes(&root(0), &root(2), None, None, 1).unwrap();
        assert_eq!(changes.keys().cloned().collect::<Vec<_>>(), vec![key("a")]);
    }

    #[test]
    fn test_missing_roots() {
        let history = sample_history();
        assert_eq!(
            history.get_value_changes(&root(0), &root(9), None, None, 10),
            Err(HistoryLookupError::NoEndRoot)
        );
        assert_eq!(
            history.get_value_changes(&root(9), &root(2), None, None, 10),
            Err(HistoryLookupError::InsufficientHistory)
        );
        // Start root only appears after the end root
        assert_eq!(
            history.get_value_changes(&root(3), &root(2), None, None, 10),
            Err(HistoryLookupError::InsufficientHistory)
        );
    }

    #[test]
    fn test_bounded() {
        let mut history = TrieHistory::new(2);
        for n in 0..5 {
            history.record(summary(n, &[]));
        }
        assert_eq!(history.len(), 2);
        assert!(!history.contains(&root(2)));
        assert!(history.contains(&root(3)));
        assert!(history.contains(&root(4)));
    }

    #[test]
    fn test_changes_since() {
        let history = sample_history();
        let roots: Vec<Id> = history.changes_since(&root(1)).unwrap().map(|s| s.root_id).collect();
        assert_eq!(roots, vec![root(3), root(2)]);
        assert_eq!(history.changes_since(&root(3)).unwrap().count(), 0);
        assert!(history.changes_since(&root(7)).is_none());
    }

    #[test]
    fn test_repeated_root() {
        // Root 1 appears twice; the later one before the end root is used
        let mut history = sample_history();
        history.record(summary(1, &[("a", val("2"), val("1")), ("b", None, val("1"))]));
        history.record(summary(4, &[("d", None, val("1"))]));
        let changes = history.get_value_changes(&root(1), &root(4), None, None, 10).unwrap();
        assert_eq!(changes.keys().cloned().collect::<Vec<_>>(), vec![key("d")]);
    }
}
