//! Optimistic concurrency control for per-record mutation.
//!
//! Every instance carries a `{version, dirty}` cell. Workers read a version,
//! compute their result, and commit with compare-and-swap; a stale commit is
//! rejected with `Conflict` instead of silently overwriting a concurrent
//! update. The cell map is read-mostly and shared via `Arc`, so worker
//! threads race on the atomics alone, never on a coarse lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{Result, StoreError};

#[derive(Debug, Default)]
struct VersionCell {
    version: AtomicU64,
    dirty: AtomicBool,
}

#[derive(Debug, Default)]
pub struct MutationTracker {
    cells: RwLock<HashMap<String, Arc<VersionCell>>>,
}

impl MutationTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record at a known version, replacing any prior cell. Used
    /// at load and at ingestion.
    pub fn register(&self, uid: &str, version: u64) {
        let cell = Arc::new(VersionCell {
            version: AtomicU64::new(version),
            dirty: AtomicBool::new(false),
        });
        self.cells.write().insert(uid.to_string(), cell);
    }

    fn cell(&self, uid: &str) -> Result<Arc<VersionCell>> {
        self.cells
            .read()
            .get(uid)
            .cloned()
            .ok_or_else(|| StoreError::UnknownInstance { uid: uid.into() })
    }

    /// Version a worker should base its mutation on.
    pub fn begin(&self, uid: &str) -> Result<u64> {
        Ok(self.cell(uid)?.version.load(Ordering::SeqCst))
    }

    /// Claim the next version. Exactly one of any set of concurrent callers
    /// with the same `expected` wins; the rest receive `Conflict` and must
    /// re-read and retry.
    pub fn try_commit(&self, uid: &str, expected: u64) -> Result<u64> {
        let cell = self.cell(uid)?;
        cell.version
            .compare_exchange(expected, expected + 1, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|actual| StoreError::Conflict {
                instance_uid: uid.to_string(),
                expected,
                actual,
            })?;
        cell.dirty.store(true, Ordering::SeqCst);
        Ok(expected + 1)
    }

    /// Flag a record as having state not yet flushed to durable metadata.
    pub fn mark_dirty(&self, uid: &str) -> Result<()> {
        self.cell(uid)?.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Clear the dirty flag after a durable flush, but only if no commit has
    /// advanced the version since the flushed snapshot was taken.
    pub fn mark_flushed(&self, uid: &str, flushed_version: u64) {
        if let Some(cell) = self.cells.read().get(uid) {
            if cell.version.load(Ordering::SeqCst) == flushed_version {
                cell.dirty.store(false, Ordering::SeqCst);
            }
        }
    }

    #[must_use]
    pub fn is_dirty(&self, uid: &str) -> bool {
        self.cells
            .read()
            .get(uid)
            .is_some_and(|cell| cell.dirty.load(Ordering::SeqCst))
    }

    /// Dirty records with the version captured at the time of the call.
    #[must_use]
    pub fn dirty_records(&self) -> Vec<(String, u64)> {
        self.cells
            .read()
            .iter()
            .filter(|(_, cell)| cell.dirty.load(Ordering::SeqCst))
            .map(|(uid, cell)| (uid.clone(), cell.version.load(Ordering::SeqCst)))
            .collect()
    }

    #[must_use]
    pub fn has_dirty(&self) -> bool {
        self.cells
            .read()
            .values()
            .any(|cell| cell.dirty.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn exactly_one_concurrent_commit_wins() {
        let tracker = Arc::new(MutationTracker::new());
        tracker.register("1.2.3", 5);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = Arc::clone(&tracker);
            handles.push(thread::spawn(move || tracker.try_commit("1.2.3", 5).is_ok()));
        }
        let wins = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .filter(|&won| won)
            .count();

        assert_eq!(wins, 1);
        assert_eq!(tracker.begin("1.2.3").expect("begin"), 6);
        assert!(tracker.is_dirty("1.2.3"));
    }

    #[test]
    fn loser_retries_after_reread() {
        let tracker = MutationTracker::new();
        tracker.register("1.2.3", 5);

        tracker.try_commit("1.2.3", 5).expect("first commit");
        let err = tracker.try_commit("1.2.3", 5).expect_err("stale commit");
        match err {
            StoreError::Conflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, 5);
                assert_eq!(actual, 6);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let current = tracker.begin("1.2.3").expect("reread");
        assert_eq!(tracker.try_commit("1.2.3", current).expect("retry"), 7);
    }

    #[test]
    fn flush_does_not_clear_newer_commits() {
        let tracker = MutationTracker::new();
        tracker.register("1.2.3", 0);

        tracker.try_commit("1.2.3", 0).expect("commit");
        tracker.try_commit("1.2.3", 1).expect("commit again");

        // A flush of the older version must not hide the newer commit.
        tracker.mark_flushed("1.2.3", 1);
        assert!(tracker.is_dirty("1.2.3"));

        tracker.mark_flushed("1.2.3", 2);
        assert!(!tracker.is_dirty("1.2.3"));
    }
}
