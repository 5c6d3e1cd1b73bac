//! In-memory queues of repository work waiting for the per-repository loop.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::cluster::Metadata;
use crate::entries::SnapshotEntry;
use crate::types::Snapshot;

/// A finalization waiting for its repository loop, together with the cluster
/// metadata captured when the entry completed.
#[derive(Debug, Clone)]
pub struct PendingFinalization {
    /// The completed entry to finalize.
    pub entry: SnapshotEntry,
    /// Cluster metadata to build the snapshot description from.
    pub metadata: Metadata,
}

/// Per-repository queues of pending finalizations plus the set of deletions
/// currently executing against their repository. Purely in-memory execution
/// markers; the cluster state remains the source of truth for the entries
/// themselves.
#[derive(Debug, Default)]
pub struct OngoingOps {
    to_finalize: BTreeMap<String, VecDeque<PendingFinalization>>,
    running_deletions: BTreeSet<String>,
}

impl OngoingOps {
    /// Enqueues a completed entry for finalization behind the loop of its
    /// repository.
    pub fn add_finalization(&mut self, entry: SnapshotEntry, metadata: Metadata) {
        self.to_finalize
            .entry(entry.repository().to_string())
            .or_default()
            .push_back(PendingFinalization { entry, metadata });
    }

    /// Pops the oldest pending finalization for the repository.
    pub fn poll_finalization(&mut self, repository: &str) -> Option<PendingFinalization> {
        let queue = self.to_finalize.get_mut(repository)?;
        let next = queue.pop_front();
        if queue.is_empty() {
            self.to_finalize.remove(repository);
        }
        next
    }

    /// Marks a deletion as executing. Returns false when it already is, so
    /// the caller does not run it twice.
    pub fn start_deletion(&mut self, uuid: &str) -> bool {
        self.running_deletions.insert(uuid.to_string())
    }

    /// Clears the executing marker of a deletion.
    pub fn finish_deletion(&mut self, uuid: &str) {
        self.running_deletions.remove(uuid);
    }

    /// True if no finalization is queued for the snapshot. Used by debug
    /// assertions after listeners were failed.
    pub fn not_queued(&self, snapshot: &Snapshot) -> bool {
        self.to_finalize
            .get(&snapshot.repository)
            .map(|queue| queue.iter().all(|p| &p.entry.snapshot != snapshot))
            .unwrap_or(true)
    }

    /// Drops all queued work. Used when this node stops being the
    /// cluster-manager.
    pub fn clear(&mut self) {
        self.to_finalize.clear();
        self.running_deletions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PeerVersion, RepoGeneration, SnapshotId};

    fn entry(name: &str) -> SnapshotEntry {
        SnapshotEntry::started(
            Snapshot::new("repo", SnapshotId::new(name)),
            false,
            false,
            vec![],
            vec![],
            0,
            RepoGeneration::new(0),
            Default::default(),
            None,
            PeerVersion::CURRENT,
        )
    }

    #[test]
    fn test_finalizations_fifo_per_repo() {
        let mut ops = OngoingOps::default();
        ops.add_finalization(entry("a"), Metadata::default());
        ops.add_finalization(entry("b"), Metadata::default());
        assert_eq!(ops.poll_finalization("repo").unwrap().entry.snapshot.id.name, "a");
        assert_eq!(ops.poll_finalization("repo").unwrap().entry.snapshot.id.name, "b");
        assert!(ops.poll_finalization("repo").is_none());
    }

    #[test]
    fn test_deletion_markers() {
        let mut ops = OngoingOps::default();
        assert!(ops.start_deletion("u1"));
        assert!(!ops.start_deletion("u1"));
        ops.finish_deletion("u1");
        assert!(ops.start_deletion("u1"));
    }

    #[test]
    fn test_not_queued() {
        let mut ops = OngoingOps::default();
        let queued = entry("a");
        let snapshot = queued.snapshot.clone();
        assert!(ops.not_queued(&snapshot));
        ops.add_finalization(queued, Metadata::default());
        assert!(!ops.not_queued(&snapshot));
        ops.poll_finalization("repo");
        assert!(ops.not_queued(&snapshot));
    }

    #[test]
    fn test_clear() {
        let mut ops = OngoingOps::default();
        ops.add_finalization(entry("a"), Metadata::default());
        ops.start_deletion("u1");
        ops.clear();
        assert!(ops.poll_finalization("repo").is_none());
        assert!(ops.start_deletion("u1"));
    }
}
