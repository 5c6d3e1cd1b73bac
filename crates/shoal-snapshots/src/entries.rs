//! In-progress operation records stored in the cluster state.
//!
//! `SnapshotsInProgress` and `SnapshotDeletionsInProgress` are custom sections
//! of the replicated cluster-state document and are the single source of truth
//! for in-flight snapshot work. The engine never mutates entries in place; it
//! derives updated copies and proposes them through the state bus.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{
    DeletionState, IndexId, PeerVersion, RepoGeneration, RepositoryShardId, ShardId,
    ShardSnapshotStatus, ShardState, Snapshot, SnapshotId, SnapshotState,
};

/// Failure text recorded on entries aborted by a deletion.
pub const ABORTED_FAILURE_TEXT: &str = "Snapshot was aborted by deletion";

/// One in-flight snapshot create or clone operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Identity of the snapshot being created.
    pub snapshot: Snapshot,
    /// Whether cluster-wide metadata is included.
    pub include_global_state: bool,
    /// Whether the snapshot may complete with failed shards.
    pub partial: bool,
    /// Current lifecycle state.
    pub state: SnapshotState,
    /// Indices covered by the snapshot, in repository identity form.
    pub indices: Vec<IndexId>,
    /// Data streams covered by the snapshot.
    pub data_streams: Vec<String>,
    /// Start of the operation, milliseconds since the epoch.
    pub start_time_ms: u64,
    /// Repository generation observed at admission.
    pub repo_generation: RepoGeneration,
    /// Opaque metadata supplied by the caller, stored into the snapshot.
    pub user_metadata: Option<serde_json::Value>,
    /// Repository metadata version the snapshot will be written with.
    pub repository_meta_version: PeerVersion,
    /// Per-shard status for a regular snapshot. Empty for clones.
    pub shards: BTreeMap<ShardId, ShardSnapshotStatus>,
    /// Source snapshot for a clone. `None` for regular snapshots.
    pub source: Option<SnapshotId>,
    /// Per-shard status for a clone. Empty for regular snapshots.
    pub clones: BTreeMap<RepositoryShardId, ShardSnapshotStatus>,
    /// Entry-level failure description, if the entry failed or was aborted.
    pub failure: Option<String>,
}

/// True if every status in the iterator is in a completed shard state.
pub fn all_completed<'a, I: IntoIterator<Item = &'a ShardSnapshotStatus>>(statuses: I) -> bool {
    statuses.into_iter().all(|s| s.state.completed())
}

impl SnapshotEntry {
    /// Creates a STARTED entry for a regular snapshot with assigned shards.
    #[allow(clippy::too_many_arguments)]
    pub fn started(
        snapshot: Snapshot,
        include_global_state: bool,
        partial: bool,
        indices: Vec<IndexId>,
        data_streams: Vec<String>,
        start_time_ms: u64,
        repo_generation: RepoGeneration,
        shards: BTreeMap<ShardId, ShardSnapshotStatus>,
        user_metadata: Option<serde_json::Value>,
        repository_meta_version: PeerVersion,
    ) -> Self {
        let state = if all_completed(shards.values()) {
            SnapshotState::Success
        } else {
            SnapshotState::Started
        };
        SnapshotEntry {
            snapshot,
            include_global_state,
            partial,
            state,
            indices,
            data_streams,
            start_time_ms,
            repo_generation,
            user_metadata,
            repository_meta_version,
            shards,
            source: None,
            clones: BTreeMap::new(),
            failure: None,
        }
    }

    /// Creates an INIT entry without shard assignments (legacy path).
    pub fn init(
        snapshot: Snapshot,
        include_global_state: bool,
        partial: bool,
        indices: Vec<IndexId>,
        data_streams: Vec<String>,
        start_time_ms: u64,
        repo_generation: RepoGeneration,
        user_metadata: Option<serde_json::Value>,
        repository_meta_version: PeerVersion,
    ) -> Self {
        SnapshotEntry {
            snapshot,
            include_global_state,
            partial,
            state: SnapshotState::Init,
            indices,
            data_streams,
            start_time_ms,
            repo_generation,
            user_metadata,
            repository_meta_version,
            shards: BTreeMap::new(),
            source: None,
            clones: BTreeMap::new(),
            failure: None,
        }
    }

    /// Creates a STARTED clone entry with an empty clone map. The map is
    /// filled by an asynchronous preparation step once shard counts are known.
    pub fn start_clone(
        snapshot: Snapshot,
        source: SnapshotId,
        indices: Vec<IndexId>,
        start_time_ms: u64,
        repo_generation: RepoGeneration,
        repository_meta_version: PeerVersion,
    ) -> Self {
        SnapshotEntry {
            snapshot,
            include_global_state: false,
            partial: false,
            state: SnapshotState::Started,
            indices,
            data_streams: Vec::new(),
            start_time_ms,
            repo_generation,
            user_metadata: None,
            repository_meta_version,
            shards: BTreeMap::new(),
            source: Some(source),
            clones: BTreeMap::new(),
            failure: None,
        }
    }

    /// Repository this entry operates on.
    pub fn repository(&self) -> &str {
        &self.snapshot.repository
    }

    /// True if the entry is a clone operation.
    pub fn is_clone(&self) -> bool {
        self.source.is_some()
    }

    /// Returns a copy with the given shard map, moving to SUCCESS when every
    /// shard has completed.
    pub fn with_shards(&self, shards: BTreeMap<ShardId, ShardSnapshotStatus>) -> Self {
        let mut updated = self.clone();
        if all_completed(shards.values()) {
            updated.state = SnapshotState::Success;
        }
        updated.shards = shards;
        updated
    }

    /// Returns a copy with the given clone map, moving to SUCCESS when every
    /// clone shard has completed.
    pub fn with_clones(&self, clones: BTreeMap<RepositoryShardId, ShardSnapshotStatus>) -> Self {
        let mut updated = self.clone();
        if !clones.is_empty() && all_completed(clones.values()) {
            updated.state = SnapshotState::Success;
        }
        updated.clones = clones;
        updated
    }

    /// Returns a copy in the given state with the given shards and failure.
    pub fn fail(
        &self,
        shards: BTreeMap<ShardId, ShardSnapshotStatus>,
        state: SnapshotState,
        failure: impl Into<String>,
    ) -> Self {
        let mut updated = self.clone();
        updated.state = state;
        updated.shards = shards;
        updated.failure = Some(failure.into());
        updated
    }

    /// Aborts the entry: every non-completed shard that is assigned to a node
    /// becomes `Aborted`, unassigned ones become `Failed`. Returns `None` when
    /// every shard was still queued, meaning no work was ever started and the
    /// entry can simply be dropped from the cluster state.
    pub fn abort(&self) -> Option<SnapshotEntry> {
        let mut shards = BTreeMap::new();
        let mut completed = true;
        let mut all_queued = true;
        for (shard_id, status) in &self.shards {
            all_queued &= status.state == ShardState::Queued;
            let status = if status.state.completed() {
                status.clone()
            } else {
                ShardSnapshotStatus {
                    node: status.node,
                    state: if status.node.is_some() {
                        ShardState::Aborted
                    } else {
                        ShardState::Failed
                    },
                    generation: status.generation.clone(),
                    reason: Some("aborted by snapshot deletion".to_string()),
                }
            };
            completed &= status.state.completed();
            shards.insert(shard_id.clone(), status);
        }
        if all_queued {
            return None;
        }
        Some(self.fail(
            shards,
            if completed {
                SnapshotState::Success
            } else {
                SnapshotState::Aborted
            },
            ABORTED_FAILURE_TEXT,
        ))
    }

    /// True once all shard work for the entry has reached a completed state.
    pub fn shards_completed(&self) -> bool {
        if self.is_clone() {
            !self.clones.is_empty() && all_completed(self.clones.values())
        } else {
            all_completed(self.shards.values())
        }
    }
}

/// All in-flight snapshot entries, in admission order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotsInProgress {
    /// Entries, oldest first.
    pub entries: Vec<SnapshotEntry>,
}

impl SnapshotsInProgress {
    /// An empty section.
    pub fn empty() -> Self {
        SnapshotsInProgress::default()
    }

    /// Wraps an entry list.
    pub fn of(entries: Vec<SnapshotEntry>) -> Self {
        SnapshotsInProgress { entries }
    }

    /// Finds the entry for a snapshot, if present.
    pub fn entry(&self, snapshot: &Snapshot) -> Option<&SnapshotEntry> {
        self.entries.iter().find(|e| &e.snapshot == snapshot)
    }

    /// Iterates the entries belonging to one repository.
    pub fn for_repo<'a>(&'a self, repository: &'a str) -> impl Iterator<Item = &'a SnapshotEntry> {
        self.entries
            .iter()
            .filter(move |e| e.repository() == repository)
    }

    /// True if no entry is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// One in-flight snapshot deletion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeletionEntry {
    /// Unique identifier of this deletion, used to key listeners.
    pub uuid: String,
    /// Repository the deletion operates on.
    pub repository: String,
    /// Snapshots to delete.
    pub snapshots: Vec<SnapshotId>,
    /// Start of the operation, milliseconds since the epoch.
    pub start_time_ms: u64,
    /// Repository generation observed at admission.
    pub repo_generation: RepoGeneration,
    /// Whether the deletion is blocked or executing.
    pub state: DeletionState,
}

impl DeletionEntry {
    /// Creates a deletion entry with a fresh uuid.
    pub fn new(
        snapshots: Vec<SnapshotId>,
        repository: impl Into<String>,
        start_time_ms: u64,
        repo_generation: RepoGeneration,
        state: DeletionState,
    ) -> Self {
        DeletionEntry {
            uuid: uuid::Uuid::new_v4().to_string(),
            repository: repository.into(),
            snapshots,
            start_time_ms,
            repo_generation,
            state,
        }
    }

    /// Returns a copy in STARTED state.
    pub fn started(&self) -> Self {
        let mut updated = self.clone();
        updated.state = DeletionState::Started;
        updated
    }

    /// Returns a copy with the given snapshots merged in (duplicates are
    /// dropped). Keeps uuid and state.
    pub fn with_added_snapshots(&self, snapshots: impl IntoIterator<Item = SnapshotId>) -> Self {
        let mut updated = self.clone();
        for id in snapshots {
            if !updated.snapshots.contains(&id) {
                updated.snapshots.push(id);
            }
        }
        updated
    }

    /// Returns a copy with exactly the given snapshot list.
    pub fn with_snapshots(&self, snapshots: Vec<SnapshotId>) -> Self {
        let mut updated = self.clone();
        updated.snapshots = snapshots;
        updated
    }
}

/// All in-flight deletions, in admission order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDeletionsInProgress {
    /// Entries, oldest first.
    pub entries: Vec<DeletionEntry>,
}

impl SnapshotDeletionsInProgress {
    /// An empty section.
    pub fn empty() -> Self {
        SnapshotDeletionsInProgress::default()
    }

    /// Wraps an entry list.
    pub fn of(entries: Vec<DeletionEntry>) -> Self {
        SnapshotDeletionsInProgress { entries }
    }

    /// True if any deletion is tracked.
    pub fn has_deletions(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Returns a copy without the entry carrying `uuid`, or an unchanged copy
    /// when no such entry exists.
    pub fn without_entry(&self, uuid: &str) -> Self {
        SnapshotDeletionsInProgress {
            entries: self
                .entries
                .iter()
                .filter(|e| e.uuid != uuid)
                .cloned()
                .collect(),
        }
    }

    /// Returns a copy with the entry appended.
    pub fn with_entry(&self, entry: DeletionEntry) -> Self {
        let mut entries = self.entries.clone();
        entries.push(entry);
        SnapshotDeletionsInProgress { entries }
    }

    /// True if a STARTED deletion exists for the repository.
    pub fn has_started_for_repo(&self, repository: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.repository == repository && e.state == DeletionState::Started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;

    fn entry_with_shards(shards: Vec<(ShardId, ShardSnapshotStatus)>) -> SnapshotEntry {
        SnapshotEntry::started(
            Snapshot::new("repo", SnapshotId::with_uuid("s1", "u1")),
            true,
            false,
            vec![IndexId::with_id("idx", "iid")],
            vec![],
            0,
            RepoGeneration::new(1),
            shards.into_iter().collect(),
            None,
            PeerVersion::CURRENT,
        )
    }

    #[test]
    fn test_started_entry_with_pending_shards() {
        let entry = entry_with_shards(vec![(
            ShardId::new("idx", 0),
            ShardSnapshotStatus::init(Some(NodeId::new(1)), None),
        )]);
        assert_eq!(entry.state, SnapshotState::Started);
        assert!(!entry.shards_completed());
    }

    #[test]
    fn test_started_entry_empty_shards_is_success() {
        let entry = entry_with_shards(vec![]);
        assert_eq!(entry.state, SnapshotState::Success);
        assert!(entry.shards_completed());
    }

    #[test]
    fn test_with_shards_completes_entry() {
        let shard = ShardId::new("idx", 0);
        let entry = entry_with_shards(vec![(
            shard.clone(),
            ShardSnapshotStatus::init(Some(NodeId::new(1)), None),
        )]);
        let mut shards = entry.shards.clone();
        shards.insert(
            shard,
            ShardSnapshotStatus::success(Some(NodeId::new(1)), crate::types::ShardGeneration::new("g1")),
        );
        let updated = entry.with_shards(shards);
        assert_eq!(updated.state, SnapshotState::Success);
    }

    #[test]
    fn test_abort_assigned_shard_becomes_aborted() {
        let entry = entry_with_shards(vec![(
            ShardId::new("idx", 0),
            ShardSnapshotStatus::init(Some(NodeId::new(1)), None),
        )]);
        let aborted = entry.abort().expect("abort should keep the entry");
        assert_eq!(aborted.state, SnapshotState::Aborted);
        let status = &aborted.shards[&ShardId::new("idx", 0)];
        assert_eq!(status.state, ShardState::Aborted);
        assert_eq!(aborted.failure.as_deref(), Some(ABORTED_FAILURE_TEXT));
    }

    #[test]
    fn test_abort_all_queued_drops_entry() {
        let entry = entry_with_shards(vec![
            (ShardId::new("idx", 0), ShardSnapshotStatus::unassigned_queued()),
            (ShardId::new("idx", 1), ShardSnapshotStatus::unassigned_queued()),
        ]);
        assert!(entry.abort().is_none());
    }

    #[test]
    fn test_abort_completed_shards_keep_state() {
        let gen = crate::types::ShardGeneration::new("g");
        let entry = entry_with_shards(vec![
            (
                ShardId::new("idx", 0),
                ShardSnapshotStatus::success(Some(NodeId::new(1)), gen),
            ),
            (
                ShardId::new("idx", 1),
                ShardSnapshotStatus::init(Some(NodeId::new(2)), None),
            ),
        ]);
        let aborted = entry.abort().expect("entry survives");
        assert_eq!(aborted.shards[&ShardId::new("idx", 0)].state, ShardState::Success);
        assert_eq!(aborted.shards[&ShardId::new("idx", 1)].state, ShardState::Aborted);
    }

    #[test]
    fn test_abort_unassigned_waiting_shard_fails() {
        let entry = entry_with_shards(vec![
            (ShardId::new("idx", 0), ShardSnapshotStatus::waiting(None, None)),
            (
                ShardId::new("idx", 1),
                ShardSnapshotStatus::init(Some(NodeId::new(2)), None),
            ),
        ]);
        let aborted = entry.abort().expect("entry survives");
        assert_eq!(aborted.shards[&ShardId::new("idx", 0)].state, ShardState::Failed);
    }

    #[test]
    fn test_clone_entry_empty_clones_not_completed() {
        let entry = SnapshotEntry::start_clone(
            Snapshot::new("repo", SnapshotId::with_uuid("t", "tu")),
            SnapshotId::with_uuid("src", "su"),
            vec![IndexId::with_id("idx", "iid")],
            0,
            RepoGeneration::new(3),
            PeerVersion::CURRENT,
        );
        assert!(entry.is_clone());
        assert!(!entry.shards_completed());
        assert_eq!(entry.state, SnapshotState::Started);
    }

    #[test]
    fn test_deletion_entry_merge() {
        let a = SnapshotId::with_uuid("a", "ua");
        let b = SnapshotId::with_uuid("b", "ub");
        let entry = DeletionEntry::new(
            vec![a.clone()],
            "repo",
            0,
            RepoGeneration::new(1),
            DeletionState::Waiting,
        );
        let merged = entry.with_added_snapshots(vec![a.clone(), b.clone()]);
        assert_eq!(merged.snapshots, vec![a, b]);
        assert_eq!(merged.uuid, entry.uuid);
    }

    #[test]
    fn test_deletions_without_entry() {
        let entry = DeletionEntry::new(vec![], "repo", 0, RepoGeneration::new(1), DeletionState::Started);
        let uuid = entry.uuid.clone();
        let deletions = SnapshotDeletionsInProgress::of(vec![entry]);
        assert!(deletions.has_started_for_repo("repo"));
        let removed = deletions.without_entry(&uuid);
        assert!(!removed.has_deletions());
    }

    #[test]
    fn test_snapshots_for_repo_filter() {
        let e1 = entry_with_shards(vec![]);
        let mut e2 = entry_with_shards(vec![]);
        e2.snapshot = Snapshot::new("other", SnapshotId::with_uuid("s2", "u2"));
        let snapshots = SnapshotsInProgress::of(vec![e1, e2]);
        assert_eq!(snapshots.for_repo("repo").count(), 1);
        assert_eq!(snapshots.for_repo("other").count(), 1);
        assert_eq!(snapshots.len(), 2);
    }
}
