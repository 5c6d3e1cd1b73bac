//! Shard assignment policy for newly admitted snapshots.

use std::collections::BTreeMap;

use crate::cluster::ClusterState;
use crate::inflight::InFlightShardStates;
use crate::repository::RepositoryData;
use crate::types::{IndexId, ShardGeneration, ShardId, ShardSnapshotStatus};

/// Computes the initial shard statuses for a snapshot of the given indices.
///
/// For each `(index, shard)`:
/// - index missing from cluster metadata: `Missing("missing index")`
/// - a STARTED deletion holds the repository, or another operation is actively
///   writing the shard: the `unassigned_queued` sentinel
/// - primary unassigned: `Missing("primary shard is not allocated")`
/// - primary initializing or relocating: `Waiting`
/// - primary assigned but not started: `Missing`
/// - primary started: `Init` on the primary's node
///
/// Shard generations chain through in-flight operations; the first shard of an
/// index new to the repository uses the new-shard sentinel generation.
pub fn compute_shard_assignments(
    state: &ClusterState,
    indices: &[IndexId],
    use_shard_generations: bool,
    repository_data: &RepositoryData,
    repository: &str,
) -> BTreeMap<ShardId, ShardSnapshotStatus> {
    let mut assignments = BTreeMap::new();
    let in_flight = InFlightShardStates::for_repo(repository, &state.snapshots.entries);
    let ready_to_execute = !state.deletions.has_started_for_repo(repository);
    for index in indices {
        let index_name = &index.name;
        let is_new_index = !repository_data.contains_index(index_name);
        let Some(index_metadata) = state.metadata.indices.get(index_name) else {
            // The index was deleted before the snapshot could start.
            assignments.insert(
                ShardId::new(index_name.clone(), 0),
                ShardSnapshotStatus::missing("missing index", None),
            );
            continue;
        };
        for shard in 0..index_metadata.shard_count {
            let shard_id = ShardId::new(index_name.clone(), shard);
            let generation = if use_shard_generations {
                match in_flight.generation_for_shard(index, shard, repository_data) {
                    Some(generation) => Some(generation),
                    None if is_new_index => Some(ShardGeneration::new_shard()),
                    None => None,
                }
            } else {
                None
            };
            let status = if !state.routing.has_index(index_name) {
                ShardSnapshotStatus::missing("missing routing table", generation)
            } else if !ready_to_execute || in_flight.is_active(index_name, shard) {
                ShardSnapshotStatus::unassigned_queued()
            } else {
                assign_from_routing(state, &shard_id, generation)
            };
            assignments.insert(shard_id, status);
        }
    }
    assignments
}

/// Builds a shard status for a shard that just became assignable because a
/// clone of it completed. Unlike fresh admission the shard cannot be queued:
/// the finished clone was the holder.
pub fn start_shard_snapshot_after_clone(
    state: &ClusterState,
    generation: Option<ShardGeneration>,
    shard_id: &ShardId,
) -> ShardSnapshotStatus {
    assign_from_routing(state, shard_id, generation)
}

fn assign_from_routing(
    state: &ClusterState,
    shard_id: &ShardId,
    generation: Option<ShardGeneration>,
) -> ShardSnapshotStatus {
    let Some(primary) = state.routing.primary(&shard_id.index, shard_id.shard) else {
        return ShardSnapshotStatus::missing("primary shard is not allocated", generation);
    };
    if !primary.assigned() {
        ShardSnapshotStatus::missing("primary shard is not allocated", generation)
    } else if primary.initializing_or_relocating() {
        ShardSnapshotStatus::waiting(primary.node, generation)
    } else if !primary.is_started() {
        ShardSnapshotStatus::missing("primary shard hasn't been started yet", generation)
    } else {
        ShardSnapshotStatus::init(primary.node, generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{IndexMetadata, ShardRouting};
    use crate::entries::{DeletionEntry, SnapshotDeletionsInProgress, SnapshotEntry, SnapshotsInProgress};
    use crate::types::{
        DeletionState, NodeId, PeerVersion, RepoGeneration, ShardState, Snapshot, SnapshotId,
    };

    fn base_state() -> ClusterState {
        let mut state = ClusterState::default();
        state.local_node = NodeId::new(1);
        state.cluster_manager = Some(NodeId::new(1));
        state.nodes.extend([NodeId::new(1), NodeId::new(2)]);
        state
            .metadata
            .indices
            .insert("idx".into(), IndexMetadata::new("idx", 2));
        state.routing.indices.insert(
            "idx".into(),
            vec![
                ShardRouting::started(NodeId::new(1)),
                ShardRouting::started(NodeId::new(2)),
            ],
        );
        state
    }

    fn index_id() -> IndexId {
        IndexId::with_id("idx", "iid")
    }

    #[test]
    fn test_started_primaries_assigned() {
        let state = base_state();
        let shards = compute_shard_assignments(
            &state,
            &[index_id()],
            true,
            &RepositoryData::empty(),
            "repo",
        );
        assert_eq!(shards.len(), 2);
        let s0 = &shards[&ShardId::new("idx", 0)];
        assert_eq!(s0.state, ShardState::Init);
        assert_eq!(s0.node, Some(NodeId::new(1)));
        let s1 = &shards[&ShardId::new("idx", 1)];
        assert_eq!(s1.node, Some(NodeId::new(2)));
    }

    #[test]
    fn test_new_index_gets_new_shard_generation() {
        let state = base_state();
        let shards = compute_shard_assignments(
            &state,
            &[index_id()],
            true,
            &RepositoryData::empty(),
            "repo",
        );
        let s0 = &shards[&ShardId::new("idx", 0)];
        assert_eq!(
            s0.generation.as_ref().unwrap().as_str(),
            ShardGeneration::NEW_SHARD_GEN
        );
    }

    #[test]
    fn test_known_index_uses_repo_generation() {
        let state = base_state();
        let mut data = RepositoryData::empty();
        data.indices.insert("idx".into(), index_id());
        data.shard_generations
            .entry("iid".into())
            .or_default()
            .insert(0, ShardGeneration::new("g0"));
        let shards = compute_shard_assignments(&state, &[index_id()], true, &data, "repo");
        assert_eq!(
            shards[&ShardId::new("idx", 0)].generation.as_ref().unwrap().as_str(),
            "g0"
        );
        // Shard 1 has no recorded generation and the index is not new.
        assert!(shards[&ShardId::new("idx", 1)].generation.is_none());
    }

    #[test]
    fn test_no_generations_without_shard_gen_support() {
        let state = base_state();
        let shards = compute_shard_assignments(
            &state,
            &[index_id()],
            false,
            &RepositoryData::empty(),
            "repo",
        );
        assert!(shards.values().all(|s| s.generation.is_none()));
    }

    #[test]
    fn test_missing_index_marked_missing() {
        let state = base_state();
        let ghost = IndexId::with_id("ghost", "gid");
        let shards = compute_shard_assignments(
            &state,
            &[ghost],
            true,
            &RepositoryData::empty(),
            "repo",
        );
        let status = &shards[&ShardId::new("ghost", 0)];
        assert_eq!(status.state, ShardState::Missing);
        assert_eq!(status.reason.as_deref(), Some("missing index"));
    }

    #[test]
    fn test_unassigned_primary_missing() {
        let mut state = base_state();
        state.routing.indices.insert(
            "idx".into(),
            vec![ShardRouting::unassigned(), ShardRouting::started(NodeId::new(2))],
        );
        let shards = compute_shard_assignments(
            &state,
            &[index_id()],
            true,
            &RepositoryData::empty(),
            "repo",
        );
        let status = &shards[&ShardId::new("idx", 0)];
        assert_eq!(status.state, ShardState::Missing);
        assert_eq!(status.reason.as_deref(), Some("primary shard is not allocated"));
    }

    #[test]
    fn test_initializing_primary_waits() {
        let mut state = base_state();
        state.routing.indices.insert(
            "idx".into(),
            vec![
                ShardRouting::initializing(NodeId::new(1)),
                ShardRouting::relocating(NodeId::new(2)),
            ],
        );
        let shards = compute_shard_assignments(
            &state,
            &[index_id()],
            true,
            &RepositoryData::empty(),
            "repo",
        );
        assert_eq!(shards[&ShardId::new("idx", 0)].state, ShardState::Waiting);
        assert_eq!(shards[&ShardId::new("idx", 1)].state, ShardState::Waiting);
    }

    #[test]
    fn test_started_deletion_queues_all_shards() {
        let mut state = base_state();
        state.deletions = SnapshotDeletionsInProgress::of(vec![DeletionEntry::new(
            vec![],
            "repo",
            0,
            RepoGeneration::new(0),
            DeletionState::Started,
        )]);
        let shards = compute_shard_assignments(
            &state,
            &[index_id()],
            true,
            &RepositoryData::empty(),
            "repo",
        );
        assert!(shards.values().all(|s| s.is_unassigned_queued()));
    }

    #[test]
    fn test_held_shard_queued() {
        let mut state = base_state();
        let holder = SnapshotEntry::started(
            Snapshot::new("repo", SnapshotId::new("holder")),
            false,
            false,
            vec![index_id()],
            vec![],
            0,
            RepoGeneration::new(0),
            [(
                ShardId::new("idx", 0),
                ShardSnapshotStatus::init(Some(NodeId::new(1)), None),
            )]
            .into_iter()
            .collect(),
            None,
            PeerVersion::CURRENT,
        );
        state.snapshots = SnapshotsInProgress::of(vec![holder]);
        let shards = compute_shard_assignments(
            &state,
            &[index_id()],
            true,
            &RepositoryData::empty(),
            "repo",
        );
        assert!(shards[&ShardId::new("idx", 0)].is_unassigned_queued());
        assert_eq!(shards[&ShardId::new("idx", 1)].state, ShardState::Init);
    }

    #[test]
    fn test_after_clone_assignment() {
        let state = base_state();
        let status = start_shard_snapshot_after_clone(
            &state,
            Some(ShardGeneration::new("g")),
            &ShardId::new("idx", 0),
        );
        assert_eq!(status.state, ShardState::Init);
        assert_eq!(status.node, Some(NodeId::new(1)));
        let missing = start_shard_snapshot_after_clone(
            &state,
            None,
            &ShardId::new("ghost", 0),
        );
        assert_eq!(missing.state, ShardState::Missing);
    }
}
