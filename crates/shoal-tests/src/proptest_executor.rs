//! Property tests for the pure shard-state reducer.

use proptest::prelude::*;

use shoal_snapshots::cluster::{ClusterState, IndexMetadata, ShardRouting};
use shoal_snapshots::entries::{SnapshotEntry, SnapshotsInProgress};
use shoal_snapshots::executor::{apply_shard_updates, ShardSnapshotUpdate};
use shoal_snapshots::types::{
    IndexId, NodeId, PeerVersion, RepoGeneration, ShardGeneration, ShardId, ShardSnapshotStatus,
    ShardState, Snapshot, SnapshotId,
};

fn entry(name: &str, status: ShardSnapshotStatus) -> SnapshotEntry {
    SnapshotEntry::started(
        Snapshot::new("repo", SnapshotId::with_uuid(name, format!("uuid-{}", name))),
        false,
        true,
        vec![IndexId::with_id("idx", "iid")],
        vec![],
        0,
        RepoGeneration::new(0),
        [(ShardId::new("idx", 0), status)].into_iter().collect(),
        None,
        PeerVersion::CURRENT,
    )
}

fn state_with(statuses: &[ShardSnapshotStatus]) -> ClusterState {
    let mut state = ClusterState::default();
    state.local_node = NodeId::new(1);
    state.cluster_manager = Some(NodeId::new(1));
    state.nodes.extend([NodeId::new(1), NodeId::new(2)]);
    state
        .metadata
        .indices
        .insert("idx".into(), IndexMetadata::new("idx", 1));
    state
        .routing
        .indices
        .insert("idx".into(), vec![ShardRouting::started(NodeId::new(2))]);
    state.snapshots = SnapshotsInProgress::of(
        statuses
            .iter()
            .enumerate()
            .map(|(i, status)| entry(&format!("s{}", i), status.clone()))
            .collect(),
    );
    state
}

fn status_strategy() -> impl Strategy<Value = ShardSnapshotStatus> {
    prop_oneof![
        Just(ShardSnapshotStatus::init(Some(NodeId::new(2)), None)),
        Just(ShardSnapshotStatus::unassigned_queued()),
        Just(ShardSnapshotStatus::waiting(Some(NodeId::new(2)), None)),
        Just(ShardSnapshotStatus::success(
            Some(NodeId::new(2)),
            ShardGeneration::new("done")
        )),
    ]
}

proptest! {
    /// Re-delivering a batch after it was applied never changes state again.
    #[test]
    fn prop_reducer_is_idempotent(
        statuses in prop::collection::vec(status_strategy(), 1..5),
        succeeds in any::<bool>(),
    ) {
        let state = state_with(&statuses);
        let target = state.snapshots.entries[0].snapshot.clone();
        let update_status = if succeeds {
            ShardSnapshotStatus::success(Some(NodeId::new(2)), ShardGeneration::new("g"))
        } else {
            ShardSnapshotStatus::failed(Some(NodeId::new(2)), "io error", None)
        };
        let update =
            ShardSnapshotUpdate::shard(target, ShardId::new("idx", 0), update_status);
        match apply_shard_updates(&state, std::slice::from_ref(&update)) {
            Some(snapshots) => {
                let mut after = state.clone();
                after.snapshots = snapshots;
                prop_assert!(
                    apply_shard_updates(&after, std::slice::from_ref(&update)).is_none(),
                    "second application of the same update changed state"
                );
            }
            None => {
                // The only no-op case: the target shard had already completed.
                prop_assert!(statuses[0].state.completed());
            }
        }
    }

    /// A released shard starts on at most one queued entry, and completed
    /// statuses are never rewritten.
    #[test]
    fn prop_release_promotes_at_most_one_queued_entry(
        statuses in prop::collection::vec(status_strategy(), 2..6),
        succeeds in any::<bool>(),
    ) {
        let state = state_with(&statuses);
        let target = state.snapshots.entries[0].snapshot.clone();
        let update_status = if succeeds {
            ShardSnapshotStatus::success(Some(NodeId::new(2)), ShardGeneration::new("g"))
        } else {
            ShardSnapshotStatus::failed(Some(NodeId::new(2)), "io error", None)
        };
        let update =
            ShardSnapshotUpdate::shard(target, ShardId::new("idx", 0), update_status);
        if let Some(snapshots) = apply_shard_updates(&state, std::slice::from_ref(&update)) {
            let shard = ShardId::new("idx", 0);
            let mut promotions = 0;
            for (i, after) in snapshots.entries.iter().enumerate().skip(1) {
                let before = &state.snapshots.entries[i].shards[&shard];
                let now = &after.shards[&shard];
                if before.is_unassigned_queued() && now.state == ShardState::Init {
                    promotions += 1;
                } else if before.state.completed() {
                    prop_assert_eq!(before, now, "completed status was rewritten");
                } else if !before.is_unassigned_queued() {
                    prop_assert_eq!(before, now, "uninvolved entry changed");
                }
            }
            prop_assert!(promotions <= 1, "shard released to {} entries", promotions);
            // Promotion targets the oldest queued entry.
            if promotions == 1 {
                let first_queued = state
                    .snapshots
                    .entries
                    .iter()
                    .enumerate()
                    .skip(1)
                    .find(|(_, e)| e.shards[&shard].is_unassigned_queued())
                    .map(|(i, _)| i)
                    .expect("a queued entry exists");
                prop_assert_eq!(
                    snapshots.entries[first_queued].shards[&shard].state,
                    ShardState::Init
                );
            }
        }
    }
}
