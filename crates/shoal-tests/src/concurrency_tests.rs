//! Clone orchestration, legacy peer behavior, and cross-repository
//! independence.

use shoal_snapshots::error::SnapshotError;
use shoal_snapshots::repository::{Repository, SnapshotInfo};
use shoal_snapshots::requests::{
    CloneSnapshotRequest, CreateSnapshotRequest, DeleteSnapshotRequest,
};
use shoal_snapshots::types::{
    DeletionState, NodeId, PeerVersion, ShardState, Snapshot, SnapshotState,
};
use shoal_snapshots::SnapshotEngine;

use crate::harness::{Captured, TestCluster, LOCAL_NODE};

fn seeded_cluster() -> TestCluster {
    let mut cluster = TestCluster::new();
    cluster.add_repository("backup");
    cluster.add_index("i", &[2]);
    let completion: Captured<SnapshotInfo> = Captured::new();
    cluster.engine.execute_snapshot(
        CreateSnapshotRequest::new("backup", "base").indices(vec!["i".to_string()]),
        completion.listener(),
    );
    let base = cluster.snapshot_handle("backup", "base").unwrap();
    cluster.shard_success(&base, "i", 0, 2, "gen-base");
    completion.expect_ok();
    cluster
}

#[test]
fn test_clone_snapshot_end_to_end() {
    let cluster = seeded_cluster();
    let cloned: Captured<()> = Captured::new();
    cluster.engine.clone_snapshot(
        CloneSnapshotRequest::new("backup", "base", "copy"),
        cloned.listener(),
    );
    cloned.expect_ok();

    let data = cluster.repository("backup").repository_data().unwrap();
    assert!(data.has_snapshot_name("copy"));
    assert!(cluster.state().snapshots.is_empty());
    // The shard was cloned on the cluster-manager without touching data nodes.
    let cloned_shards = cluster.repository("backup").cloned_shards();
    assert_eq!(cloned_shards.len(), 1);
    assert_eq!(cloned_shards[0].1.shard, 0);
}

#[test]
fn test_clone_of_missing_source_rejected() {
    let cluster = seeded_cluster();
    let cloned: Captured<()> = Captured::new();
    cluster.engine.clone_snapshot(
        CloneSnapshotRequest::new("backup", "ghost", "copy"),
        cloned.listener(),
    );
    assert!(matches!(
        cloned.expect_err(),
        SnapshotError::SnapshotMissing { .. }
    ));
}

#[test]
fn test_clone_from_snapshot_under_deletion_rejected() {
    let cluster = seeded_cluster();
    // A writer keeps the repository busy so the delete stays queued.
    let writer_completion: Captured<SnapshotInfo> = Captured::new();
    cluster.engine.execute_snapshot(
        CreateSnapshotRequest::new("backup", "writer").indices(vec!["i".to_string()]),
        writer_completion.listener(),
    );
    let deleted: Captured<()> = Captured::new();
    cluster.engine.delete_snapshots(
        DeleteSnapshotRequest::new("backup", vec!["base".to_string()]),
        deleted.listener(),
    );
    assert_eq!(
        cluster.state().deletions.entries[0].state,
        DeletionState::Waiting
    );

    let cloned: Captured<()> = Captured::new();
    cluster.engine.clone_snapshot(
        CloneSnapshotRequest::new("backup", "base", "copy"),
        cloned.listener(),
    );
    let error = cloned.expect_err();
    assert!(error.to_string().contains("being deleted"));

    let writer = cluster.snapshot_handle("backup", "writer").unwrap();
    cluster.shard_success(&writer, "i", 0, 2, "gen-w");
    writer_completion.expect_ok();
    deleted.expect_ok();
}

#[test]
fn test_delete_of_clone_source_rejected_and_clone_queues_behind_writer() {
    let cluster = seeded_cluster();
    // The writer holds shard 0, so the clone's only shard queues.
    let writer_completion: Captured<SnapshotInfo> = Captured::new();
    cluster.engine.execute_snapshot(
        CreateSnapshotRequest::new("backup", "writer").indices(vec!["i".to_string()]),
        writer_completion.listener(),
    );
    let cloned: Captured<()> = Captured::new();
    cluster.engine.clone_snapshot(
        CloneSnapshotRequest::new("backup", "base", "copy"),
        cloned.listener(),
    );
    {
        let state = cluster.state();
        let clone_entry = state
            .snapshots
            .entries
            .iter()
            .find(|e| e.is_clone())
            .expect("clone entry admitted");
        assert!(clone_entry.clones.values().all(|s| s.is_unassigned_queued()));
    }

    // While the clone is in flight its source cannot be deleted.
    let deleted: Captured<()> = Captured::new();
    cluster.engine.delete_snapshots(
        DeleteSnapshotRequest::new("backup", vec!["base".to_string()]),
        deleted.listener(),
    );
    let error = deleted.expect_err();
    assert!(error.to_string().contains("being cloned"));

    // Finishing the writer releases the shard; the reducer promotes the
    // queued clone onto the cluster-manager and it completes.
    let writer = cluster.snapshot_handle("backup", "writer").unwrap();
    cluster.shard_success(&writer, "i", 0, 2, "gen-w");
    writer_completion.expect_ok();
    cloned.expect_ok();

    let data = cluster.repository("backup").repository_data().unwrap();
    assert!(data.has_snapshot_name("copy"));

    let deleted: Captured<()> = Captured::new();
    cluster.engine.delete_snapshots(
        DeleteSnapshotRequest::new("backup", vec!["base".to_string()]),
        deleted.listener(),
    );
    deleted.expect_ok();
}

#[test]
fn test_clone_rejected_with_old_peers() {
    let mut cluster =
        TestCluster::with_min_peer_version(PeerVersion::FULL_CONCURRENCY);
    cluster.add_repository("backup");
    let cloned: Captured<()> = Captured::new();
    cluster.engine.clone_snapshot(
        CloneSnapshotRequest::new("backup", "base", "copy"),
        cloned.listener(),
    );
    assert!(matches!(
        cloned.expect_err(),
        SnapshotError::ConcurrentSnapshotExecution { .. }
    ));
}

#[test]
fn test_repositories_run_independently() {
    let mut cluster = TestCluster::new();
    cluster.add_repository("backup-a");
    cluster.add_repository("backup-b");
    cluster.add_index("i", &[2]);
    cluster.add_index("j", &[3]);

    let a: Captured<SnapshotInfo> = Captured::new();
    let b: Captured<SnapshotInfo> = Captured::new();
    cluster.engine.execute_snapshot(
        CreateSnapshotRequest::new("backup-a", "sa").indices(vec!["i".to_string()]),
        a.listener(),
    );
    cluster.engine.execute_snapshot(
        CreateSnapshotRequest::new("backup-b", "sb").indices(vec!["j".to_string()]),
        b.listener(),
    );
    // Same shard-for-shard indices, but different repositories: no queueing.
    let state = cluster.state();
    assert!(state
        .snapshots
        .entries
        .iter()
        .all(|e| e.shards.values().all(|s| s.state == ShardState::Init)));

    let sa = cluster.snapshot_handle("backup-a", "sa").unwrap();
    let sb = cluster.snapshot_handle("backup-b", "sb").unwrap();
    cluster.shard_success(&sb, "j", 0, 3, "gen-b");
    b.expect_ok();
    assert!(!a.is_resolved());
    cluster.shard_success(&sa, "i", 0, 2, "gen-a");
    a.expect_ok();
}

#[test]
fn test_at_most_one_started_deletion_per_repository() {
    let cluster = seeded_cluster();
    // Second snapshot to have two distinct delete targets.
    let completion: Captured<SnapshotInfo> = Captured::new();
    cluster.engine.execute_snapshot(
        CreateSnapshotRequest::new("backup", "extra").indices(vec!["i".to_string()]),
        completion.listener(),
    );
    let extra = cluster.snapshot_handle("backup", "extra").unwrap();
    cluster.shard_success(&extra, "i", 0, 2, "gen-e");
    completion.expect_ok();

    // A writer blocks both deletes; they must collapse into one waiting entry.
    let writer_completion: Captured<SnapshotInfo> = Captured::new();
    cluster.engine.execute_snapshot(
        CreateSnapshotRequest::new("backup", "writer").indices(vec!["i".to_string()]),
        writer_completion.listener(),
    );
    let d1: Captured<()> = Captured::new();
    let d2: Captured<()> = Captured::new();
    cluster.engine.delete_snapshots(
        DeleteSnapshotRequest::new("backup", vec!["base".to_string()]),
        d1.listener(),
    );
    cluster.engine.delete_snapshots(
        DeleteSnapshotRequest::new("backup", vec!["extra".to_string()]),
        d2.listener(),
    );
    let state = cluster.state();
    assert_eq!(state.deletions.entries.len(), 1);
    assert_eq!(state.deletions.entries[0].snapshots.len(), 2);
    assert_eq!(state.deletions.entries[0].state, DeletionState::Waiting);

    let writer = cluster.snapshot_handle("backup", "writer").unwrap();
    cluster.shard_success(&writer, "i", 0, 2, "gen-w");
    writer_completion.expect_ok();
    d1.expect_ok();
    d2.expect_ok();
    let data = cluster.repository("backup").repository_data().unwrap();
    assert!(!data.has_snapshot_name("base"));
    assert!(!data.has_snapshot_name("extra"));
    assert!(data.has_snapshot_name("writer"));
}

#[test]
fn test_legacy_create_initializes_repository_first() {
    let mut cluster = TestCluster::with_min_peer_version(PeerVersion::MULTI_DELETE);
    cluster.add_repository("backup");
    cluster.add_index("i", &[2]);

    let completion: Captured<SnapshotInfo> = Captured::new();
    cluster.engine.execute_snapshot(
        CreateSnapshotRequest::new("backup", "s1").indices(vec!["i".to_string()]),
        completion.listener(),
    );
    // The legacy path pre-registers the snapshot before starting it.
    assert_eq!(cluster.repository("backup").initialized_snapshots().len(), 1);
    let state = cluster.state();
    assert_eq!(state.snapshots.entries[0].state, SnapshotState::Started);

    let snapshot = cluster.snapshot_handle("backup", "s1").unwrap();
    cluster.shard_success(&snapshot, "i", 0, 2, "gen");
    let info = completion.expect_ok();
    assert_eq!(info.total_shards, 1);
}

#[test]
fn test_legacy_rejects_concurrent_snapshot() {
    let mut cluster = TestCluster::with_min_peer_version(PeerVersion::MULTI_DELETE);
    cluster.add_repository("backup");
    cluster.add_index("i", &[2]);

    let first: Captured<Snapshot> = Captured::new();
    cluster.engine.create_snapshot(
        CreateSnapshotRequest::new("backup", "s1").indices(vec!["i".to_string()]),
        first.listener(),
    );
    first.expect_ok();

    let second: Captured<Snapshot> = Captured::new();
    cluster.engine.create_snapshot(
        CreateSnapshotRequest::new("backup", "s2").indices(vec!["i".to_string()]),
        second.listener(),
    );
    assert!(matches!(
        second.expect_err(),
        SnapshotError::ConcurrentSnapshotExecution { .. }
    ));
}

#[test]
fn test_legacy_delete_waits_for_aborted_snapshot() {
    let mut cluster = TestCluster::with_min_peer_version(PeerVersion::MULTI_DELETE);
    cluster.add_repository("backup");
    cluster.add_index("i", &[2]);

    let completion: Captured<SnapshotInfo> = Captured::new();
    cluster.engine.execute_snapshot(
        CreateSnapshotRequest::new("backup", "s1").indices(vec!["i".to_string()]),
        completion.listener(),
    );
    let snapshot = cluster.snapshot_handle("backup", "s1").unwrap();

    let deleted: Captured<()> = Captured::new();
    cluster.engine.delete_snapshots(
        DeleteSnapshotRequest::new("backup", vec!["s1".to_string()]),
        deleted.listener(),
    );
    let state = cluster.state();
    assert_eq!(state.snapshots.entries[0].state, SnapshotState::Aborted);
    assert!(!deleted.is_resolved());

    cluster.shard_failed(&snapshot, "i", 0, 2, "aborted");
    assert!(completion.expect_err().to_string().contains("aborted"));
    deleted.expect_ok();
    let data = cluster.repository("backup").repository_data().unwrap();
    assert!(!data.has_snapshot_name("s1"));
}

#[test]
fn test_multi_delete_rejected_on_old_peers() {
    let mut cluster = TestCluster::with_min_peer_version(PeerVersion::NO_REPO_INITIALIZE);
    cluster.add_repository("backup");
    let deleted: Captured<()> = Captured::new();
    cluster.engine.delete_snapshots(
        DeleteSnapshotRequest::new("backup", vec!["a".to_string(), "b".to_string()]),
        deleted.listener(),
    );
    let error = deleted.expect_err();
    assert!(error.to_string().contains("multiple snapshots"));
}

#[test]
fn test_current_snapshots_listing() {
    let cluster = seeded_cluster();
    let completion: Captured<SnapshotInfo> = Captured::new();
    cluster.engine.execute_snapshot(
        CreateSnapshotRequest::new("backup", "nightly-1").indices(vec!["i".to_string()]),
        completion.listener(),
    );
    let state = cluster.state();
    assert_eq!(SnapshotEngine::current_snapshots(&state, "backup", &[]).len(), 1);
    assert_eq!(SnapshotEngine::current_snapshots(&state, "_all", &[]).len(), 1);
    assert_eq!(
        SnapshotEngine::current_snapshots(&state, "backup", &["nightly-*".to_string()]).len(),
        1
    );
    assert!(SnapshotEngine::current_snapshots(&state, "backup", &["weekly-*".to_string()])
        .is_empty());
    assert!(SnapshotEngine::current_snapshots(&state, "other", &[]).is_empty());
}

#[test]
fn test_snapshotting_indices_respects_partial_flag() {
    let mut cluster = TestCluster::new();
    cluster.add_repository("backup");
    cluster.add_index("i", &[2]);
    cluster.add_index("j", &[2]);

    let strict: Captured<Snapshot> = Captured::new();
    cluster.engine.create_snapshot(
        CreateSnapshotRequest::new("backup", "strict").indices(vec!["i".to_string()]),
        strict.listener(),
    );
    strict.expect_ok();
    let relaxed: Captured<Snapshot> = Captured::new();
    cluster.engine.create_snapshot(
        CreateSnapshotRequest::new("backup", "relaxed")
            .indices(vec!["j".to_string()])
            .partial(true),
        relaxed.listener(),
    );
    relaxed.expect_ok();

    let state = cluster.state();
    let candidates = ["i".to_string(), "j".to_string()].into_iter().collect();
    let busy = SnapshotEngine::snapshotting_indices(&state, &candidates);
    assert!(busy.contains("i"));
    // Partial snapshots tolerate index removal, so they don't block it.
    assert!(!busy.contains("j"));
}

#[test]
fn test_local_node_runs_clone_shards() {
    let cluster = seeded_cluster();
    let cloned: Captured<()> = Captured::new();
    cluster.engine.clone_snapshot(
        CloneSnapshotRequest::new("backup", "base", "copy"),
        cloned.listener(),
    );
    cloned.expect_ok();
    let info = cluster
        .repository("backup")
        .repository_data()
        .unwrap()
        .snapshot_by_name("copy")
        .cloned()
        .unwrap();
    let description = cluster
        .repository("backup")
        .snapshot_info(&info)
        .unwrap();
    assert_eq!(description.total_shards, 1);
    assert!(description.failures.is_empty());
    // Sanity: the harness engine node drove the clone.
    assert_eq!(NodeId::new(LOCAL_NODE), cluster.state().local_node);
}

#[test]
fn test_cluster_state_sections_roundtrip_through_wire_format() {
    let cluster = seeded_cluster();
    let completion: Captured<SnapshotInfo> = Captured::new();
    cluster.engine.execute_snapshot(
        CreateSnapshotRequest::new("backup", "wire").indices(vec!["i".to_string()]),
        completion.listener(),
    );
    let state = cluster.state();
    let encoded = bincode::serialize(&*state).expect("serialize cluster state");
    let decoded: shoal_snapshots::ClusterState =
        bincode::deserialize(&encoded).expect("deserialize cluster state");
    assert_eq!(*state, decoded);
    assert_eq!(decoded.snapshots.entries.len(), 1);
}
