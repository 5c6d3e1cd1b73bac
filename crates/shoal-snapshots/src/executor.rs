//! Batched reducer folding shard-status updates into in-progress entries.
//!
//! The reducer is a pure function `(state, updates) -> snapshots`: it holds no
//! mutable state of its own and can be applied repeatedly with the same
//! updates without changing the outcome, which is what makes at-least-once
//! delivery from data nodes safe.

use std::collections::BTreeMap;

use crate::assignment::start_shard_snapshot_after_clone;
use crate::cluster::ClusterState;
use crate::entries::{SnapshotEntry, SnapshotsInProgress};
use crate::types::{
    RepositoryShardId, ShardId, ShardSnapshotStatus, ShardState, Snapshot,
};

/// Which shard a status update addresses.
#[derive(Clone, Debug, PartialEq)]
pub enum ShardUpdateTarget {
    /// A routed shard of a regular snapshot.
    Shard(ShardId),
    /// A repository shard of a clone.
    RepoShard(RepositoryShardId),
}

/// A status update for one shard of one in-progress operation, as reported by
/// a data node or by the local clone executor.
#[derive(Clone, Debug, PartialEq)]
pub struct ShardSnapshotUpdate {
    /// Operation the update belongs to.
    pub snapshot: Snapshot,
    /// Addressed shard.
    pub target: ShardUpdateTarget,
    /// New status for the shard.
    pub status: ShardSnapshotStatus,
}

impl ShardSnapshotUpdate {
    /// Update for a routed shard of a regular snapshot.
    pub fn shard(snapshot: Snapshot, shard: ShardId, status: ShardSnapshotStatus) -> Self {
        ShardSnapshotUpdate {
            snapshot,
            target: ShardUpdateTarget::Shard(shard),
            status,
        }
    }

    /// Update for a repository shard of a clone.
    pub fn clone_shard(
        snapshot: Snapshot,
        shard: RepositoryShardId,
        status: ShardSnapshotStatus,
    ) -> Self {
        ShardSnapshotUpdate {
            snapshot,
            target: ShardUpdateTarget::RepoShard(shard),
            status,
        }
    }

    /// True if the update addresses a clone operation.
    pub fn is_clone(&self) -> bool {
        matches!(self.target, ShardUpdateTarget::RepoShard(_))
    }
}

struct Slot<'a> {
    update: &'a ShardSnapshotUpdate,
    /// Dropped from further consideration (consumed by a promotion, or a
    /// no-op retry for an already-completed shard).
    consumed: bool,
    /// Applied to the entry it addressed; may now release a queued shard in a
    /// younger entry.
    executed: bool,
}

/// Applies a batch of shard updates to the in-progress entries of `state`.
///
/// Entries are visited oldest first, so a shard released by the oldest
/// operation is handed to the next-oldest entry queued on it. Returns the
/// updated section, or `None` when no update changed anything.
pub fn apply_shard_updates(
    state: &ClusterState,
    updates: &[ShardSnapshotUpdate],
) -> Option<SnapshotsInProgress> {
    let local_node = state.local_node;
    let mut slots: Vec<Slot<'_>> = updates
        .iter()
        .map(|update| Slot {
            update,
            consumed: false,
            executed: false,
        })
        .collect();
    let mut entries: Vec<SnapshotEntry> = Vec::with_capacity(state.snapshots.len());
    let mut changed = 0usize;
    let mut promoted = 0usize;

    for entry in &state.snapshots.entries {
        if entry.state.completed() {
            entries.push(entry.clone());
            continue;
        }
        let mut shards: Option<BTreeMap<ShardId, ShardSnapshotStatus>> = None;
        let mut clones: Option<BTreeMap<RepositoryShardId, ShardSnapshotStatus>> = None;

        for slot in slots.iter_mut() {
            if slot.consumed {
                continue;
            }
            let update = slot.update;
            if update.snapshot.repository != entry.repository() {
                continue;
            }
            match &update.target {
                ShardUpdateTarget::RepoShard(repo_shard) => {
                    if update.snapshot.id == entry.snapshot.id {
                        debug_assert!(
                            entry.is_clone(),
                            "non-clone entry received a clone shard update"
                        );
                        let Some(existing) = entry.clones.get(repo_shard) else {
                            tracing::warn!(
                                snapshot = %update.snapshot,
                                shard = %repo_shard,
                                "received clone status update for untracked shard"
                            );
                            debug_assert!(false, "update for untracked clone shard");
                            continue;
                        };
                        if existing.state.completed() {
                            // Retried delivery for a shard that already
                            // finished; drop it.
                            slot.consumed = true;
                            continue;
                        }
                        tracing::trace!(
                            snapshot = %update.snapshot,
                            shard = %repo_shard,
                            state = ?update.status.state,
                            "updating shard clone"
                        );
                        clones
                            .get_or_insert_with(|| entry.clones.clone())
                            .insert(repo_shard.clone(), update.status.clone());
                        slot.executed = true;
                        changed += 1;
                    } else if slot.executed {
                        if entry.is_clone() {
                            if !matches!(
                                entry.clones.get(repo_shard),
                                Some(s) if s.state == ShardState::Queued
                            ) {
                                continue;
                            }
                            tracing::trace!(
                                shard = %repo_shard,
                                "starting queued clone after clone completion"
                            );
                            clones.get_or_insert_with(|| entry.clones.clone()).insert(
                                repo_shard.clone(),
                                ShardSnapshotStatus::init(
                                    update.status.node,
                                    update.status.generation.clone(),
                                ),
                            );
                            slot.consumed = true;
                            promoted += 1;
                        } else {
                            // Translate the repository shard back into a
                            // routed shard; an index no longer in the cluster
                            // is irrelevant to a regular snapshot.
                            if !state.metadata.indices.contains_key(repo_shard.index_name()) {
                                continue;
                            }
                            let routing_shard =
                                ShardId::new(repo_shard.index_name(), repo_shard.shard);
                            if !matches!(
                                entry.shards.get(&routing_shard),
                                Some(s) if s.state == ShardState::Queued
                            ) {
                                continue;
                            }
                            let status = start_shard_snapshot_after_clone(
                                state,
                                update.status.generation.clone(),
                                &routing_shard,
                            );
                            let active = status.is_active();
                            tracing::trace!(
                                shard = %routing_shard,
                                state = ?status.state,
                                "starting queued shard snapshot after clone completion"
                            );
                            shards
                                .get_or_insert_with(|| entry.shards.clone())
                                .insert(routing_shard, status);
                            if active {
                                // Only a started assignment consumes the
                                // released shard; a failed one leaves the
                                // update available for younger entries.
                                slot.consumed = true;
                                promoted += 1;
                            }
                        }
                    }
                }
                ShardUpdateTarget::Shard(shard_id) => {
                    if update.snapshot.id == entry.snapshot.id {
                        debug_assert!(
                            !entry.is_clone(),
                            "clone entry received a routed shard update"
                        );
                        if entry.is_clone() {
                            continue;
                        }
                        let Some(existing) = entry.shards.get(shard_id) else {
                            tracing::warn!(
                                snapshot = %update.snapshot,
                                shard = %shard_id,
                                "received status update for untracked shard"
                            );
                            debug_assert!(false, "update for untracked shard");
                            continue;
                        };
                        if existing.state.completed() {
                            slot.consumed = true;
                            continue;
                        }
                        tracing::trace!(
                            snapshot = %update.snapshot,
                            shard = %shard_id,
                            state = ?update.status.state,
                            "updating shard snapshot"
                        );
                        shards
                            .get_or_insert_with(|| entry.shards.clone())
                            .insert(shard_id.clone(), update.status.clone());
                        slot.executed = true;
                        changed += 1;
                    } else if slot.executed {
                        if entry.is_clone() {
                            let Some(index_id) =
                                entry.indices.iter().find(|i| i.name == shard_id.index)
                            else {
                                continue;
                            };
                            let repo_shard =
                                RepositoryShardId::new(index_id.clone(), shard_id.shard);
                            if !matches!(
                                entry.clones.get(&repo_shard),
                                Some(s) if s.state == ShardState::Queued
                            ) {
                                continue;
                            }
                            // Clones execute on the cluster-manager itself.
                            clones.get_or_insert_with(|| entry.clones.clone()).insert(
                                repo_shard,
                                ShardSnapshotStatus::init(
                                    Some(local_node),
                                    update.status.generation.clone(),
                                ),
                            );
                            slot.consumed = true;
                            promoted += 1;
                        } else {
                            if !matches!(
                                entry.shards.get(shard_id),
                                Some(s) if s.state == ShardState::Queued
                            ) {
                                continue;
                            }
                            tracing::trace!(
                                shard = %shard_id,
                                "starting queued shard snapshot"
                            );
                            shards.get_or_insert_with(|| entry.shards.clone()).insert(
                                shard_id.clone(),
                                ShardSnapshotStatus::init(
                                    update.status.node,
                                    update.status.generation.clone(),
                                ),
                            );
                            slot.consumed = true;
                            promoted += 1;
                        }
                    }
                }
            }
        }

        let updated = if let Some(shards) = shards {
            debug_assert!(clones.is_none(), "entry updated both shards and clones");
            entry.with_shards(shards)
        } else if let Some(clones) = clones {
            entry.with_clones(clones)
        } else {
            entry.clone()
        };
        entries.push(updated);
    }

    if changed > 0 {
        tracing::trace!(
            updates = changed,
            promoted = promoted,
            "shard state batch changed cluster state"
        );
        Some(SnapshotsInProgress::of(entries))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{IndexMetadata, ShardRouting};
    use crate::types::{
        NodeId, PeerVersion, RepoGeneration, ShardGeneration, SnapshotId, SnapshotState,
    };

    fn state_with_entries(entries: Vec<SnapshotEntry>) -> ClusterState {
        let mut state = ClusterState::default();
        state.local_node = NodeId::new(1);
        state.cluster_manager = Some(NodeId::new(1));
        state.nodes.extend([NodeId::new(1), NodeId::new(2)]);
        state
            .metadata
            .indices
            .insert("idx".into(), IndexMetadata::new("idx", 1));
        state.routing.indices.insert(
            "idx".into(),
            vec![ShardRouting::started(NodeId::new(2))],
        );
        state.snapshots = SnapshotsInProgress::of(entries);
        state
    }

    fn snapshot_entry(name: &str, status: ShardSnapshotStatus) -> SnapshotEntry {
        SnapshotEntry::started(
            Snapshot::new("repo", SnapshotId::new(name)),
            false,
            false,
            vec![crate::types::IndexId::with_id("idx", "iid")],
            vec![],
            0,
            RepoGeneration::new(0),
            [(ShardId::new("idx", 0), status)].into_iter().collect(),
            None,
            PeerVersion::CURRENT,
        )
    }

    fn success_update(entry: &SnapshotEntry) -> ShardSnapshotUpdate {
        ShardSnapshotUpdate::shard(
            entry.snapshot.clone(),
            ShardId::new("idx", 0),
            ShardSnapshotStatus::success(Some(NodeId::new(2)), ShardGeneration::new("g1")),
        )
    }

    #[test]
    fn test_success_update_completes_entry() {
        let entry = snapshot_entry("s1", ShardSnapshotStatus::init(Some(NodeId::new(2)), None));
        let state = state_with_entries(vec![entry.clone()]);
        let updated = apply_shard_updates(&state, &[success_update(&entry)]).expect("changed");
        assert_eq!(updated.entries[0].state, SnapshotState::Success);
        assert_eq!(
            updated.entries[0].shards[&ShardId::new("idx", 0)].state,
            ShardState::Success
        );
    }

    #[test]
    fn test_update_for_completed_shard_is_noop() {
        let entry = snapshot_entry(
            "s1",
            ShardSnapshotStatus::success(Some(NodeId::new(2)), ShardGeneration::new("g1")),
        );
        let state = state_with_entries(vec![entry.clone()]);
        assert!(apply_shard_updates(&state, &[success_update(&entry)]).is_none());
    }

    #[test]
    fn test_idempotent_double_apply() {
        let entry = snapshot_entry("s1", ShardSnapshotStatus::init(Some(NodeId::new(2)), None));
        let state = state_with_entries(vec![entry.clone()]);
        let update = success_update(&entry);
        let once = apply_shard_updates(&state, &[update.clone()]).expect("changed");
        let mut state_after = state.clone();
        state_after.snapshots = once.clone();
        // Re-delivering the same update must not change the state again.
        assert!(apply_shard_updates(&state_after, &[update]).is_none());
    }

    #[test]
    fn test_queued_shard_promoted_to_next_entry() {
        let older = snapshot_entry("s1", ShardSnapshotStatus::init(Some(NodeId::new(2)), None));
        let younger = snapshot_entry("s2", ShardSnapshotStatus::unassigned_queued());
        let state = state_with_entries(vec![older.clone(), younger]);
        let updated =
            apply_shard_updates(&state, &[success_update(&older)]).expect("changed");
        assert_eq!(updated.entries[0].state, SnapshotState::Success);
        let promoted = &updated.entries[1].shards[&ShardId::new("idx", 0)];
        assert_eq!(promoted.state, ShardState::Init);
        assert_eq!(promoted.node, Some(NodeId::new(2)));
        assert_eq!(promoted.generation.as_ref().unwrap().as_str(), "g1");
    }

    #[test]
    fn test_release_goes_to_oldest_queued_entry_only() {
        let older = snapshot_entry("s1", ShardSnapshotStatus::init(Some(NodeId::new(2)), None));
        let mid = snapshot_entry("s2", ShardSnapshotStatus::unassigned_queued());
        let newest = snapshot_entry("s3", ShardSnapshotStatus::unassigned_queued());
        let state = state_with_entries(vec![older.clone(), mid, newest]);
        let updated =
            apply_shard_updates(&state, &[success_update(&older)]).expect("changed");
        assert_eq!(
            updated.entries[1].shards[&ShardId::new("idx", 0)].state,
            ShardState::Init
        );
        // The youngest entry keeps waiting for the new holder.
        assert!(updated.entries[2].shards[&ShardId::new("idx", 0)].is_unassigned_queued());
    }

    #[test]
    fn test_update_for_other_repository_ignored() {
        let entry = snapshot_entry("s1", ShardSnapshotStatus::init(Some(NodeId::new(2)), None));
        let state = state_with_entries(vec![entry]);
        let foreign = ShardSnapshotUpdate::shard(
            Snapshot::new("elsewhere", SnapshotId::new("s1")),
            ShardId::new("idx", 0),
            ShardSnapshotStatus::success(Some(NodeId::new(2)), ShardGeneration::new("g")),
        );
        assert!(apply_shard_updates(&state, &[foreign]).is_none());
    }

    #[test]
    fn test_shard_completion_promotes_queued_clone() {
        let older = snapshot_entry("s1", ShardSnapshotStatus::init(Some(NodeId::new(2)), None));
        let mut clone_entry = SnapshotEntry::start_clone(
            Snapshot::new("repo", SnapshotId::new("clone")),
            SnapshotId::new("src"),
            vec![crate::types::IndexId::with_id("idx", "iid")],
            0,
            RepoGeneration::new(0),
            PeerVersion::CURRENT,
        );
        clone_entry.clones.insert(
            RepositoryShardId::new(crate::types::IndexId::with_id("idx", "iid"), 0),
            ShardSnapshotStatus::unassigned_queued(),
        );
        let state = state_with_entries(vec![older.clone(), clone_entry]);
        let updated = apply_shard_updates(&state, &[success_update(&older)]).expect("changed");
        let clone_status = updated.entries[1]
            .clones
            .values()
            .next()
            .expect("clone shard present");
        assert_eq!(clone_status.state, ShardState::Init);
        // Clones always run on the local (cluster-manager) node.
        assert_eq!(clone_status.node, Some(NodeId::new(1)));
    }

    #[test]
    fn test_clone_completion_promotes_queued_shard() {
        let index = crate::types::IndexId::with_id("idx", "iid");
        let mut clone_entry = SnapshotEntry::start_clone(
            Snapshot::new("repo", SnapshotId::new("clone")),
            SnapshotId::new("src"),
            vec![index.clone()],
            0,
            RepoGeneration::new(0),
            PeerVersion::CURRENT,
        );
        clone_entry.clones.insert(
            RepositoryShardId::new(index.clone(), 0),
            ShardSnapshotStatus::init(Some(NodeId::new(1)), None),
        );
        let waiting = snapshot_entry("s2", ShardSnapshotStatus::unassigned_queued());
        let state = state_with_entries(vec![clone_entry.clone(), waiting]);
        let update = ShardSnapshotUpdate::clone_shard(
            clone_entry.snapshot.clone(),
            RepositoryShardId::new(index, 0),
            ShardSnapshotStatus::success(Some(NodeId::new(1)), ShardGeneration::new("cg")),
        );
        let updated = apply_shard_updates(&state, &[update]).expect("changed");
        assert_eq!(updated.entries[0].state, SnapshotState::Success);
        let promoted = &updated.entries[1].shards[&ShardId::new("idx", 0)];
        // Reassignment follows the routing table, not the clone's node.
        assert_eq!(promoted.state, ShardState::Init);
        assert_eq!(promoted.node, Some(NodeId::new(2)));
        assert_eq!(promoted.generation.as_ref().unwrap().as_str(), "cg");
    }

    #[test]
    fn test_batch_processes_multiple_updates() {
        let e1 = snapshot_entry("s1", ShardSnapshotStatus::init(Some(NodeId::new(2)), None));
        let e2 = snapshot_entry("s2", ShardSnapshotStatus::unassigned_queued());
        let state = state_with_entries(vec![e1.clone(), e2.clone()]);
        let failed = ShardSnapshotUpdate::shard(
            e1.snapshot.clone(),
            ShardId::new("idx", 0),
            ShardSnapshotStatus::failed(Some(NodeId::new(2)), "io error", None),
        );
        let updated = apply_shard_updates(&state, &[failed]).expect("changed");
        assert_eq!(updated.entries[0].state, SnapshotState::Success);
        assert!(updated.entries[0].failure.is_none());
        // The failed release still starts the queued shard on the new holder.
        assert_eq!(
            updated.entries[1].shards[&ShardId::new("idx", 0)].state,
            ShardState::Init
        );
    }
}
