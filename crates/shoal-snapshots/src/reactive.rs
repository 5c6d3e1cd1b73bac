//! Reaction to node departures and routing changes.
//!
//! Runs on every applied cluster-state change while this node is the elected
//! cluster-manager. Pure functions here compute whether a reaction pass is
//! needed and what the updated entries look like; the engine wraps them into
//! a single state-update task.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::cluster::{ClusterChangedEvent, ClusterState};
use crate::entries::{SnapshotEntry, SnapshotsInProgress};
use crate::types::{
    NodeId, RepoGeneration, ShardId, ShardSnapshotStatus, ShardState, Snapshot, SnapshotState,
};

/// True if any non-completed shard of any entry was assigned to one of the
/// removed nodes, meaning its status must be adjusted.
pub fn removed_nodes_cleanup_needed(
    snapshots: &SnapshotsInProgress,
    removed: &[NodeId],
) -> bool {
    if removed.is_empty() {
        return false;
    }
    let removed: BTreeSet<NodeId> = removed.iter().copied().collect();
    snapshots.entries.iter().any(|entry| {
        if entry.state.completed() {
            return false;
        }
        entry.shards.values().any(|status| {
            !status.state.completed()
                && status.node.map(|n| removed.contains(&n)).unwrap_or(false)
        })
    })
}

/// True if a routing change started or unassigned the primary of any shard a
/// STARTED entry is waiting on.
pub fn waiting_shards_started_or_unassigned(event: &ClusterChangedEvent) -> bool {
    for entry in &event.current.snapshots.entries {
        if entry.state != SnapshotState::Started {
            continue;
        }
        for (shard_id, status) in &entry.shards {
            if status.state != ShardState::Waiting {
                continue;
            }
            if !event.index_routing_changed(&shard_id.index) {
                continue;
            }
            match event.current.routing.primary(&shard_id.index, shard_id.shard) {
                // Index routing disappeared; waiting shards have to fail.
                None => return true,
                Some(primary) => {
                    if primary.is_started() || !primary.assigned() {
                        return true;
                    }
                }
            }
        }
    }
    false
}

/// Result of one external-change pass over the in-progress entries.
#[derive(Debug, Default)]
pub struct ExternalChangeOutcome {
    /// Updated snapshots section, or `None` when nothing changed.
    pub snapshots: Option<SnapshotsInProgress>,
    /// Entries whose shard work is now fully completed and which must be
    /// handed to finalization.
    pub finished: Vec<SnapshotEntry>,
}

/// Re-inspects every relevant entry after a node or routing change.
///
/// When nodes changed, both STARTED and ABORTED entries are updated so that
/// shards running on removed nodes fail; for pure routing changes only
/// STARTED entries matter. A failure observed for a shard is remembered per
/// repository so that queued entries waiting on the same shard fail the same
/// way instead of waiting forever.
pub fn process_external_changes(
    state: &ClusterState,
    changed_nodes: bool,
    initializing_clones: &HashSet<Snapshot>,
) -> ExternalChangeOutcome {
    let mut outcome = ExternalChangeOutcome::default();
    let mut changed = false;
    let mut updated_entries = Vec::with_capacity(state.snapshots.len());
    let mut known_failures: BTreeMap<String, BTreeMap<ShardId, ShardSnapshotStatus>> =
        BTreeMap::new();

    for entry in &state.snapshots.entries {
        let relevant = match entry.state {
            SnapshotState::Started => true,
            SnapshotState::Aborted => changed_nodes,
            _ => false,
        };
        if relevant {
            if entry.is_clone() && entry.clones.is_empty() {
                if initializing_clones.contains(&entry.snapshot) {
                    updated_entries.push(entry.clone());
                } else {
                    // Clone whose preparation died with the previous
                    // cluster-manager; drop it.
                    tracing::debug!(snapshot = %entry.snapshot, "removing not yet started clone");
                    changed = true;
                }
                continue;
            }
            let failures = known_failures.entry(entry.repository().to_string()).or_default();
            match process_waiting_shards_and_removed_nodes(&entry.shards, state, failures) {
                Some(shards) => {
                    let updated = entry.with_shards(shards);
                    changed = true;
                    if updated.state.completed() {
                        outcome.finished.push(updated.clone());
                    }
                    updated_entries.push(updated);
                }
                None => updated_entries.push(entry.clone()),
            }
        } else if entry.repo_generation == RepoGeneration::UNKNOWN {
            // Dangling entry admitted by an older cluster-manager that never
            // wrote anything; safe to drop without cleanup.
            tracing::debug!(snapshot = %entry.snapshot, "removing dangling snapshot entry");
            changed = true;
        } else {
            if entry.state.completed() || entry.shards_completed() {
                outcome.finished.push(entry.clone());
            }
            updated_entries.push(entry.clone());
        }
    }
    if changed {
        outcome.snapshots = Some(SnapshotsInProgress::of(updated_entries));
    }
    outcome
}

/// Applies the per-shard reaction rules. Returns the updated shard map, or
/// `None` when nothing changed.
pub fn process_waiting_shards_and_removed_nodes(
    shards: &BTreeMap<ShardId, ShardSnapshotStatus>,
    state: &ClusterState,
    known_failures: &mut BTreeMap<ShardId, ShardSnapshotStatus>,
) -> Option<BTreeMap<ShardId, ShardSnapshotStatus>> {
    let mut changed = false;
    let mut updated = BTreeMap::new();
    for (shard_id, status) in shards {
        if status.is_unassigned_queued() {
            match known_failures.get(shard_id) {
                // The holder this shard was waiting on failed; inherit the
                // same failure.
                Some(failure) => {
                    changed = true;
                    updated.insert(shard_id.clone(), failure.clone());
                }
                None => {
                    updated.insert(shard_id.clone(), status.clone());
                }
            }
        } else if status.state == ShardState::Waiting {
            if let Some(primary) = state.routing.primary(&shard_id.index, shard_id.shard) {
                if primary.is_started() {
                    changed = true;
                    tracing::trace!(shard = %shard_id, node = ?primary.node, "starting awaited shard");
                    updated.insert(
                        shard_id.clone(),
                        ShardSnapshotStatus::init(primary.node, status.generation.clone()),
                    );
                    continue;
                } else if primary.initializing_or_relocating() {
                    updated.insert(shard_id.clone(), status.clone());
                    continue;
                }
            }
            // Primary became unassigned or the index disappeared.
            changed = true;
            tracing::warn!(shard = %shard_id, "failing snapshot of unassigned shard");
            let failed = ShardSnapshotStatus {
                node: status.node,
                state: ShardState::Failed,
                generation: status.generation.clone(),
                reason: Some("shard is unassigned".to_string()),
            };
            known_failures.insert(shard_id.clone(), failed.clone());
            updated.insert(shard_id.clone(), failed);
        } else if !status.state.completed() {
            match status.node {
                Some(node) if !state.node_exists(node) => {
                    changed = true;
                    tracing::warn!(shard = %shard_id, %node, "failing snapshot shard on removed node");
                    let failed = ShardSnapshotStatus {
                        node: status.node,
                        state: ShardState::Failed,
                        generation: status.generation.clone(),
                        reason: Some("node shutdown".to_string()),
                    };
                    known_failures.insert(shard_id.clone(), failed.clone());
                    updated.insert(shard_id.clone(), failed);
                }
                _ => {
                    updated.insert(shard_id.clone(), status.clone());
                }
            }
        } else {
            updated.insert(shard_id.clone(), status.clone());
        }
    }
    if changed {
        Some(updated)
    } else {
        None
    }
}
