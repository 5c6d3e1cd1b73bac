//! Pure helpers for admitting, promoting, and unwinding snapshot deletions.

use std::collections::BTreeSet;

use crate::cluster::ClusterState;
use crate::entries::{
    DeletionEntry, SnapshotDeletionsInProgress, SnapshotEntry, SnapshotsInProgress,
};
use crate::error::SnapshotError;
use crate::repository::RepositoryData;
use crate::types::{DeletionState, ShardId, ShardSnapshotStatus, Snapshot, SnapshotId};
use crate::validate::{is_pattern, simple_match, simple_match_any};

/// True if the entry currently writes to the repository: either it is
/// finalizing on the cluster-manager (completed state) or some shard is
/// actively writing on a data node.
pub fn is_writing_to_repository(entry: &SnapshotEntry) -> bool {
    if entry.state.completed() {
        return true;
    }
    if entry.is_clone() {
        entry.clones.values().any(|s| s.is_active())
    } else {
        entry.shards.values().any(|s| s.is_active())
    }
}

/// Deletions that can start now, plus the updated deletions section.
#[derive(Debug, Default)]
pub struct ReadyDeletions {
    /// Updated section, or `None` when nothing changed.
    pub deletions: Option<SnapshotDeletionsInProgress>,
    /// Entries that are executable after the update, in admission order.
    pub ready: Vec<DeletionEntry>,
}

/// Promotes the oldest WAITING deletion of each repository to STARTED when no
/// snapshot entry of that repository is writing anymore.
pub fn ready_deletions(
    snapshots: &SnapshotsInProgress,
    deletions: &SnapshotDeletionsInProgress,
) -> ReadyDeletions {
    if !deletions.has_deletions() {
        return ReadyDeletions::default();
    }
    let mut seen_repos = BTreeSet::new();
    let mut changed = false;
    let mut ready = Vec::new();
    let mut updated = Vec::with_capacity(deletions.entries.len());
    for entry in &deletions.entries {
        let first_for_repo = seen_repos.insert(entry.repository.clone());
        if first_for_repo
            && entry.state == DeletionState::Waiting
            && snapshots
                .for_repo(&entry.repository)
                .all(|snapshot| !is_writing_to_repository(snapshot))
        {
            changed = true;
            let started = entry.started();
            ready.push(started.clone());
            updated.push(started);
        } else {
            updated.push(entry.clone());
        }
    }
    ReadyDeletions {
        deletions: changed.then(|| SnapshotDeletionsInProgress::of(updated)),
        ready,
    }
}

/// Removes the given snapshot ids from every deletion of the repository.
/// Returns `None` when no deletion referenced any of them.
pub fn deletions_without_snapshots(
    deletions: &SnapshotDeletionsInProgress,
    snapshot_ids: &[SnapshotId],
    repository: &str,
) -> Option<SnapshotDeletionsInProgress> {
    let mut changed = false;
    let mut updated = Vec::with_capacity(deletions.entries.len());
    for entry in &deletions.entries {
        if entry.repository == repository {
            let remaining: Vec<SnapshotId> = entry
                .snapshots
                .iter()
                .filter(|id| !snapshot_ids.contains(id))
                .cloned()
                .collect();
            if remaining.len() != entry.snapshots.len() {
                changed = true;
                updated.push(entry.with_snapshots(remaining));
            } else {
                updated.push(entry.clone());
            }
        } else {
            updated.push(entry.clone());
        }
    }
    changed.then(|| SnapshotDeletionsInProgress::of(updated))
}

/// Resolves delete-request names against the repository contents and the
/// given in-progress ids. Patterns match repository snapshots; a concrete
/// name matching nothing raises `SnapshotMissing`.
pub fn matching_snapshot_ids(
    in_progress: &[SnapshotId],
    repository_data: &RepositoryData,
    names: &[String],
    repository: &str,
) -> Result<Vec<SnapshotId>, SnapshotError> {
    let mut found: Vec<SnapshotId> = in_progress.to_vec();
    for name in names {
        if is_pattern(name) {
            for id in &repository_data.snapshots {
                if simple_match(name, &id.name) && !found.contains(id) {
                    found.push(id.clone());
                }
            }
        } else {
            match repository_data.snapshot_by_name(name) {
                Some(id) => {
                    if !found.contains(id) {
                        found.push(id.clone());
                    }
                }
                None => {
                    if !in_progress.iter().any(|id| &id.name == name) {
                        return Err(SnapshotError::missing(repository, name));
                    }
                }
            }
        }
    }
    Ok(found)
}

/// In-progress entries of the repository whose snapshot name matches any of
/// the given names or patterns.
pub fn find_in_progress_snapshots<'a>(
    snapshots: &'a SnapshotsInProgress,
    names: &[String],
    repository: &str,
) -> Vec<&'a SnapshotEntry> {
    snapshots
        .entries
        .iter()
        .filter(|entry| {
            entry.repository() == repository
                && simple_match_any(names, &entry.snapshot.id.name)
        })
        .collect()
}

/// Computes the snapshots section without the given snapshot's entry.
/// Returns `None` when the snapshot has no entry.
pub fn state_without_snapshot(
    snapshots: &SnapshotsInProgress,
    snapshot: &Snapshot,
) -> Option<SnapshotsInProgress> {
    if snapshots.entry(snapshot).is_none() {
        return None;
    }
    Some(SnapshotsInProgress::of(
        snapshots
            .entries
            .iter()
            .filter(|e| &e.snapshot != snapshot)
            .cloned()
            .collect(),
    ))
}

/// Result of unwinding a finished deletion from the cluster state.
#[derive(Debug, Default)]
pub struct DeleteRemovalOutcome {
    /// Updated snapshots section, or `None` when unchanged.
    pub snapshots: Option<SnapshotsInProgress>,
    /// Entries that can finalize now that the deletion no longer blocks them.
    pub new_finalizations: Vec<SnapshotEntry>,
}

/// Reassigns shards that were queued behind a removed deletion and collects
/// entries that became finalizable.
///
/// Each released shard is assigned to at most one entry, oldest first; younger
/// entries queued on the same shard stay queued behind the new holder.
pub fn unblock_entries_after_delete_removal(
    state: &ClusterState,
    removed: &DeletionEntry,
    updated_deletions: &SnapshotDeletionsInProgress,
    repository_data: &RepositoryData,
) -> DeleteRemovalOutcome {
    let mut outcome = DeleteRemovalOutcome::default();
    let repository = &removed.repository;
    let mut reassigned: BTreeSet<ShardId> = BTreeSet::new();
    let mut changed = false;
    let mut shard_assignments: Option<std::collections::BTreeMap<ShardId, ShardSnapshotStatus>> =
        None;
    let mut entries = Vec::with_capacity(state.snapshots.len());

    // Assignments must observe the deletions section with the entry already
    // removed, otherwise every shard would queue right back up.
    let assignment_state = {
        let mut s = state.clone();
        s.deletions = updated_deletions.clone();
        s
    };

    for entry in &state.snapshots.entries {
        if entry.repository() != repository {
            entries.push(entry.clone());
            continue;
        }
        if entry.state.completed() {
            // Completed while the delete blocked the repository; it can
            // finalize once this update is applied.
            outcome.new_finalizations.push(entry.clone());
            entries.push(entry.clone());
            continue;
        }
        let can_be_updated: Vec<ShardId> = entry
            .shards
            .iter()
            .filter(|(shard_id, status)| {
                status.is_unassigned_queued() && !reassigned.contains(*shard_id)
            })
            .map(|(shard_id, _)| shard_id.clone())
            .collect();
        if can_be_updated.is_empty() {
            entries.push(entry.clone());
            continue;
        }
        let assignments = shard_assignments.get_or_insert_with(|| {
            crate::assignment::compute_shard_assignments(
                &assignment_state,
                &entry.indices,
                entry
                    .repository_meta_version
                    .on_or_after(crate::types::PeerVersion::SHARD_GEN_IN_REPO_DATA),
                repository_data,
                repository,
            )
        });
        let mut updated_shards = entry.shards.clone();
        for shard_id in can_be_updated {
            match assignments.get(&shard_id) {
                None => {
                    // The index was deleted while the shard was queued.
                    updated_shards.insert(
                        shard_id,
                        ShardSnapshotStatus::missing("missing index", None),
                    );
                }
                Some(status) => {
                    reassigned.insert(shard_id.clone());
                    updated_shards.insert(shard_id, status.clone());
                }
            }
        }
        let updated = entry.with_shards(updated_shards);
        if updated.state.completed() {
            outcome.new_finalizations.push(updated.clone());
        }
        entries.push(updated);
        changed = true;
    }
    if changed {
        outcome.snapshots = Some(SnapshotsInProgress::of(entries));
    }
    outcome
}
