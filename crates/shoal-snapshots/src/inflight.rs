//! Tracking of shards held by in-flight operations of one repository.

use std::collections::{BTreeMap, BTreeSet};

use crate::entries::SnapshotEntry;
use crate::repository::RepositoryData;
use crate::types::{IndexId, ShardGeneration, ShardState};

/// Which shards of a repository are busy with snapshot work, and the latest
/// shard generation produced by any in-flight operation. Derived from the
/// current `SnapshotsInProgress` entries; used to queue newly admitted work
/// behind the holder and to chain shard generations across operations.
#[derive(Debug, Default)]
pub struct InFlightShardStates {
    active: BTreeSet<(String, u32)>,
    generations: BTreeMap<(String, u32), ShardGeneration>,
}

impl InFlightShardStates {
    /// Collects in-flight shard state for one repository.
    pub fn for_repo<'a>(
        repository: &str,
        entries: impl IntoIterator<Item = &'a SnapshotEntry>,
    ) -> Self {
        let mut states = InFlightShardStates::default();
        for entry in entries {
            if entry.repository() != repository {
                continue;
            }
            if entry.is_clone() {
                for (repo_shard, status) in &entry.clones {
                    states.observe(
                        repo_shard.index_name(),
                        repo_shard.shard,
                        status.state,
                        status.generation.as_ref(),
                    );
                }
            } else {
                for (shard_id, status) in &entry.shards {
                    states.observe(
                        &shard_id.index,
                        shard_id.shard,
                        status.state,
                        status.generation.as_ref(),
                    );
                }
            }
        }
        states
    }

    fn observe(
        &mut self,
        index: &str,
        shard: u32,
        state: ShardState,
        generation: Option<&ShardGeneration>,
    ) {
        let key = (index.to_string(), shard);
        if state.active() {
            self.active.insert(key);
        } else if state == ShardState::Success {
            if let Some(generation) = generation {
                // Later entries overwrite earlier ones, leaving the newest
                // successful generation.
                self.generations.insert(key, generation.clone());
            }
        }
    }

    /// True if some in-flight operation is actively writing the shard.
    pub fn is_active(&self, index: &str, shard: u32) -> bool {
        self.active.contains(&(index.to_string(), shard))
    }

    /// Latest known generation for a shard: the newest successful in-flight
    /// write, falling back to the repository data.
    pub fn generation_for_shard(
        &self,
        index: &IndexId,
        shard: u32,
        repository_data: &RepositoryData,
    ) -> Option<ShardGeneration> {
        self.generations
            .get(&(index.name.clone(), shard))
            .cloned()
            .or_else(|| repository_data.shard_generation(index, shard).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        NodeId, PeerVersion, RepoGeneration, ShardId, ShardSnapshotStatus, Snapshot, SnapshotId,
    };

    fn entry(repo: &str, shards: Vec<(ShardId, ShardSnapshotStatus)>) -> SnapshotEntry {
        SnapshotEntry::started(
            Snapshot::new(repo, SnapshotId::new("s")),
            false,
            false,
            vec![IndexId::with_id("idx", "iid")],
            vec![],
            0,
            RepoGeneration::new(0),
            shards.into_iter().collect(),
            None,
            PeerVersion::CURRENT,
        )
    }

    #[test]
    fn test_active_shard_tracked() {
        let entries = vec![entry(
            "repo",
            vec![(
                ShardId::new("idx", 0),
                ShardSnapshotStatus::init(Some(NodeId::new(1)), None),
            )],
        )];
        let states = InFlightShardStates::for_repo("repo", &entries);
        assert!(states.is_active("idx", 0));
        assert!(!states.is_active("idx", 1));
    }

    #[test]
    fn test_other_repo_ignored() {
        let entries = vec![entry(
            "other",
            vec![(
                ShardId::new("idx", 0),
                ShardSnapshotStatus::init(Some(NodeId::new(1)), None),
            )],
        )];
        let states = InFlightShardStates::for_repo("repo", &entries);
        assert!(!states.is_active("idx", 0));
    }

    #[test]
    fn test_successful_generation_preferred_over_repo_data() {
        let gen = ShardGeneration::new("inflight-gen");
        let entries = vec![entry(
            "repo",
            vec![(
                ShardId::new("idx", 0),
                ShardSnapshotStatus::success(Some(NodeId::new(1)), gen.clone()),
            )],
        )];
        let states = InFlightShardStates::for_repo("repo", &entries);
        let index = IndexId::with_id("idx", "iid");
        let mut data = RepositoryData::empty();
        data.shard_generations
            .entry("iid".to_string())
            .or_default()
            .insert(0, ShardGeneration::new("repo-gen"));
        assert_eq!(states.generation_for_shard(&index, 0, &data), Some(gen));
        assert_eq!(
            states.generation_for_shard(&index, 1, &data),
            None
        );
        assert_eq!(
            states
                .generation_for_shard(&index, 0, &RepositoryData::empty())
                .unwrap()
                .as_str(),
            "inflight-gen"
        );
    }

    #[test]
    fn test_repo_data_fallback() {
        let entries: Vec<SnapshotEntry> = Vec::new();
        let states = InFlightShardStates::for_repo("repo", &entries);
        let index = IndexId::with_id("idx", "iid");
        let mut data = RepositoryData::empty();
        data.shard_generations
            .entry("iid".to_string())
            .or_default()
            .insert(0, ShardGeneration::new("repo-gen"));
        assert_eq!(
            states.generation_for_shard(&index, 0, &data).unwrap().as_str(),
            "repo-gen"
        );
    }

    #[test]
    fn test_waiting_shard_not_active() {
        let entries = vec![entry(
            "repo",
            vec![(
                ShardId::new("idx", 0),
                ShardSnapshotStatus::waiting(Some(NodeId::new(1)), None),
            )],
        )];
        let states = InFlightShardStates::for_repo("repo", &entries);
        assert!(!states.is_active("idx", 0));
    }
}
