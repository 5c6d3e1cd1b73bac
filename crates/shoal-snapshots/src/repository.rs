//! Content-addressed snapshot repository driver.
//!
//! The engine consumes the [`Repository`] trait; the real blob-store driver
//! lives outside this crate. [`MemoryRepository`] is the reference driver used
//! by the test suites, with failpoints for exercising repository failures.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::SnapshotError;
use crate::types::{
    IndexId, NodeId, PeerVersion, RepoGeneration, RepositoryShardId, ShardGeneration, ShardId,
    SnapshotId,
};

/// Failure of a single shard recorded in a finalized snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardFailure {
    /// Node the shard was assigned to, if any.
    pub node: Option<NodeId>,
    /// The failed shard.
    pub shard: ShardId,
    /// Failure description.
    pub reason: String,
}

/// Terminal state of a finalized snapshot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotInfoState {
    /// Every shard succeeded.
    Success,
    /// Some shards failed but the snapshot holds usable data.
    Partial,
    /// No usable data was written.
    Failed,
}

/// Durable description of a finalized snapshot, written to the repository.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Identity of the snapshot.
    pub snapshot_id: SnapshotId,
    /// Names of the snapshotted indices.
    pub indices: Vec<String>,
    /// Names of the snapshotted data streams.
    pub data_streams: Vec<String>,
    /// Operation start, milliseconds since the epoch.
    pub start_time_ms: u64,
    /// Operation end, milliseconds since the epoch.
    pub end_time_ms: u64,
    /// Total shard count of the snapshot.
    pub total_shards: usize,
    /// Failed shards.
    pub failures: Vec<ShardFailure>,
    /// Whether cluster-wide metadata is included.
    pub include_global_state: bool,
    /// Opaque caller metadata.
    pub user_metadata: Option<serde_json::Value>,
    /// Entry-level failure, if the snapshot was aborted or failed.
    pub failure: Option<String>,
}

impl SnapshotInfo {
    /// Number of shards that completed successfully.
    pub fn successful_shards(&self) -> usize {
        self.total_shards - self.failures.len()
    }

    /// Terminal state derived from the failure counts.
    pub fn state(&self) -> SnapshotInfoState {
        if self.failures.is_empty() && self.failure.is_none() {
            SnapshotInfoState::Success
        } else if self.successful_shards() > 0 {
            SnapshotInfoState::Partial
        } else {
            SnapshotInfoState::Failed
        }
    }
}

/// The repository metadata blob: every snapshot the repository holds, index
/// membership, per-shard generations, and the generation id labeling this
/// version of the blob.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RepositoryData {
    /// Generation of this metadata version. Strictly increases with every
    /// finalized write.
    pub gen_id: RepoGeneration,
    /// All snapshots in the repository.
    pub snapshots: Vec<SnapshotId>,
    /// Repository metadata version each snapshot was written with, by uuid.
    pub versions: BTreeMap<String, PeerVersion>,
    /// Repository identity of every index touched by any snapshot, by name.
    pub indices: BTreeMap<String, IndexId>,
    /// Snapshot uuids per index repository id.
    pub index_snapshots: BTreeMap<String, Vec<String>>,
    /// Shard generations per index repository id and shard number.
    pub shard_generations: BTreeMap<String, BTreeMap<u32, ShardGeneration>>,
}

impl RepositoryData {
    /// Data of an empty repository.
    pub fn empty() -> Self {
        RepositoryData {
            gen_id: RepoGeneration::EMPTY,
            snapshots: Vec::new(),
            versions: BTreeMap::new(),
            indices: BTreeMap::new(),
            index_snapshots: BTreeMap::new(),
            shard_generations: BTreeMap::new(),
        }
    }

    /// True if a snapshot with the name exists.
    pub fn has_snapshot_name(&self, name: &str) -> bool {
        self.snapshots.iter().any(|s| s.name == name)
    }

    /// Finds a snapshot id by name.
    pub fn snapshot_by_name(&self, name: &str) -> Option<&SnapshotId> {
        self.snapshots.iter().find(|s| s.name == name)
    }

    /// True if any snapshot covers the index name.
    pub fn contains_index(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }

    /// Resolves index names to repository identities, preferring an identity
    /// already present in the repository, then one used by an in-flight
    /// operation, and minting a fresh identity otherwise.
    pub fn resolve_new_indices(
        &self,
        names: &[String],
        in_flight: &BTreeMap<String, IndexId>,
    ) -> Vec<IndexId> {
        names
            .iter()
            .map(|name| {
                self.indices
                    .get(name)
                    .or_else(|| in_flight.get(name))
                    .cloned()
                    .unwrap_or_else(|| IndexId::new(name.clone()))
            })
            .collect()
    }

    /// Repository identities of the indices a snapshot covers.
    pub fn indices_of_snapshot(&self, uuid: &str) -> Vec<IndexId> {
        let mut out: Vec<IndexId> = self
            .indices
            .values()
            .filter(|index| {
                self.index_snapshots
                    .get(&index.id)
                    .map(|s| s.iter().any(|u| u == uuid))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        out.sort();
        out
    }

    /// Latest generation of a shard in the repository, if any.
    pub fn shard_generation(&self, index: &IndexId, shard: u32) -> Option<&ShardGeneration> {
        self.shard_generations
            .get(&index.id)
            .and_then(|shards| shards.get(&shard))
    }
}

/// Everything needed to make a snapshot durable in one repository write.
#[derive(Clone, Debug)]
pub struct SnapshotFinalization {
    /// The snapshot description to persist.
    pub info: SnapshotInfo,
    /// Repository identities of the covered indices.
    pub indices: Vec<IndexId>,
    /// Shard count per index repository id, for later clone operations.
    pub shard_counts: BTreeMap<String, u32>,
    /// Updated shard generations to merge into the repository data.
    pub shard_generations: Vec<(IndexId, u32, ShardGeneration)>,
    /// Repository generation the write builds on.
    pub expected_gen: RepoGeneration,
    /// Repository metadata version to write with.
    pub repo_meta_version: PeerVersion,
}

/// Driver for one snapshot repository.
pub trait Repository: Send + Sync {
    /// Repository name.
    fn name(&self) -> &str;

    /// True if the repository rejects writes.
    fn read_only(&self) -> bool;

    /// Loads the current repository data blob.
    fn repository_data(&self) -> Result<RepositoryData, SnapshotError>;

    /// Loads the durable description of a snapshot.
    fn snapshot_info(&self, id: &SnapshotId) -> Result<SnapshotInfo, SnapshotError>;

    /// Shard count of an index within a snapshot, read from the snapshot's
    /// index metadata.
    fn snapshot_shard_count(
        &self,
        snapshot: &SnapshotId,
        index: &IndexId,
    ) -> Result<u32, SnapshotError>;

    /// Pre-registers a snapshot in the repository. Only used by clusters
    /// containing peers older than `NO_REPO_INITIALIZE`.
    fn initialize_snapshot(
        &self,
        id: &SnapshotId,
        indices: &[IndexId],
    ) -> Result<(), SnapshotError>;

    /// Writes the snapshot description plus updated repository data, making
    /// the snapshot durable and visible. Returns the new repository data.
    fn finalize_snapshot(
        &self,
        finalization: SnapshotFinalization,
    ) -> Result<RepositoryData, SnapshotError>;

    /// Deletes snapshots and rewrites repository data. Returns the new
    /// repository data.
    fn delete_snapshots(
        &self,
        ids: &[SnapshotId],
        expected_gen: RepoGeneration,
        repo_meta_version: PeerVersion,
    ) -> Result<RepositoryData, SnapshotError>;

    /// Clones one shard from a source snapshot into a target snapshot by
    /// referencing existing blobs. Returns the generation the target shard
    /// was written at.
    fn clone_shard_snapshot(
        &self,
        source: &SnapshotId,
        target: &SnapshotId,
        shard: &RepositoryShardId,
        generation: Option<&ShardGeneration>,
    ) -> Result<ShardGeneration, SnapshotError>;
}

#[derive(Default)]
struct MemoryRepositoryInner {
    data: RepositoryData,
    infos: BTreeMap<String, SnapshotInfo>,
    shard_counts: BTreeMap<(String, String), u32>,
    initialized: Vec<String>,
    cloned_shards: Vec<(String, RepositoryShardId)>,
    fail_next_repository_data: Option<String>,
    fail_next_finalize: Option<String>,
    fail_next_delete: Option<String>,
    read_only: bool,
}

impl Default for RepositoryData {
    fn default() -> Self {
        RepositoryData::empty()
    }
}

/// In-memory reference implementation of [`Repository`].
pub struct MemoryRepository {
    name: String,
    inner: Mutex<MemoryRepositoryInner>,
}

impl MemoryRepository {
    /// Creates an empty repository.
    pub fn new(name: impl Into<String>) -> Self {
        MemoryRepository {
            name: name.into(),
            inner: Mutex::new(MemoryRepositoryInner::default()),
        }
    }

    /// Marks the repository read-only or writable.
    pub fn set_read_only(&self, read_only: bool) {
        self.inner.lock().unwrap().read_only = read_only;
    }

    /// Fails the next `repository_data` call with a repository error.
    pub fn fail_next_repository_data(&self, reason: impl Into<String>) {
        self.inner.lock().unwrap().fail_next_repository_data = Some(reason.into());
    }

    /// Fails the next `finalize_snapshot` call with a repository error.
    pub fn fail_next_finalize(&self, reason: impl Into<String>) {
        self.inner.lock().unwrap().fail_next_finalize = Some(reason.into());
    }

    /// Fails the next `delete_snapshots` call with a repository error.
    pub fn fail_next_delete(&self, reason: impl Into<String>) {
        self.inner.lock().unwrap().fail_next_delete = Some(reason.into());
    }

    /// Snapshot uuids that were pre-registered through the legacy
    /// initialization path.
    pub fn initialized_snapshots(&self) -> Vec<String> {
        self.inner.lock().unwrap().initialized.clone()
    }

    /// Shards cloned so far, as `(target uuid, repository shard)` pairs.
    pub fn cloned_shards(&self) -> Vec<(String, RepositoryShardId)> {
        self.inner.lock().unwrap().cloned_shards.clone()
    }

    fn check_gen(
        &self,
        expected: RepoGeneration,
        actual: RepoGeneration,
    ) -> Result<(), SnapshotError> {
        if expected != actual {
            return Err(SnapshotError::repository(
                &self.name,
                format!(
                    "concurrent modification: expected generation [{}] but was [{}]",
                    expected, actual
                ),
            ));
        }
        Ok(())
    }
}

impl Repository for MemoryRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_only(&self) -> bool {
        self.inner.lock().unwrap().read_only
    }

    fn repository_data(&self) -> Result<RepositoryData, SnapshotError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(reason) = inner.fail_next_repository_data.take() {
            return Err(SnapshotError::repository(&self.name, reason));
        }
        Ok(inner.data.clone())
    }

    fn snapshot_info(&self, id: &SnapshotId) -> Result<SnapshotInfo, SnapshotError> {
        let inner = self.inner.lock().unwrap();
        inner
            .infos
            .get(&id.uuid)
            .cloned()
            .ok_or_else(|| SnapshotError::missing(&self.name, &id.name))
    }

    fn snapshot_shard_count(
        &self,
        snapshot: &SnapshotId,
        index: &IndexId,
    ) -> Result<u32, SnapshotError> {
        let inner = self.inner.lock().unwrap();
        inner
            .shard_counts
            .get(&(snapshot.uuid.clone(), index.id.clone()))
            .copied()
            .ok_or_else(|| {
                SnapshotError::snapshot(
                    &self.name,
                    &snapshot.name,
                    format!("no metadata for index {}", index),
                )
            })
    }

    fn initialize_snapshot(
        &self,
        id: &SnapshotId,
        _indices: &[IndexId],
    ) -> Result<(), SnapshotError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.read_only {
            return Err(SnapshotError::repository(&self.name, "repository is readonly"));
        }
        inner.initialized.push(id.uuid.clone());
        Ok(())
    }

    fn finalize_snapshot(
        &self,
        finalization: SnapshotFinalization,
    ) -> Result<RepositoryData, SnapshotError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(reason) = inner.fail_next_finalize.take() {
            return Err(SnapshotError::repository(&self.name, reason));
        }
        if inner.read_only {
            return Err(SnapshotError::repository(&self.name, "repository is readonly"));
        }
        self.check_gen(finalization.expected_gen, inner.data.gen_id)?;
        let uuid = finalization.info.snapshot_id.uuid.clone();
        if inner.infos.contains_key(&uuid) {
            // Already finalized; a previous attempt wrote the blobs but its
            // state publication failed. Content-addressed writes make the
            // retry a no-op.
            return Ok(inner.data.clone());
        }
        inner.data.snapshots.push(finalization.info.snapshot_id.clone());
        inner
            .data
            .versions
            .insert(uuid.clone(), finalization.repo_meta_version);
        for index in &finalization.indices {
            inner
                .data
                .indices
                .insert(index.name.clone(), index.clone());
            inner
                .data
                .index_snapshots
                .entry(index.id.clone())
                .or_default()
                .push(uuid.clone());
        }
        for (index, shard, generation) in &finalization.shard_generations {
            inner
                .data
                .shard_generations
                .entry(index.id.clone())
                .or_default()
                .insert(*shard, generation.clone());
        }
        for (index_id, count) in &finalization.shard_counts {
            inner
                .shard_counts
                .insert((uuid.clone(), index_id.clone()), *count);
        }
        inner.data.gen_id = inner.data.gen_id.next();
        inner.infos.insert(uuid, finalization.info);
        Ok(inner.data.clone())
    }

    fn delete_snapshots(
        &self,
        ids: &[SnapshotId],
        expected_gen: RepoGeneration,
        _repo_meta_version: PeerVersion,
    ) -> Result<RepositoryData, SnapshotError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(reason) = inner.fail_next_delete.take() {
            return Err(SnapshotError::repository(&self.name, reason));
        }
        self.check_gen(expected_gen, inner.data.gen_id)?;
        let uuids: Vec<String> = ids.iter().map(|id| id.uuid.clone()).collect();
        inner.data.snapshots.retain(|s| !uuids.contains(&s.uuid));
        for uuid in &uuids {
            inner.data.versions.remove(uuid);
            inner.infos.remove(uuid);
        }
        for members in inner.data.index_snapshots.values_mut() {
            members.retain(|u| !uuids.contains(u));
        }
        let dropped: Vec<String> = inner
            .data
            .index_snapshots
            .iter()
            .filter(|(_, members)| members.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        for index_id in &dropped {
            inner.data.index_snapshots.remove(index_id);
            inner.data.shard_generations.remove(index_id);
        }
        inner
            .data
            .indices
            .retain(|_, index| !dropped.contains(&index.id));
        inner
            .shard_counts
            .retain(|(uuid, _), _| !uuids.contains(uuid));
        inner.data.gen_id = inner.data.gen_id.next();
        Ok(inner.data.clone())
    }

    fn clone_shard_snapshot(
        &self,
        source: &SnapshotId,
        target: &SnapshotId,
        shard: &RepositoryShardId,
        _generation: Option<&ShardGeneration>,
    ) -> Result<ShardGeneration, SnapshotError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.infos.contains_key(&source.uuid) {
            return Err(SnapshotError::missing(&self.name, &source.name));
        }
        inner
            .cloned_shards
            .push((target.uuid.clone(), shard.clone()));
        Ok(ShardGeneration::random())
    }
}
