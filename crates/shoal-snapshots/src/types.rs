//! Core identity and state types shared across the snapshot engine.
//!
//! Everything here is part of the consensus-replicated cluster-state document
//! or of repository metadata, so all types carry serde derives.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier of a cluster node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Creates a new NodeId from a raw u64 value.
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }

    /// Returns the raw u64 value of this node ID.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        NodeId(0)
    }
}

/// Protocol version of a cluster peer, used to gate engine behavior on the
/// minimum version present in the cluster.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerVersion(u32);

impl PeerVersion {
    /// First version writing per-shard generations into repository data.
    pub const SHARD_GEN_IN_REPO_DATA: PeerVersion = PeerVersion(4);
    /// First version that no longer pre-initializes snapshots in the
    /// repository before starting them.
    pub const NO_REPO_INITIALIZE: PeerVersion = PeerVersion(5);
    /// First version accepting multiple snapshot names in one delete request.
    pub const MULTI_DELETE: PeerVersion = PeerVersion(6);
    /// First version supporting concurrent snapshot and deletion operations.
    pub const FULL_CONCURRENCY: PeerVersion = PeerVersion(7);
    /// First version supporting snapshot clones.
    pub const CLONE_SNAPSHOT: PeerVersion = PeerVersion(8);
    /// The version of this node.
    pub const CURRENT: PeerVersion = PeerVersion(8);

    /// Creates a version from its raw protocol number.
    pub fn new(v: u32) -> Self {
        PeerVersion(v)
    }

    /// Returns the raw protocol number.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// True if this version is the same as or newer than `other`.
    pub fn on_or_after(&self, other: PeerVersion) -> bool {
        self.0 >= other.0
    }

    /// True if this version is strictly older than `other`.
    pub fn before(&self, other: PeerVersion) -> bool {
        self.0 < other.0
    }
}

impl fmt::Display for PeerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl Default for PeerVersion {
    fn default() -> Self {
        PeerVersion::CURRENT
    }
}

/// Generation number labeling a version of the repository data blob. Strictly
/// increases with every finalized repository write.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoGeneration(i64);

impl RepoGeneration {
    /// Sentinel for an unknown generation (legacy entries admitted by an old
    /// cluster-manager before the repository was read).
    pub const UNKNOWN: RepoGeneration = RepoGeneration(-2);
    /// Generation of an empty, never-written repository.
    pub const EMPTY: RepoGeneration = RepoGeneration(-1);

    /// Creates a generation from a raw value.
    pub fn new(g: i64) -> Self {
        RepoGeneration(g)
    }

    /// Returns the raw value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// The generation following this one.
    pub fn next(&self) -> RepoGeneration {
        RepoGeneration(self.0 + 1)
    }
}

impl fmt::Display for RepoGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-shard version tag in repository metadata, enabling incremental shard
/// writes across snapshots.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardGeneration(String);

impl ShardGeneration {
    /// Sentinel for the first shard snapshot of an index that is new to the
    /// repository.
    pub const NEW_SHARD_GEN: &'static str = "_new";

    /// Creates a generation from its raw string form.
    pub fn new(g: impl Into<String>) -> Self {
        ShardGeneration(g.into())
    }

    /// The sentinel generation for a shard of a new index.
    pub fn new_shard() -> Self {
        ShardGeneration(Self::NEW_SHARD_GEN.to_string())
    }

    /// Generates a fresh random generation.
    pub fn random() -> Self {
        ShardGeneration(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a snapshot within a repository: a user-visible name plus a
/// globally unique uuid.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId {
    /// User-visible snapshot name, unique per repository.
    pub name: String,
    /// Globally unique identifier.
    pub uuid: String,
}

impl SnapshotId {
    /// Creates a snapshot id with a fresh random uuid.
    pub fn new(name: impl Into<String>) -> Self {
        SnapshotId {
            name: name.into(),
            uuid: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Creates a snapshot id with an explicit uuid.
    pub fn with_uuid(name: impl Into<String>, uuid: impl Into<String>) -> Self {
        SnapshotId {
            name: name.into(),
            uuid: uuid.into(),
        }
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.uuid)
    }
}

/// A snapshot bound to its repository.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Snapshot {
    /// Name of the repository holding the snapshot.
    pub repository: String,
    /// The snapshot identity inside the repository.
    pub id: SnapshotId,
}

impl Snapshot {
    /// Creates a snapshot reference.
    pub fn new(repository: impl Into<String>, id: SnapshotId) -> Self {
        Snapshot {
            repository: repository.into(),
            id,
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.id)
    }
}

/// Repository-persistent identity of an index: the runtime index name plus a
/// repository-unique id that survives delete/recreate cycles.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexId {
    /// Runtime index name.
    pub name: String,
    /// Repository-unique identifier.
    pub id: String,
}

impl IndexId {
    /// Creates an index id with a fresh random repository id.
    pub fn new(name: impl Into<String>) -> Self {
        IndexId {
            name: name.into(),
            id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Creates an index id with an explicit repository id.
    pub fn with_id(name: impl Into<String>, id: impl Into<String>) -> Self {
        IndexId {
            name: name.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}]", self.name, self.id)
    }
}

/// Runtime routing coordinate of a shard.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    /// Index the shard belongs to.
    pub index: String,
    /// Shard number within the index.
    pub shard: u32,
}

impl ShardId {
    /// Creates a shard id.
    pub fn new(index: impl Into<String>, shard: u32) -> Self {
        ShardId {
            index: index.into(),
            shard,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index, self.shard)
    }
}

/// Repository-persistent coordinate of a shard: an [`IndexId`] plus the shard
/// number. Used by clone operations, which act on repository contents rather
/// than on routed shards.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepositoryShardId {
    /// Repository identity of the index.
    pub index: IndexId,
    /// Shard number within the index.
    pub shard: u32,
}

impl RepositoryShardId {
    /// Creates a repository shard id.
    pub fn new(index: IndexId, shard: u32) -> Self {
        RepositoryShardId { index, shard }
    }

    /// Runtime name of the index this shard belongs to.
    pub fn index_name(&self) -> &str {
        &self.index.name
    }
}

impl fmt::Display for RepositoryShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.index, self.shard)
    }
}

/// State of one shard within an in-progress snapshot entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardState {
    /// Snapshot work for the shard has been assigned and may be running.
    Init,
    /// The primary is relocating or initializing; waiting for it to start.
    Waiting,
    /// Another operation holds the shard; queued until it is released.
    Queued,
    /// Shard snapshot completed successfully.
    Success,
    /// Shard snapshot failed.
    Failed,
    /// The shard could not be snapshotted at all.
    Missing,
    /// Shard snapshot was aborted by a deletion.
    Aborted,
    /// Shard snapshot paused because its node is being removed.
    PausedForNodeRemoval,
}

impl ShardState {
    /// True once no further updates for the shard are expected.
    pub fn completed(&self) -> bool {
        matches!(
            self,
            ShardState::Success | ShardState::Failed | ShardState::Missing
        )
    }

    /// True while the shard may be writing to the repository.
    pub fn active(&self) -> bool {
        matches!(self, ShardState::Init | ShardState::Aborted)
    }

    /// True for terminal failure states.
    pub fn failed(&self) -> bool {
        matches!(self, ShardState::Failed)
    }
}

/// Snapshot status of a single shard inside an in-progress entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSnapshotStatus {
    /// Node assigned to execute the shard snapshot, if any.
    pub node: Option<NodeId>,
    /// Current shard state.
    pub state: ShardState,
    /// Repository shard generation the work builds on.
    pub generation: Option<ShardGeneration>,
    /// Failure reason for terminal failure states.
    pub reason: Option<String>,
}

impl ShardSnapshotStatus {
    /// A shard actively assigned to a node.
    pub fn init(node: Option<NodeId>, generation: Option<ShardGeneration>) -> Self {
        ShardSnapshotStatus {
            node,
            state: ShardState::Init,
            generation,
            reason: None,
        }
    }

    /// A shard waiting for its primary to start or finish relocating.
    pub fn waiting(node: Option<NodeId>, generation: Option<ShardGeneration>) -> Self {
        ShardSnapshotStatus {
            node,
            state: ShardState::Waiting,
            generation,
            reason: None,
        }
    }

    /// A shard that cannot be snapshotted, with the reason why.
    pub fn missing(reason: impl Into<String>, generation: Option<ShardGeneration>) -> Self {
        ShardSnapshotStatus {
            node: None,
            state: ShardState::Missing,
            generation,
            reason: Some(reason.into()),
        }
    }

    /// A shard that failed, keeping its last known node assignment.
    pub fn failed(
        node: Option<NodeId>,
        reason: impl Into<String>,
        generation: Option<ShardGeneration>,
    ) -> Self {
        ShardSnapshotStatus {
            node,
            state: ShardState::Failed,
            generation,
            reason: Some(reason.into()),
        }
    }

    /// A shard that completed successfully with the generation it wrote.
    pub fn success(node: Option<NodeId>, generation: ShardGeneration) -> Self {
        ShardSnapshotStatus {
            node,
            state: ShardState::Success,
            generation: Some(generation),
            reason: None,
        }
    }

    /// The sentinel status for a shard held by another operation. The shard
    /// must wait until the holder releases it.
    pub fn unassigned_queued() -> Self {
        ShardSnapshotStatus {
            node: None,
            state: ShardState::Queued,
            generation: None,
            reason: None,
        }
    }

    /// True if this is the [`unassigned_queued`](Self::unassigned_queued)
    /// sentinel.
    pub fn is_unassigned_queued(&self) -> bool {
        self.state == ShardState::Queued && self.node.is_none()
    }

    /// True while the shard may be writing to the repository.
    pub fn is_active(&self) -> bool {
        self.state.active()
    }
}

/// State of an in-progress snapshot entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotState {
    /// Entry admitted but shards not yet assigned (legacy path only).
    Init,
    /// Shards assigned; data nodes are executing.
    Started,
    /// All shards reached a completed state.
    Success,
    /// The entry failed as a whole.
    Failed,
    /// The entry was aborted and is draining its remaining shard work.
    Aborted,
}

impl SnapshotState {
    /// True once the entry requires no further shard updates.
    pub fn completed(&self) -> bool {
        matches!(self, SnapshotState::Success | SnapshotState::Failed)
    }
}

/// State of an in-progress deletion entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionState {
    /// Admitted but blocked by an in-flight write to the same repository.
    Waiting,
    /// Executing against the repository.
    Started,
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time before epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_version_ordering() {
        assert!(PeerVersion::SHARD_GEN_IN_REPO_DATA < PeerVersion::NO_REPO_INITIALIZE);
        assert!(PeerVersion::NO_REPO_INITIALIZE < PeerVersion::MULTI_DELETE);
        assert!(PeerVersion::MULTI_DELETE < PeerVersion::FULL_CONCURRENCY);
        assert!(PeerVersion::FULL_CONCURRENCY < PeerVersion::CLONE_SNAPSHOT);
        assert!(PeerVersion::CURRENT.on_or_after(PeerVersion::CLONE_SNAPSHOT));
    }

    #[test]
    fn test_peer_version_comparisons() {
        let old = PeerVersion::new(6);
        assert!(old.before(PeerVersion::FULL_CONCURRENCY));
        assert!(!old.on_or_after(PeerVersion::FULL_CONCURRENCY));
        assert!(PeerVersion::FULL_CONCURRENCY.on_or_after(PeerVersion::FULL_CONCURRENCY));
    }

    #[test]
    fn test_repo_generation_next() {
        assert_eq!(RepoGeneration::EMPTY.next(), RepoGeneration::new(0));
        assert_eq!(RepoGeneration::new(41).next().as_i64(), 42);
    }

    #[test]
    fn test_shard_state_completed() {
        assert!(ShardState::Success.completed());
        assert!(ShardState::Failed.completed());
        assert!(ShardState::Missing.completed());
        assert!(!ShardState::Init.completed());
        assert!(!ShardState::Waiting.completed());
        assert!(!ShardState::Queued.completed());
        assert!(!ShardState::Aborted.completed());
        assert!(!ShardState::PausedForNodeRemoval.completed());
    }

    #[test]
    fn test_shard_state_active() {
        assert!(ShardState::Init.active());
        assert!(ShardState::Aborted.active());
        assert!(!ShardState::Queued.active());
        assert!(!ShardState::Waiting.active());
        assert!(!ShardState::PausedForNodeRemoval.active());
    }

    #[test]
    fn test_unassigned_queued_sentinel() {
        let status = ShardSnapshotStatus::unassigned_queued();
        assert!(status.is_unassigned_queued());
        assert!(status.node.is_none());
        assert!(status.generation.is_none());
        let assigned = ShardSnapshotStatus::init(Some(NodeId::new(1)), None);
        assert!(!assigned.is_unassigned_queued());
    }

    #[test]
    fn test_snapshot_state_completed() {
        assert!(SnapshotState::Success.completed());
        assert!(SnapshotState::Failed.completed());
        assert!(!SnapshotState::Started.completed());
        assert!(!SnapshotState::Aborted.completed());
        assert!(!SnapshotState::Init.completed());
    }

    #[test]
    fn test_snapshot_id_uuid_unique() {
        let a = SnapshotId::new("snap");
        let b = SnapshotId::new("snap");
        assert_eq!(a.name, b.name);
        assert_ne!(a.uuid, b.uuid);
    }

    #[test]
    fn test_display_forms() {
        let snapshot = Snapshot::new("repo", SnapshotId::with_uuid("s1", "u1"));
        assert_eq!(format!("{}", snapshot), "repo:s1/u1");
        let shard = ShardId::new("idx", 3);
        assert_eq!(format!("{}", shard), "[idx][3]");
        let repo_shard = RepositoryShardId::new(IndexId::with_id("idx", "iid"), 2);
        assert_eq!(format!("{}", repo_shard), "[idx/iid][2]");
    }

    #[test]
    fn test_shard_generation_sentinel() {
        assert_eq!(ShardGeneration::new_shard().as_str(), "_new");
        assert_ne!(ShardGeneration::random(), ShardGeneration::random());
    }
}
