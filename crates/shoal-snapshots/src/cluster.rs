//! Cluster-state document model.
//!
//! The engine runs on the elected cluster-manager and treats the replicated
//! cluster state as the single source of truth for in-flight work. This
//! module models the slice of that document the snapshot engine reads:
//! node membership, index metadata, primary routing, and the two snapshot
//! custom sections.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::entries::{SnapshotDeletionsInProgress, SnapshotsInProgress};
use crate::types::{NodeId, PeerVersion, Snapshot};
use crate::validate::simple_match;

/// Metadata of one index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Index name.
    pub name: String,
    /// Runtime uuid of the index.
    pub uuid: String,
    /// Number of primary shards.
    pub shard_count: u32,
    /// False when the index is closed.
    pub open: bool,
}

impl IndexMetadata {
    /// Creates metadata for an open index.
    pub fn new(name: impl Into<String>, shard_count: u32) -> Self {
        IndexMetadata {
            name: name.into(),
            uuid: uuid::Uuid::new_v4().to_string(),
            shard_count,
            open: true,
        }
    }
}

/// Cluster metadata: indices and data streams.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Index metadata keyed by index name.
    pub indices: BTreeMap<String, IndexMetadata>,
    /// Data streams keyed by name, each mapping to its backing indices.
    pub data_streams: BTreeMap<String, Vec<String>>,
}

impl Metadata {
    /// Resolves index patterns to concrete index names and matched data
    /// streams. A matched data stream contributes its backing indices. Empty
    /// patterns, `_all`, and `*` match everything.
    pub fn resolve(&self, patterns: &[String]) -> (Vec<String>, Vec<String>) {
        let match_all = patterns.is_empty()
            || patterns.iter().any(|p| p == "_all" || p == "*");
        let mut indices = BTreeSet::new();
        let mut streams = Vec::new();
        for (name, backing) in &self.data_streams {
            let matched = match_all || patterns.iter().any(|p| simple_match(p, name));
            if matched {
                streams.push(name.clone());
                for index in backing {
                    if self.indices.contains_key(index) {
                        indices.insert(index.clone());
                    }
                }
            }
        }
        for name in self.indices.keys() {
            if match_all || patterns.iter().any(|p| simple_match(p, name)) {
                indices.insert(name.clone());
            }
        }
        (indices.into_iter().collect(), streams)
    }
}

/// Allocation state of a primary shard.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrimaryState {
    /// Not allocated to any node.
    Unassigned,
    /// Recovering on a node.
    Initializing,
    /// Moving between nodes.
    Relocating,
    /// Serving traffic.
    Started,
}

/// Routing of one primary shard.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardRouting {
    /// Allocation state.
    pub state: PrimaryState,
    /// Node currently hosting the primary, if assigned.
    pub node: Option<NodeId>,
}

impl ShardRouting {
    /// An unassigned primary.
    pub fn unassigned() -> Self {
        ShardRouting {
            state: PrimaryState::Unassigned,
            node: None,
        }
    }

    /// A started primary on the given node.
    pub fn started(node: NodeId) -> Self {
        ShardRouting {
            state: PrimaryState::Started,
            node: Some(node),
        }
    }

    /// An initializing primary on the given node.
    pub fn initializing(node: NodeId) -> Self {
        ShardRouting {
            state: PrimaryState::Initializing,
            node: Some(node),
        }
    }

    /// A relocating primary, still served from the given node.
    pub fn relocating(node: NodeId) -> Self {
        ShardRouting {
            state: PrimaryState::Relocating,
            node: Some(node),
        }
    }

    /// True if the primary is assigned to a node.
    pub fn assigned(&self) -> bool {
        self.node.is_some() && self.state != PrimaryState::Unassigned
    }

    /// True if the primary is started.
    pub fn is_started(&self) -> bool {
        self.state == PrimaryState::Started
    }

    /// True if the primary is initializing or relocating.
    pub fn initializing_or_relocating(&self) -> bool {
        matches!(
            self.state,
            PrimaryState::Initializing | PrimaryState::Relocating
        )
    }
}

/// Primary shard routing for all indices.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingTable {
    /// Primary routing per index, indexed by shard number.
    pub indices: BTreeMap<String, Vec<ShardRouting>>,
}

impl RoutingTable {
    /// Looks up the primary routing of a shard.
    pub fn primary(&self, index: &str, shard: u32) -> Option<&ShardRouting> {
        self.indices.get(index).and_then(|s| s.get(shard as usize))
    }

    /// True if the index has any routing entries.
    pub fn has_index(&self, index: &str) -> bool {
        self.indices.contains_key(index)
    }
}

/// The slice of the replicated cluster-state document the engine operates on.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Monotonic version of the applied state.
    pub version: u64,
    /// This node.
    pub local_node: NodeId,
    /// The elected cluster-manager, if any.
    pub cluster_manager: Option<NodeId>,
    /// Live cluster nodes.
    pub nodes: BTreeSet<NodeId>,
    /// Minimum protocol version across cluster peers.
    pub min_peer_version: PeerVersion,
    /// Index and data stream metadata.
    pub metadata: Metadata,
    /// Primary shard routing.
    pub routing: RoutingTable,
    /// In-flight snapshot creates and clones.
    pub snapshots: SnapshotsInProgress,
    /// In-flight snapshot deletions.
    pub deletions: SnapshotDeletionsInProgress,
    /// Repositories with a cleanup in progress.
    pub cleanups_in_progress: BTreeSet<String>,
    /// Snapshots currently being restored.
    pub restores_in_progress: Vec<Snapshot>,
}

impl ClusterState {
    /// True if this node is the elected cluster-manager.
    pub fn is_local_cluster_manager(&self) -> bool {
        self.cluster_manager == Some(self.local_node)
    }

    /// True if the node is part of the cluster.
    pub fn node_exists(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }

    /// Returns a copy with the snapshots section replaced.
    pub fn with_snapshots(&self, snapshots: SnapshotsInProgress) -> Self {
        let mut updated = self.clone();
        updated.snapshots = snapshots;
        updated
    }

    /// Returns a copy with either custom section replaced; `None` keeps the
    /// current value.
    pub fn with_updates(
        &self,
        snapshots: Option<SnapshotsInProgress>,
        deletions: Option<SnapshotDeletionsInProgress>,
    ) -> Self {
        let mut updated = self.clone();
        if let Some(snapshots) = snapshots {
            updated.snapshots = snapshots;
        }
        if let Some(deletions) = deletions {
            updated.deletions = deletions;
        }
        updated
    }
}

/// An applied cluster-state change: the previous and the newly applied state.
#[derive(Clone, Debug)]
pub struct ClusterChangedEvent {
    /// State before the change.
    pub previous: Arc<ClusterState>,
    /// State after the change.
    pub current: Arc<ClusterState>,
}

impl ClusterChangedEvent {
    /// Nodes present in the previous state but gone from the current one.
    pub fn removed_nodes(&self) -> Vec<NodeId> {
        self.previous
            .nodes
            .iter()
            .filter(|n| !self.current.nodes.contains(n))
            .copied()
            .collect()
    }

    /// True if the routing table changed at all.
    pub fn routing_changed(&self) -> bool {
        self.previous.routing != self.current.routing
    }

    /// True if the routing entries of the given index changed.
    pub fn index_routing_changed(&self, index: &str) -> bool {
        self.previous.routing.indices.get(index) != self.current.routing.indices.get(index)
    }

    /// True if the local node is the cluster-manager in the current state.
    pub fn local_node_cluster_manager(&self) -> bool {
        self.current.is_local_cluster_manager()
    }

    /// True if the local node just became cluster-manager with this change.
    pub fn new_cluster_manager(&self) -> bool {
        self.current.is_local_cluster_manager() && !self.previous.is_local_cluster_manager()
    }
}
