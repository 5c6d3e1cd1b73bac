//! Deterministic single-process cluster harness.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use shoal_snapshots::bus::{ClusterStateBus, UpdateTask};
use shoal_snapshots::cluster::{ClusterState, IndexMetadata, ShardRouting};
use shoal_snapshots::engine::SnapshotEngine;
use shoal_snapshots::error::SnapshotError;
use shoal_snapshots::executor::ShardSnapshotUpdate;
use shoal_snapshots::repository::MemoryRepository;
use shoal_snapshots::settings::SnapshotSettings;
use shoal_snapshots::types::{
    NodeId, PeerVersion, ShardGeneration, ShardId, ShardSnapshotStatus, Snapshot,
};

/// Node id of the engine's (cluster-manager) node.
pub const LOCAL_NODE: u64 = 1;

/// An engine wired to an in-process bus, three cluster nodes, and in-memory
/// repositories. Every call drains the update queue before returning, so
/// assertions observe settled state.
pub struct TestCluster {
    /// The cluster-state bus.
    pub bus: Arc<ClusterStateBus>,
    /// The engine under test.
    pub engine: Arc<SnapshotEngine>,
    repositories: BTreeMap<String, Arc<MemoryRepository>>,
}

impl TestCluster {
    /// Cluster with default settings and current-version peers.
    pub fn new() -> Self {
        Self::with_config(SnapshotSettings::default(), PeerVersion::CURRENT)
    }

    /// Cluster with old peers, forcing the legacy code paths.
    pub fn with_min_peer_version(version: PeerVersion) -> Self {
        Self::with_config(SnapshotSettings::default(), version)
    }

    /// Cluster with explicit settings and peer version.
    pub fn with_config(settings: SnapshotSettings, min_peer_version: PeerVersion) -> Self {
        let mut state = ClusterState::default();
        state.local_node = NodeId::new(LOCAL_NODE);
        state.cluster_manager = Some(NodeId::new(LOCAL_NODE));
        state.nodes = [1, 2, 3].map(NodeId::new).into();
        state.min_peer_version = min_peer_version;
        let bus = ClusterStateBus::new(state);
        let engine = SnapshotEngine::new(bus.clone(), settings);
        TestCluster {
            bus,
            engine,
            repositories: BTreeMap::new(),
        }
    }

    /// Registers an in-memory repository and returns a handle for failure
    /// injection and content assertions.
    pub fn add_repository(&mut self, name: &str) -> Arc<MemoryRepository> {
        let repository = Arc::new(MemoryRepository::new(name));
        self.engine.register_repository(repository.clone());
        self.repositories.insert(name.to_string(), repository.clone());
        repository
    }

    /// Handle to a registered repository.
    pub fn repository(&self, name: &str) -> Arc<MemoryRepository> {
        self.repositories[name].clone()
    }

    /// The latest applied cluster state.
    pub fn state(&self) -> Arc<ClusterState> {
        self.bus.state()
    }

    fn submit(&self, source: &str, mutate: impl FnOnce(&mut ClusterState) + Send + 'static) {
        self.bus.submit_update(UpdateTask::new(source, move |current| {
            let mut next = current.clone();
            mutate(&mut next);
            Ok(next)
        }));
    }

    /// Adds an open index with one started primary per listed node.
    pub fn add_index(&self, name: &str, primary_nodes: &[u64]) {
        let name = name.to_string();
        let nodes = primary_nodes.to_vec();
        self.submit("add index", move |state| {
            let mut meta = IndexMetadata::new(name.clone(), nodes.len() as u32);
            meta.open = true;
            state.metadata.indices.insert(name.clone(), meta);
            state.routing.indices.insert(
                name,
                nodes
                    .iter()
                    .map(|n| ShardRouting::started(NodeId::new(*n)))
                    .collect(),
            );
        });
    }

    /// Replaces the routing of an index.
    pub fn set_routing(&self, index: &str, routing: Vec<ShardRouting>) {
        let index = index.to_string();
        self.submit("reroute", move |state| {
            state.routing.indices.insert(index, routing);
        });
    }

    /// Removes a node from the cluster and unassigns its primaries.
    pub fn remove_node(&self, node: u64) {
        self.submit("node left", move |state| {
            state.nodes.remove(&NodeId::new(node));
            for routing in state.routing.indices.values_mut() {
                for shard in routing.iter_mut() {
                    if shard.node == Some(NodeId::new(node)) {
                        *shard = ShardRouting::unassigned();
                    }
                }
            }
        });
    }

    /// Moves the elected cluster-manager role.
    pub fn set_cluster_manager(&self, node: Option<u64>) {
        self.submit("cluster-manager change", move |state| {
            state.cluster_manager = node.map(NodeId::new);
        });
    }

    /// The in-progress entry handle for a snapshot name, if present.
    pub fn snapshot_handle(&self, repository: &str, name: &str) -> Option<Snapshot> {
        self.state()
            .snapshots
            .entries
            .iter()
            .find(|e| e.repository() == repository && e.snapshot.id.name == name)
            .map(|e| e.snapshot.clone())
    }

    /// Reports a successful shard snapshot from a data node.
    pub fn shard_success(&self, snapshot: &Snapshot, index: &str, shard: u32, node: u64, generation: &str) {
        self.engine.inner_update_snapshot_state(
            ShardSnapshotUpdate::shard(
                snapshot.clone(),
                ShardId::new(index, shard),
                ShardSnapshotStatus::success(Some(NodeId::new(node)), ShardGeneration::new(generation)),
            ),
            Box::new(|_| {}),
        );
    }

    /// Reports a failed shard snapshot from a data node.
    pub fn shard_failed(&self, snapshot: &Snapshot, index: &str, shard: u32, node: u64, reason: &str) {
        self.engine.inner_update_snapshot_state(
            ShardSnapshotUpdate::shard(
                snapshot.clone(),
                ShardId::new(index, shard),
                ShardSnapshotStatus::failed(Some(NodeId::new(node)), reason, None),
            ),
            Box::new(|_| {}),
        );
    }
}

/// Captures the asynchronous result handed to an engine listener.
pub struct Captured<T>(Arc<Mutex<Option<Result<T, SnapshotError>>>>);

impl<T: Send + 'static> Captured<T> {
    /// An empty capture slot.
    pub fn new() -> Self {
        Captured(Arc::new(Mutex::new(None)))
    }

    /// A listener writing into this slot.
    pub fn listener(&self) -> Box<dyn FnOnce(Result<T, SnapshotError>) + Send> {
        let slot = self.0.clone();
        Box::new(move |result| {
            let previous = slot.lock().unwrap().replace(result);
            assert!(previous.is_none(), "listener resolved twice");
        })
    }

    /// True once the listener was invoked.
    pub fn is_resolved(&self) -> bool {
        self.0.lock().unwrap().is_some()
    }

    /// Takes the captured result, panicking if the listener never ran.
    pub fn take(&self) -> Result<T, SnapshotError> {
        self.0
            .lock()
            .unwrap()
            .take()
            .expect("listener was not resolved")
    }

    /// Takes a captured success value.
    pub fn expect_ok(&self) -> T {
        match self.take() {
            Ok(value) => value,
            Err(error) => panic!("expected success but got {}", error),
        }
    }

    /// Takes a captured error.
    pub fn expect_err(&self) -> SnapshotError {
        match self.take() {
            Ok(_) => panic!("expected failure but operation succeeded"),
            Err(error) => error,
        }
    }
}

impl<T: Send + 'static> Default for Captured<T> {
    fn default() -> Self {
        Captured::new()
    }
}
