//! The cluster-manager-side snapshot orchestration engine.
//!
//! All lifecycle transitions are proposed through the cluster-state bus and
//! take effect only when applied; the engine keeps nothing but transient
//! execution markers in memory. Repository I/O happens strictly outside any
//! engine lock.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, Weak};

use crate::assignment::compute_shard_assignments;
use crate::bus::{ClusterStateApplier, ClusterStateBus, Priority, UpdateTask};
use crate::cluster::{ClusterChangedEvent, ClusterState, Metadata};
use crate::deletions::{
    deletions_without_snapshots, find_in_progress_snapshots, is_writing_to_repository,
    matching_snapshot_ids, ready_deletions, state_without_snapshot,
    unblock_entries_after_delete_removal,
};
use crate::entries::{
    DeletionEntry, SnapshotEntry, SnapshotsInProgress, ABORTED_FAILURE_TEXT,
};
use crate::error::SnapshotError;
use crate::executor::{apply_shard_updates, ShardSnapshotUpdate};
use crate::listeners::{
    complete_completion_listeners, complete_deletion_listeners, fail_completion_listeners,
    fail_deletion_listeners, CompletionListener, DeletionListener, ListenerRegistry,
};
use crate::ongoing::OngoingOps;
use crate::reactive;
use crate::repository::{
    Repository, RepositoryData, ShardFailure, SnapshotFinalization, SnapshotInfo,
};
use crate::requests::{CloneSnapshotRequest, CreateSnapshotRequest, DeleteSnapshotRequest};
use crate::settings::SnapshotSettings;
use crate::types::{
    now_millis, DeletionState, IndexId, PeerVersion, RepoGeneration, RepositoryShardId,
    ShardGeneration, ShardId, ShardState, Snapshot, SnapshotId, SnapshotState,
};
use crate::validate::{simple_match_any, validate_snapshot_name};

/// Callback resolved once a snapshot has been admitted and started.
pub type StartedListener = Box<dyn FnOnce(Result<Snapshot, SnapshotError>) + Send>;

/// Callback resolved with the finalized snapshot description.
pub type InfoListener = Box<dyn FnOnce(Result<SnapshotInfo, SnapshotError>) + Send>;

/// Callback resolved when an operation with no payload finishes.
pub type VoidListener = Box<dyn FnOnce(Result<(), SnapshotError>) + Send>;

type Slot<T> = Arc<Mutex<Option<T>>>;

fn slot<T>() -> Slot<T> {
    Arc::new(Mutex::new(None))
}

fn slot_of<T>(value: T) -> Slot<T> {
    Arc::new(Mutex::new(Some(value)))
}

fn put<T>(slot: &Slot<T>, value: T) {
    *slot.lock().unwrap() = Some(value);
}

fn take<T>(slot: &Slot<T>) -> Option<T> {
    slot.lock().unwrap().take()
}

/// True if snapshots written with this repository metadata version carry
/// per-shard generations.
pub fn use_shard_generations(version: PeerVersion) -> bool {
    version.on_or_after(PeerVersion::SHARD_GEN_IN_REPO_DATA)
}

/// Lowest repository metadata version that every cluster peer and every
/// retained repository snapshot (minus `excluded`) can read.
pub fn min_compatible_version(
    min_peer_version: PeerVersion,
    repository_data: &RepositoryData,
    excluded: Option<&[SnapshotId]>,
) -> PeerVersion {
    let mut min = min_peer_version;
    for snapshot in &repository_data.snapshots {
        if let Some(excluded) = excluded {
            if excluded.contains(snapshot) {
                continue;
            }
        }
        if let Some(version) = repository_data.versions.get(&snapshot.uuid) {
            if version.before(min) {
                min = *version;
            }
        }
    }
    min
}

fn in_flight_index_ids(snapshots: &SnapshotsInProgress, repository: &str) -> BTreeMap<String, IndexId> {
    let mut ids = BTreeMap::new();
    for entry in snapshots.for_repo(repository) {
        for index in &entry.indices {
            ids.entry(index.name.clone()).or_insert_with(|| index.clone());
        }
    }
    ids
}

/// The snapshot orchestration engine. One instance runs per node; it only
/// acts while the node is the elected cluster-manager.
pub struct SnapshotEngine {
    weak_self: Weak<SnapshotEngine>,
    bus: Arc<ClusterStateBus>,
    settings: SnapshotSettings,
    repositories: Mutex<BTreeMap<String, Arc<dyn Repository>>>,
    listeners: ListenerRegistry,
    /// Snapshots that have passed into finalization; their entries may already
    /// be gone from the cluster state.
    ending_snapshots: Mutex<HashSet<Snapshot>>,
    /// Legacy-path snapshots between admission and their STARTED transition.
    initializing_snapshots: Mutex<HashSet<Snapshot>>,
    /// Clone entries whose clone map has not been filled yet.
    initializing_clones: Mutex<HashSet<Snapshot>>,
    /// Repositories whose finalize/delete loop is running.
    currently_finalizing: Mutex<HashSet<String>>,
    /// Repository shards with a clone running right now.
    currently_cloning: Mutex<HashSet<RepositoryShardId>>,
    ongoing: Mutex<OngoingOps>,
}

impl SnapshotEngine {
    /// Creates the engine and registers it as a state applier on the bus.
    pub fn new(bus: Arc<ClusterStateBus>, settings: SnapshotSettings) -> Arc<Self> {
        let engine = Arc::new_cyclic(|weak| SnapshotEngine {
            weak_self: weak.clone(),
            bus,
            settings,
            repositories: Mutex::new(BTreeMap::new()),
            listeners: ListenerRegistry::default(),
            ending_snapshots: Mutex::new(HashSet::new()),
            initializing_snapshots: Mutex::new(HashSet::new()),
            initializing_clones: Mutex::new(HashSet::new()),
            currently_finalizing: Mutex::new(HashSet::new()),
            currently_cloning: Mutex::new(HashSet::new()),
            ongoing: Mutex::new(OngoingOps::default()),
        });
        engine.bus.add_applier(engine.clone());
        engine
    }

    fn arc(&self) -> Arc<SnapshotEngine> {
        self.weak_self.upgrade().expect("engine dropped while in use")
    }

    /// The engine's settings.
    pub fn settings(&self) -> &SnapshotSettings {
        &self.settings
    }

    /// Registers a repository driver.
    pub fn register_repository(&self, repository: Arc<dyn Repository>) {
        self.repositories
            .lock()
            .unwrap()
            .insert(repository.name().to_string(), repository);
    }

    fn repository(&self, name: &str) -> Result<Arc<dyn Repository>, SnapshotError> {
        self.repositories
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| SnapshotError::RepositoryMissing(name.to_string()))
    }

    fn try_enter_repo_loop(&self, repository: &str) -> bool {
        self.currently_finalizing
            .lock()
            .unwrap()
            .insert(repository.to_string())
    }

    fn leave_repo_loop(&self, repository: &str) {
        let removed = self.currently_finalizing.lock().unwrap().remove(repository);
        debug_assert!(removed, "left repo loop that was never entered");
    }

    fn ensure_below_concurrency_limit(
        &self,
        repository: &str,
        name: &str,
        state: &ClusterState,
    ) -> Result<(), SnapshotError> {
        let in_progress = state.snapshots.len() + state.deletions.entries.len();
        let max = self.settings.max_concurrent_operations();
        if in_progress >= max {
            return Err(SnapshotError::concurrent(
                repository,
                name,
                format!(
                    "cannot start another operation, already running [{}] operations and the \
                     current limit for concurrent snapshot operations is set to [{}]",
                    in_progress, max
                ),
            ));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Create

    /// Starts creating a snapshot. The listener resolves once the operation
    /// has been admitted into the cluster state; completion is tracked
    /// separately (see [`execute_snapshot`](Self::execute_snapshot)).
    pub fn create_snapshot(&self, request: CreateSnapshotRequest, listener: StartedListener) {
        let repository_name = request.repository.clone();
        let snapshot_name = request.name.clone();
        if let Err(e) = validate_snapshot_name(&repository_name, &snapshot_name) {
            listener(Err(e));
            return;
        }
        let repository = match self.repository(&repository_name) {
            Ok(r) => r,
            Err(e) => {
                listener(Err(e));
                return;
            }
        };
        if repository.read_only() {
            listener(Err(SnapshotError::repository(
                &repository_name,
                "cannot create snapshot in a readonly repository",
            )));
            return;
        }
        if self
            .bus
            .state()
            .min_peer_version
            .before(PeerVersion::FULL_CONCURRENCY)
        {
            self.create_snapshot_legacy(request, repository, listener);
            return;
        }
        let repository_data = match repository.repository_data() {
            Ok(d) => d,
            Err(e) => {
                listener(Err(e));
                return;
            }
        };
        let snapshot = Snapshot::new(repository_name.clone(), SnapshotId::new(snapshot_name.clone()));
        let engine = self.arc();
        let entry_slot: Slot<SnapshotEntry> = slot();
        let listener_slot = slot_of(listener);
        let task = UpdateTask::new(format!("create_snapshot [{}]", snapshot_name), {
            let engine = engine.clone();
            let entry_slot = entry_slot.clone();
            let snapshot = snapshot.clone();
            let repository_data = repository_data.clone();
            move |current| {
                let entry = engine.admit_create(current, &request, &snapshot, &repository_data)?;
                put(&entry_slot, entry.clone());
                let mut entries = current.snapshots.entries.clone();
                entries.push(entry);
                Ok(current.with_snapshots(SnapshotsInProgress::of(entries)))
            }
        })
        .on_applied({
            let engine = engine.clone();
            let listener_slot = listener_slot.clone();
            let snapshot = snapshot.clone();
            move |_, new| {
                tracing::info!(snapshot = %snapshot, "snapshot started");
                if let Some(listener) = take(&listener_slot) {
                    listener(Ok(snapshot));
                }
                if let Some(entry) = take(&entry_slot) {
                    if entry.state.completed() {
                        engine.end_snapshot(&entry, &new.metadata, Some(repository_data));
                    }
                }
            }
        })
        .on_failure({
            move |_, error| {
                tracing::warn!(%snapshot, %error, "failed to create snapshot");
                if let Some(listener) = take(&listener_slot) {
                    listener(Err(error));
                }
            }
        });
        self.bus.submit_update(task);
    }

    fn admit_create(
        &self,
        current: &ClusterState,
        request: &CreateSnapshotRequest,
        snapshot: &Snapshot,
        repository_data: &RepositoryData,
    ) -> Result<SnapshotEntry, SnapshotError> {
        let repository_name = &snapshot.repository;
        let name = &snapshot.id.name;
        ensure_snapshot_name_available(repository_data, repository_name, name)?;
        ensure_snapshot_name_not_running(&current.snapshots, repository_name, name)?;
        ensure_no_cleanup_in_progress(current, repository_name, name)?;
        self.ensure_below_concurrency_limit(repository_name, name, current)?;
        let (indices, data_streams) = current.metadata.resolve(&request.indices);
        tracing::trace!(
            repository = %repository_name,
            snapshot = %name,
            ?indices,
            "creating snapshot"
        );
        let index_ids = repository_data
            .resolve_new_indices(&indices, &in_flight_index_ids(&current.snapshots, repository_name));
        let version = min_compatible_version(current.min_peer_version, repository_data, None);
        let shards = compute_shard_assignments(
            current,
            &index_ids,
            use_shard_generations(version),
            repository_data,
            repository_name,
        );
        if !request.partial {
            let missing: BTreeSet<&str> = shards
                .iter()
                .filter(|(_, status)| status.state == ShardState::Missing)
                .map(|(shard_id, _)| shard_id.index.as_str())
                .collect();
            if !missing.is_empty() {
                return Err(SnapshotError::snapshot(
                    repository_name,
                    name,
                    format!("indices don't have primary shards {:?}", missing),
                ));
            }
        }
        Ok(SnapshotEntry::started(
            snapshot.clone(),
            request.include_global_state,
            request.partial,
            index_ids,
            data_streams,
            now_millis(),
            repository_data.gen_id,
            shards,
            request.user_metadata.clone(),
            version,
        ))
    }

    /// Creates a snapshot and resolves the listener only once the snapshot
    /// has fully completed (or failed).
    pub fn execute_snapshot(&self, request: CreateSnapshotRequest, listener: InfoListener) {
        let engine = self.arc();
        self.create_snapshot(
            request,
            Box::new(move |result| match result {
                Ok(snapshot) => {
                    engine.listeners.add_completion(
                        snapshot.clone(),
                        Box::new(move |result| {
                            listener(result.and_then(|(_, info)| match &info.failure {
                                // An entry-level failure (e.g. an abort) fails
                                // the caller rather than returning a
                                // description of an unusable snapshot.
                                Some(reason) => Err(SnapshotError::snapshot(
                                    &snapshot.repository,
                                    &snapshot.id.name,
                                    reason.clone(),
                                )),
                                None => Ok(info),
                            }))
                        }),
                    );
                }
                Err(e) => listener(Err(e)),
            }),
        );
    }

    // ---------------------------------------------------------------------
    // Legacy create (pre-concurrency peers in the cluster)

    fn create_snapshot_legacy(
        &self,
        request: CreateSnapshotRequest,
        repository: Arc<dyn Repository>,
        listener: StartedListener,
    ) {
        let snapshot = Snapshot::new(
            request.repository.clone(),
            SnapshotId::new(request.name.clone()),
        );
        self.initializing_snapshots
            .lock()
            .unwrap()
            .insert(snapshot.clone());
        let engine = self.arc();
        let listener_slot = slot_of(listener);
        let task = UpdateTask::new(format!("create_snapshot [{}]", request.name), {
            let engine = engine.clone();
            let snapshot = snapshot.clone();
            let request = request.clone();
            move |current| {
                ensure_snapshot_name_not_running(
                    &current.snapshots,
                    &snapshot.repository,
                    &snapshot.id.name,
                )?;
                ensure_no_cleanup_in_progress(current, &snapshot.repository, &snapshot.id.name)?;
                if current.deletions.has_deletions() {
                    return Err(SnapshotError::concurrent(
                        &snapshot.repository,
                        &snapshot.id.name,
                        "cannot snapshot while a snapshot deletion is in-progress",
                    ));
                }
                if current
                    .snapshots
                    .entries
                    .iter()
                    .any(|e| e.state != SnapshotState::Init)
                {
                    return Err(SnapshotError::concurrent(
                        &snapshot.repository,
                        &snapshot.id.name,
                        "a snapshot is already running",
                    ));
                }
                engine.ensure_below_concurrency_limit(
                    &snapshot.repository,
                    &snapshot.id.name,
                    current,
                )?;
                let (indices, data_streams) = current.metadata.resolve(&request.indices);
                let index_ids = indices.into_iter().map(IndexId::new).collect();
                let entry = SnapshotEntry::init(
                    snapshot.clone(),
                    request.include_global_state,
                    request.partial,
                    index_ids,
                    data_streams,
                    now_millis(),
                    RepoGeneration::UNKNOWN,
                    request.user_metadata.clone(),
                    current.min_peer_version,
                );
                let mut entries = current.snapshots.entries.clone();
                // Entries from a previous cluster-manager that never left INIT
                // can be dropped here; they are cleaned up on apply anyway.
                entries.retain(|e| e.state != SnapshotState::Init);
                entries.push(entry);
                Ok(current.with_snapshots(SnapshotsInProgress::of(entries)))
            }
        })
        .on_applied({
            let engine = engine.clone();
            let snapshot = snapshot.clone();
            let listener_slot = listener_slot.clone();
            move |_, _| {
                engine.begin_snapshot(snapshot, repository, listener_slot);
            }
        })
        .on_failure({
            let engine = engine.clone();
            move |_, error| {
                engine.initializing_snapshots.lock().unwrap().remove(&snapshot);
                if let Some(listener) = take(&listener_slot) {
                    listener(Err(error));
                }
            }
        });
        self.bus.submit_update(task);
    }

    /// Second phase of the legacy path: write the pre-initialization to the
    /// repository, then move the entry from INIT to STARTED with concrete
    /// shard assignments.
    fn begin_snapshot(
        &self,
        snapshot: Snapshot,
        repository: Arc<dyn Repository>,
        listener_slot: Slot<StartedListener>,
    ) {
        debug_assert!(self
            .initializing_snapshots
            .lock()
            .unwrap()
            .contains(&snapshot));
        let cleanup = |engine: &SnapshotEngine, error: SnapshotError, listener_slot: &Slot<StartedListener>| {
            engine
                .initializing_snapshots
                .lock()
                .unwrap()
                .remove(&snapshot);
            if error.is_cluster_manager_failure() {
                if let Some(listener) = take(listener_slot) {
                    listener(Err(error));
                }
            } else {
                engine.remove_failed_snapshot_from_cluster_state(&snapshot, error.clone(), None);
                if let Some(listener) = take(listener_slot) {
                    listener(Err(error));
                }
            }
        };
        if repository.read_only() {
            cleanup(
                self,
                SnapshotError::repository(
                    &snapshot.repository,
                    "cannot create snapshot in a readonly repository",
                ),
                &listener_slot,
            );
            return;
        }
        let repository_data = match repository.repository_data() {
            Ok(d) => d,
            Err(e) => {
                cleanup(self, e, &listener_slot);
                return;
            }
        };
        if repository_data.has_snapshot_name(&snapshot.id.name) {
            cleanup(
                self,
                SnapshotError::invalid_name(
                    &snapshot.repository,
                    &snapshot.id.name,
                    "snapshot with the same name already exists",
                ),
                &listener_slot,
            );
            return;
        }
        let current = self.bus.state();
        let indices: Vec<IndexId> = current
            .snapshots
            .entry(&snapshot)
            .map(|e| e.indices.clone())
            .unwrap_or_default();
        if let Err(e) = repository.initialize_snapshot(&snapshot.id, &indices) {
            cleanup(self, e, &listener_slot);
            return;
        }
        let engine = self.arc();
        let aborted_slot: Slot<SnapshotEntry> = slot();
        let started_slot: Slot<SnapshotEntry> = slot();
        let task = UpdateTask::new(format!("update_snapshot [{}]", snapshot), {
            let snapshot = snapshot.clone();
            let repository_data = repository_data.clone();
            let aborted_slot = aborted_slot.clone();
            let started_slot = started_slot.clone();
            move |current| {
                let mut entries = Vec::with_capacity(current.snapshots.len());
                for entry in &current.snapshots.entries {
                    if entry.snapshot != snapshot {
                        entries.push(entry.clone());
                        continue;
                    }
                    if entry.state == SnapshotState::Aborted {
                        // Aborted while we were initializing; the delete path
                        // owns it now.
                        put(&aborted_slot, entry.clone());
                        entries.push(entry.clone());
                        continue;
                    }
                    let version =
                        min_compatible_version(current.min_peer_version, &repository_data, None);
                    let index_ids = repository_data.resolve_new_indices(
                        &entry.indices.iter().map(|i| i.name.clone()).collect::<Vec<_>>(),
                        &BTreeMap::new(),
                    );
                    let shards = compute_shard_assignments(
                        current,
                        &index_ids,
                        use_shard_generations(version),
                        &repository_data,
                        &snapshot.repository,
                    );
                    let started = SnapshotEntry::started(
                        entry.snapshot.clone(),
                        entry.include_global_state,
                        entry.partial,
                        index_ids,
                        entry.data_streams.clone(),
                        entry.start_time_ms,
                        repository_data.gen_id,
                        shards,
                        entry.user_metadata.clone(),
                        version,
                    );
                    put(&started_slot, started.clone());
                    entries.push(started);
                }
                Ok(current.with_snapshots(SnapshotsInProgress::of(entries)))
            }
        })
        .on_applied({
            let engine = engine.clone();
            let snapshot = snapshot.clone();
            let listener_slot = listener_slot.clone();
            move |_, new| {
                engine
                    .initializing_snapshots
                    .lock()
                    .unwrap()
                    .remove(&snapshot);
                if let Some(aborted) = take(&aborted_slot) {
                    // An abort raced our initialization. Finalizing here while
                    // the delete path may also finalize leaves a narrow window
                    // in which the same entry is submitted twice.
                    if let Some(listener) = take(&listener_slot) {
                        listener(Err(SnapshotError::snapshot(
                            &snapshot.repository,
                            &snapshot.id.name,
                            ABORTED_FAILURE_TEXT,
                        )));
                    }
                    engine.end_snapshot(&aborted, &new.metadata, None);
                    return;
                }
                if let Some(listener) = take(&listener_slot) {
                    listener(Ok(snapshot.clone()));
                }
                if let Some(started) = take(&started_slot) {
                    if started.state.completed() {
                        engine.end_snapshot(&started, &new.metadata, Some(repository_data));
                    }
                }
            }
        })
        .on_failure({
            let engine = engine.clone();
            let snapshot = snapshot.clone();
            move |_, error| {
                engine
                    .initializing_snapshots
                    .lock()
                    .unwrap()
                    .remove(&snapshot);
                if error.is_cluster_manager_failure() {
                    if let Some(listener) = take(&listener_slot) {
                        listener(Err(error));
                    }
                } else {
                    engine.remove_failed_snapshot_from_cluster_state(&snapshot, error.clone(), None);
                    if let Some(listener) = take(&listener_slot) {
                        listener(Err(error));
                    }
                }
            }
        });
        self.bus.submit_update(task);
    }

    // ---------------------------------------------------------------------
    // Clone

    /// Clones indices of an existing snapshot into a new snapshot without
    /// re-reading the source shards. The listener resolves once the clone is
    /// fully written.
    pub fn clone_snapshot(&self, request: CloneSnapshotRequest, listener: VoidListener) {
        let repository_name = request.repository.clone();
        if let Err(e) = validate_snapshot_name(&repository_name, &request.target) {
            listener(Err(e));
            return;
        }
        let repository = match self.repository(&repository_name) {
            Ok(r) => r,
            Err(e) => {
                listener(Err(e));
                return;
            }
        };
        if repository.read_only() {
            listener(Err(SnapshotError::repository(
                &repository_name,
                "cannot create snapshot in a readonly repository",
            )));
            return;
        }
        if self
            .bus
            .state()
            .min_peer_version
            .before(PeerVersion::CLONE_SNAPSHOT)
        {
            listener(Err(SnapshotError::concurrent(
                &repository_name,
                &request.target,
                "the cluster contains peers that do not support clone operations",
            )));
            return;
        }
        let repository_data = match repository.repository_data() {
            Ok(d) => d,
            Err(e) => {
                listener(Err(e));
                return;
            }
        };
        let snapshot = Snapshot::new(repository_name.clone(), SnapshotId::new(request.target.clone()));
        self.initializing_clones.lock().unwrap().insert(snapshot.clone());
        let engine = self.arc();
        let entry_slot: Slot<SnapshotEntry> = slot();
        let listener_slot = slot_of(listener);
        let task = UpdateTask::new(
            format!("clone_snapshot [{}][{}]", request.source, request.target),
            {
                let engine = engine.clone();
                let entry_slot = entry_slot.clone();
                let snapshot = snapshot.clone();
                let repository_data = repository_data.clone();
                move |current| {
                    let repository_name = &snapshot.repository;
                    let name = &snapshot.id.name;
                    ensure_snapshot_name_available(&repository_data, repository_name, name)?;
                    ensure_no_cleanup_in_progress(current, repository_name, name)?;
                    ensure_snapshot_name_not_running(&current.snapshots, repository_name, name)?;
                    let source = repository_data
                        .snapshot_by_name(&request.source)
                        .cloned()
                        .ok_or_else(|| SnapshotError::missing(repository_name, &request.source))?;
                    if current
                        .deletions
                        .entries
                        .iter()
                        .any(|d| d.snapshots.contains(&source))
                    {
                        return Err(SnapshotError::concurrent(
                            repository_name,
                            &source.name,
                            "cannot clone from snapshot that is being deleted",
                        ));
                    }
                    engine.ensure_below_concurrency_limit(repository_name, name, current)?;
                    let source_indices = repository_data.indices_of_snapshot(&source.uuid);
                    let matching: Vec<IndexId> = source_indices
                        .into_iter()
                        .filter(|index| simple_match_any(&request.indices, &index.name))
                        .collect();
                    if matching.is_empty() {
                        return Err(SnapshotError::snapshot(
                            repository_name,
                            name,
                            format!(
                                "no indices in the source snapshot [{}] matched requested pattern {:?}",
                                source, request.indices
                            ),
                        ));
                    }
                    let entry = SnapshotEntry::start_clone(
                        snapshot.clone(),
                        source,
                        matching,
                        now_millis(),
                        repository_data.gen_id,
                        min_compatible_version(current.min_peer_version, &repository_data, None),
                    );
                    put(&entry_slot, entry.clone());
                    let mut entries = current.snapshots.entries.clone();
                    entries.push(entry);
                    Ok(current.with_snapshots(SnapshotsInProgress::of(entries)))
                }
            },
        )
        .on_applied({
            let engine = engine.clone();
            let snapshot = snapshot.clone();
            let listener_slot = listener_slot.clone();
            move |_, _| {
                tracing::info!(snapshot = %snapshot, "snapshot clone started");
                if let Some(listener) = take(&listener_slot) {
                    engine.listeners.add_completion(
                        snapshot.clone(),
                        Box::new(move |result| listener(result.map(|_| ()))),
                    );
                }
                if let Some(entry) = take(&entry_slot) {
                    engine.start_cloning(repository, entry);
                }
            }
        })
        .on_failure({
            let engine = engine.clone();
            move |_, error| {
                engine.initializing_clones.lock().unwrap().remove(&snapshot);
                tracing::warn!(%snapshot, %error, "failed to clone snapshot");
                if let Some(listener) = take(&listener_slot) {
                    listener(Err(error));
                }
            }
        });
        self.bus.submit_update(task);
    }

    /// Prepares a freshly admitted clone entry: checks the source, reads the
    /// per-index shard counts, and fills the entry's clone map.
    fn start_cloning(&self, repository: Arc<dyn Repository>, clone_entry: SnapshotEntry) {
        let target = clone_entry.snapshot.clone();
        let source = clone_entry.source.clone().expect("clone entry has a source");
        let fail_clone = |engine: &SnapshotEngine, error: SnapshotError| {
            engine.initializing_clones.lock().unwrap().remove(&target);
            tracing::info!(snapshot = %target, %error, "failed to start snapshot clone");
            engine.remove_failed_snapshot_from_cluster_state(&target, error, None);
        };
        let info = match repository.snapshot_info(&source) {
            Ok(info) => info,
            Err(e) => {
                fail_clone(self, e);
                return;
            }
        };
        for index in &clone_entry.indices {
            let index_failed = info.failure.is_some()
                || info.failures.iter().any(|f| f.shard.index == index.name);
            if index_failed {
                fail_clone(
                    self,
                    SnapshotError::snapshot(
                        &target.repository,
                        &target.id.name,
                        format!(
                            "can't clone index {} because its snapshot was not successful",
                            index
                        ),
                    ),
                );
                return;
            }
        }
        let mut shard_counts = Vec::with_capacity(clone_entry.indices.len());
        for index in &clone_entry.indices {
            match repository.snapshot_shard_count(&source, index) {
                Ok(count) => shard_counts.push((index.clone(), count)),
                Err(e) => {
                    fail_clone(self, e);
                    return;
                }
            }
        }
        let repository_data = match repository.repository_data() {
            Ok(d) => d,
            Err(e) => {
                fail_clone(self, e);
                return;
            }
        };
        let engine = self.arc();
        let updated_slot: Slot<SnapshotEntry> = slot();
        let task = UpdateTask::new("start snapshot clone", {
            let updated_slot = updated_slot.clone();
            let target = target.clone();
            move |current| {
                let mut entries = current.snapshots.entries.clone();
                let mut changed = false;
                for slot_entry in entries.iter_mut() {
                    if slot_entry.snapshot != target {
                        continue;
                    }
                    let in_flight = crate::inflight::InFlightShardStates::for_repo(
                        &target.repository,
                        &current.snapshots.entries,
                    );
                    let mut clones = BTreeMap::new();
                    for (index, count) in &shard_counts {
                        for shard in 0..*count {
                            let repo_shard = RepositoryShardId::new(index.clone(), shard);
                            if in_flight.is_active(&index.name, shard) {
                                clones.insert(
                                    repo_shard,
                                    crate::types::ShardSnapshotStatus::unassigned_queued(),
                                );
                            } else {
                                let generation = in_flight.generation_for_shard(
                                    index,
                                    shard,
                                    &repository_data,
                                );
                                clones.insert(
                                    repo_shard,
                                    crate::types::ShardSnapshotStatus::init(
                                        Some(current.local_node),
                                        generation,
                                    ),
                                );
                            }
                        }
                    }
                    let updated = slot_entry.with_clones(clones);
                    put(&updated_slot, updated.clone());
                    *slot_entry = updated;
                    changed = true;
                    break;
                }
                if changed {
                    Ok(current.with_snapshots(SnapshotsInProgress::of(entries)))
                } else {
                    Ok(current.clone())
                }
            }
        })
        .on_applied({
            let engine = engine.clone();
            let target = target.clone();
            move |_, _| {
                engine.initializing_clones.lock().unwrap().remove(&target);
                match take(&updated_slot) {
                    Some(updated) => {
                        let source = updated.source.clone().expect("clone entry has a source");
                        for (repo_shard, status) in &updated.clones {
                            if status.state == ShardState::Init {
                                engine.run_ready_clone(
                                    target.clone(),
                                    source.clone(),
                                    status.clone(),
                                    repo_shard.clone(),
                                    repository.clone(),
                                );
                            }
                        }
                    }
                    None => {
                        // Cluster-manager flipped between starting the clone
                        // and assigning its shards.
                        tracing::warn!(snapshot = %target, "clone entry disappeared before starting");
                    }
                }
            }
        })
        .on_failure({
            let engine = engine.clone();
            move |_, error| {
                engine.initializing_clones.lock().unwrap().remove(&target);
                tracing::info!(snapshot = %target, %error, "failed to start snapshot clone");
                engine.fail_all_listeners_on_failover(&error);
            }
        });
        self.bus.submit_update(task);
    }

    /// Executes one ready shard clone on the repository and reports the
    /// outcome as a shard status update.
    fn run_ready_clone(
        &self,
        target: Snapshot,
        source: SnapshotId,
        status_before: crate::types::ShardSnapshotStatus,
        repo_shard: RepositoryShardId,
        repository: Arc<dyn Repository>,
    ) {
        if !self
            .currently_cloning
            .lock()
            .unwrap()
            .insert(repo_shard.clone())
        {
            return;
        }
        let local_node = self.bus.state().local_node;
        let update = match repository.clone_shard_snapshot(
            &source,
            &target.id,
            &repo_shard,
            status_before.generation.as_ref(),
        ) {
            Ok(generation) => ShardSnapshotUpdate::clone_shard(
                target.clone(),
                repo_shard.clone(),
                crate::types::ShardSnapshotStatus::success(Some(local_node), generation),
            ),
            Err(error) => {
                tracing::warn!(shard = %repo_shard, %error, "shard clone failed");
                ShardSnapshotUpdate::clone_shard(
                    target.clone(),
                    repo_shard.clone(),
                    crate::types::ShardSnapshotStatus::failed(
                        Some(local_node),
                        "failed to clone shard snapshot",
                        None,
                    ),
                )
            }
        };
        let engine = self.arc();
        let shard = repo_shard.clone();
        self.inner_update_snapshot_state(
            update,
            Box::new(move |result| {
                engine.currently_cloning.lock().unwrap().remove(&shard);
                if let Err(error) = result {
                    tracing::warn!(shard = %shard, %error, "state update after shard clone failed");
                    engine.fail_all_listeners_on_failover(&error);
                }
            }),
        );
    }

    /// Kicks off repository work for every clone shard in INIT state.
    fn start_executable_clones(&self, state: &ClusterState, repository_name: Option<&str>) {
        for entry in &state.snapshots.entries {
            if !entry.is_clone() || entry.state != SnapshotState::Started {
                continue;
            }
            if let Some(filter) = repository_name {
                if entry.repository() != filter {
                    continue;
                }
            }
            let Ok(repository) = self.repository(entry.repository()) else {
                tracing::warn!(repository = entry.repository(), "repository gone while cloning");
                continue;
            };
            let source = entry.source.clone().expect("clone entry has a source");
            for (repo_shard, status) in &entry.clones {
                if status.state == ShardState::Init {
                    self.run_ready_clone(
                        entry.snapshot.clone(),
                        source.clone(),
                        status.clone(),
                        repo_shard.clone(),
                        repository.clone(),
                    );
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Shard state updates

    /// Folds a shard status update (from a data node RPC or the local clone
    /// executor) into the cluster state.
    pub fn inner_update_snapshot_state(&self, update: ShardSnapshotUpdate, listener: VoidListener) {
        tracing::trace!(snapshot = %update.snapshot, "received shard snapshot status update");
        let engine = self.arc();
        let snapshot = update.snapshot.clone();
        let repository = snapshot.repository.clone();
        let listener_slot = slot_of(listener);
        let task = UpdateTask::new("update snapshot state", {
            move |current: &ClusterState| match apply_shard_updates(current, std::slice::from_ref(&update)) {
                Some(snapshots) => Ok(current.with_snapshots(snapshots)),
                None => Ok(current.clone()),
            }
        })
        .on_applied({
            let listener_slot = listener_slot.clone();
            move |_, new| {
                if let Some(listener) = take(&listener_slot) {
                    listener(Ok(()));
                }
                let ending = engine.ending_snapshots.lock().unwrap().contains(&snapshot);
                if !ending {
                    if let Some(entry) = new.snapshots.entry(&snapshot) {
                        if entry.state.completed() {
                            engine.end_snapshot(entry, &new.metadata, None);
                        }
                    }
                }
                engine.start_executable_clones(new, Some(&repository));
            }
        })
        .on_failure(move |_, error| {
            if let Some(listener) = take(&listener_slot) {
                listener(Err(error));
            }
        });
        self.bus.submit_update(task);
    }

    // ---------------------------------------------------------------------
    // Delete

    /// Deletes snapshots by name or pattern. In-progress matches are aborted
    /// first; the listener resolves when the repository delete finished.
    pub fn delete_snapshots(&self, request: DeleteSnapshotRequest, listener: DeletionListener) {
        let repository_name = request.repository.clone();
        tracing::info!(
            repository = %repository_name,
            snapshots = ?request.snapshots,
            "deleting snapshots"
        );
        let repository = match self.repository(&repository_name) {
            Ok(r) => r,
            Err(e) => {
                listener(Err(e));
                return;
            }
        };
        let repository_data = match repository.repository_data() {
            Ok(d) => d,
            Err(e) => {
                listener(Err(e));
                return;
            }
        };
        let engine = self.arc();
        let listener_slot = slot_of(listener);
        let admission_slot: Slot<DeleteAdmission> = slot();
        let legacy_slot: Slot<LegacyDelete> = slot();
        let task = UpdateTask::new("delete snapshot", {
            let engine = engine.clone();
            let admission_slot = admission_slot.clone();
            let legacy_slot = legacy_slot.clone();
            let repository_name = repository_name.clone();
            let repository_data = repository_data.clone();
            move |current| {
                if request.snapshots.len() > 1
                    && current.min_peer_version.before(PeerVersion::MULTI_DELETE)
                {
                    return Err(SnapshotError::snapshot(
                        &repository_name,
                        &request.snapshots[0],
                        "deleting multiple snapshots in a single request is not supported by all \
                         cluster peers",
                    ));
                }
                let entries =
                    find_in_progress_snapshots(&current.snapshots, &request.snapshots, &repository_name);
                let in_progress_ids: Vec<SnapshotId> =
                    entries.iter().map(|e| e.snapshot.id.clone()).collect();
                let snapshot_ids = matching_snapshot_ids(
                    &in_progress_ids,
                    &repository_data,
                    &request.snapshots,
                    &repository_name,
                )?;
                if entries.is_empty()
                    || current
                        .min_peer_version
                        .on_or_after(PeerVersion::FULL_CONCURRENCY)
                {
                    let (state, admission) = engine.admit_delete(
                        current,
                        &snapshot_ids,
                        &repository_name,
                        &repository_data,
                    )?;
                    put(&admission_slot, admission);
                    return Ok(state);
                }
                // Legacy single-snapshot path: abort the running snapshot and
                // wait for it before deleting anything from the repository.
                let entry: SnapshotEntry = (*entries[0]).clone();
                let mut outstanding = snapshot_ids;
                if entry.state != SnapshotState::Init
                    && !outstanding.contains(&entry.snapshot.id)
                {
                    outstanding.push(entry.snapshot.id.clone());
                }
                let mut legacy = LegacyDelete {
                    running: entry.snapshot.clone(),
                    outstanding,
                    aborted_during_init: false,
                };
                let mut entries_out = Vec::with_capacity(current.snapshots.len());
                for existing in &current.snapshots.entries {
                    if existing.snapshot != entry.snapshot {
                        entries_out.push(existing.clone());
                        continue;
                    }
                    if existing.state == SnapshotState::Init {
                        // Never wrote anything; drop it outright.
                        legacy.aborted_during_init = true;
                        legacy.outstanding.retain(|id| id != &existing.snapshot.id);
                    } else if let Some(aborted) = existing.abort() {
                        entries_out.push(aborted);
                    } else {
                        legacy.aborted_during_init = true;
                        legacy.outstanding.retain(|id| id != &existing.snapshot.id);
                    }
                }
                put(&legacy_slot, legacy);
                Ok(current.with_snapshots(SnapshotsInProgress::of(entries_out)))
            }
        })
        .on_applied({
            let engine = engine.clone();
            let listener_slot = listener_slot.clone();
            let repository_name = repository_name.clone();
            let repository_data = repository_data.clone();
            let admission_slot = admission_slot.clone();
            move |_, new| {
                if let Some(admission) = take(&admission_slot) {
                    engine.delete_admission_applied(
                        new,
                        admission,
                        &repository_name,
                        repository_data,
                        listener_slot.clone(),
                    );
                    return;
                }
                let Some(legacy) = take(&legacy_slot) else {
                    if let Some(listener) = take(&listener_slot) {
                        listener(Ok(()));
                    }
                    return;
                };
                if legacy.aborted_during_init {
                    tracing::info!(snapshot = %legacy.running, "aborted snapshot during initialization");
                    engine.fail_snapshot_completion_listeners(
                        &legacy.running,
                        &SnapshotError::snapshot(
                            &legacy.running.repository,
                            &legacy.running.id.name,
                            ABORTED_FAILURE_TEXT,
                        ),
                    );
                    if legacy.outstanding.is_empty() {
                        if let Some(listener) = take(&listener_slot) {
                            listener(Ok(()));
                        }
                    } else {
                        engine.submit_delete_from_repo_task(
                            legacy.outstanding,
                            repository_name.clone(),
                            repository_data.clone(),
                            Priority::Immediate,
                            listener_slot.clone(),
                        );
                    }
                    return;
                }
                // Wait for the aborted snapshot to drain, then delete.
                tracing::trace!("waiting for aborted snapshot before deleting");
                let engine_inner = engine.clone();
                let listener_slot = listener_slot.clone();
                let repository_name = repository_name.clone();
                let running = legacy.running.clone();
                engine.listeners.add_completion(
                    legacy.running.clone(),
                    Box::new(move |result| match result {
                        Ok((repository_data, _)) => {
                            tracing::debug!("aborted snapshot completed, deleting files");
                            engine_inner.submit_delete_from_repo_task(
                                legacy.outstanding,
                                repository_name,
                                repository_data,
                                Priority::Immediate,
                                listener_slot,
                            );
                        }
                        Err(error) => {
                            if let Some(listener) = take(&listener_slot) {
                                if error.is_cluster_manager_failure() {
                                    listener(Err(error));
                                } else {
                                    listener(Err(SnapshotError::missing(
                                        &running.repository,
                                        &running.id.name,
                                    )));
                                }
                            }
                        }
                    }),
                );
            }
        })
        .on_failure({
            move |_, error| {
                // Entries resolved to drop must not keep their ending marker
                // if the update never applied.
                if let Some(admission) = take(&admission_slot) {
                    let mut ending = engine.ending_snapshots.lock().unwrap();
                    for snapshot in &admission.completed_no_cleanup {
                        ending.remove(snapshot);
                    }
                }
                if let Some(listener) = take(&listener_slot) {
                    listener(Err(error));
                }
            }
        });
        self.bus.submit_update(task);
    }

    /// Submits a standalone delete admission (used by the legacy path after
    /// the running snapshot was dealt with).
    fn submit_delete_from_repo_task(
        &self,
        snapshot_ids: Vec<SnapshotId>,
        repository_name: String,
        repository_data: RepositoryData,
        priority: Priority,
        listener_slot: Slot<DeletionListener>,
    ) {
        if snapshot_ids.is_empty() {
            if let Some(listener) = take(&listener_slot) {
                listener(Ok(()));
            }
            return;
        }
        let engine = self.arc();
        let admission_slot: Slot<DeleteAdmission> = slot();
        let task = UpdateTask::new("delete snapshot", {
            let engine = engine.clone();
            let admission_slot = admission_slot.clone();
            let repository_name = repository_name.clone();
            let repository_data = repository_data.clone();
            move |current| {
                let (state, admission) =
                    engine.admit_delete(current, &snapshot_ids, &repository_name, &repository_data)?;
                put(&admission_slot, admission);
                Ok(state)
            }
        })
        .priority(priority)
        .on_applied({
            let engine = engine.clone();
            let listener_slot = listener_slot.clone();
            let admission_slot = admission_slot.clone();
            move |_, new| {
                let admission = take(&admission_slot).expect("admission recorded on success");
                engine.delete_admission_applied(
                    new,
                    admission,
                    &repository_name,
                    repository_data,
                    listener_slot.clone(),
                );
            }
        })
        .on_failure({
            let engine = engine.clone();
            let admission_slot = admission_slot.clone();
            move |_, error| {
                // Entries we resolved to drop must not keep their ending
                // marker if the update never applied.
                if let Some(admission) = take(&admission_slot) {
                    let mut ending = engine.ending_snapshots.lock().unwrap();
                    for snapshot in &admission.completed_no_cleanup {
                        ending.remove(snapshot);
                    }
                }
                if let Some(listener) = take(&listener_slot) {
                    listener(Err(error));
                }
            }
        });
        self.bus.submit_update(task);
    }

    /// The delete admission transition: aborts matching in-progress entries
    /// and merges, reuses, or creates the deletion entry.
    fn admit_delete(
        &self,
        current: &ClusterState,
        snapshot_ids: &[SnapshotId],
        repository_name: &str,
        repository_data: &RepositoryData,
    ) -> Result<(ClusterState, DeleteAdmission), SnapshotError> {
        let mut admission = DeleteAdmission::default();
        if snapshot_ids.is_empty() {
            return Ok((current.clone(), admission));
        }
        let first_name = &snapshot_ids[0].name;
        let concurrency_allowed = current
            .min_peer_version
            .on_or_after(PeerVersion::FULL_CONCURRENCY);
        if !concurrency_allowed && current.deletions.has_deletions() {
            return Err(SnapshotError::concurrent(
                repository_name,
                first_name,
                "cannot delete - another snapshot is currently being deleted",
            ));
        }
        if current.cleanups_in_progress.contains(repository_name) {
            return Err(SnapshotError::concurrent(
                repository_name,
                first_name,
                "cannot delete snapshots while a repository cleanup is in-progress",
            ));
        }
        for restore in &current.restores_in_progress {
            if restore.repository == repository_name && snapshot_ids.contains(&restore.id) {
                return Err(SnapshotError::concurrent(
                    repository_name,
                    first_name,
                    "cannot delete snapshot during a restore in progress",
                ));
            }
        }
        let active_clone_sources: BTreeSet<&SnapshotId> = current
            .snapshots
            .entries
            .iter()
            .filter_map(|e| e.source.as_ref())
            .collect();
        for id in snapshot_ids {
            if active_clone_sources.contains(id) {
                return Err(SnapshotError::concurrent(
                    repository_name,
                    &id.name,
                    "cannot delete snapshot while it is being cloned",
                ));
            }
        }
        let mut ids_requiring_cleanup: Vec<SnapshotId> = snapshot_ids.to_vec();
        let updated_snapshots = if concurrency_allowed {
            let mut entries = Vec::with_capacity(current.snapshots.len());
            for existing in &current.snapshots.entries {
                if existing.state == SnapshotState::Started
                    && ids_requiring_cleanup.contains(&existing.snapshot.id)
                {
                    match existing.abort() {
                        None => {
                            // No work started; drop the entry right away and
                            // resolve its listeners after the update applies.
                            let snapshot = existing.snapshot.clone();
                            if self.ending_snapshots.lock().unwrap().insert(snapshot.clone()) {
                                admission.completed_no_cleanup.push(snapshot.clone());
                            }
                            ids_requiring_cleanup.retain(|id| id != &snapshot.id);
                        }
                        Some(aborted) => {
                            if aborted.state.completed() {
                                admission.completed_with_cleanup.push(aborted.clone());
                            }
                            entries.push(aborted);
                        }
                    }
                } else {
                    entries.push(existing.clone());
                }
            }
            let updated = SnapshotsInProgress::of(entries);
            if ids_requiring_cleanup.is_empty() {
                // Everything matched entries that never started; no deletion
                // entry needed.
                return Ok((current.with_updates(Some(updated), None), admission));
            }
            updated
        } else {
            if !current.snapshots.is_empty() {
                return Err(SnapshotError::concurrent(
                    repository_name,
                    first_name,
                    "another snapshot is currently running cannot delete",
                ));
            }
            current.snapshots.clone()
        };
        let replaced = current
            .deletions
            .entries
            .iter()
            .find(|d| d.repository == repository_name && d.state == DeletionState::Waiting)
            .cloned();
        let new_delete = match &replaced {
            None => {
                let duplicate = current.deletions.entries.iter().find(|d| {
                    d.repository == repository_name
                        && d.state == DeletionState::Started
                        && ids_requiring_cleanup.iter().all(|id| d.snapshots.contains(id))
                });
                if let Some(duplicate) = duplicate {
                    admission.new_delete = Some(duplicate.clone());
                    admission.reused_existing = true;
                    return Ok((current.clone(), admission));
                }
                self.ensure_below_concurrency_limit(repository_name, first_name, current)?;
                let no_writer = updated_snapshots
                    .for_repo(repository_name)
                    .all(|e| !is_writing_to_repository(e))
                    && !current.deletions.has_started_for_repo(repository_name);
                DeletionEntry::new(
                    ids_requiring_cleanup,
                    repository_name,
                    now_millis(),
                    repository_data.gen_id,
                    if no_writer {
                        DeletionState::Started
                    } else {
                        DeletionState::Waiting
                    },
                )
            }
            Some(replaced) => replaced.with_added_snapshots(ids_requiring_cleanup),
        };
        admission.new_delete = Some(new_delete.clone());
        let deletions = match replaced {
            Some(replaced) => current.deletions.without_entry(&replaced.uuid),
            None => current.deletions.clone(),
        }
        .with_entry(new_delete);
        Ok((
            current.with_updates(Some(updated_snapshots), Some(deletions)),
            admission,
        ))
    }

    fn delete_admission_applied(
        &self,
        new_state: &ClusterState,
        admission: DeleteAdmission,
        repository_name: &str,
        repository_data: RepositoryData,
        listener_slot: Slot<DeletionListener>,
    ) {
        if !admission.completed_no_cleanup.is_empty() {
            tracing::info!(
                snapshots = ?admission.completed_no_cleanup.iter().map(|s| &s.id.name).collect::<Vec<_>>(),
                "snapshots aborted"
            );
        }
        for snapshot in &admission.completed_no_cleanup {
            self.fail_snapshot_completion_listeners(
                snapshot,
                &SnapshotError::snapshot(&snapshot.repository, &snapshot.id.name, ABORTED_FAILURE_TEXT),
            );
        }
        match admission.new_delete {
            None => {
                if let Some(listener) = take(&listener_slot) {
                    listener(Ok(()));
                }
            }
            Some(delete) => {
                if let Some(listener) = take(&listener_slot) {
                    self.listeners.add_deletion(delete.uuid.clone(), listener);
                }
                if admission.reused_existing {
                    return;
                }
                if delete.state == DeletionState::Started {
                    if self.try_enter_repo_loop(repository_name) {
                        self.delete_snapshots_from_repository(
                            &delete,
                            Some(repository_data),
                            new_state.min_peer_version,
                        );
                    } else {
                        tracing::trace!(uuid = %delete.uuid, "delete queued behind running repo operation");
                    }
                } else {
                    for entry in admission.completed_with_cleanup {
                        self.end_snapshot(&entry, &new_state.metadata, Some(repository_data.clone()));
                    }
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Finalization loop

    /// Hands a completed entry to the finalization loop of its repository.
    fn end_snapshot(&self, entry: &SnapshotEntry, metadata: &Metadata, repository_data: Option<RepositoryData>) {
        let snapshot = entry.snapshot.clone();
        let new_finalization = self.ending_snapshots.lock().unwrap().insert(snapshot.clone());
        if entry.repo_generation == RepoGeneration::UNKNOWN {
            tracing::debug!(snapshot = %snapshot, "snapshot was aborted before starting");
            self.remove_failed_snapshot_from_cluster_state(
                &snapshot,
                SnapshotError::snapshot(&snapshot.repository, &snapshot.id.name, "aborted on initialization"),
                repository_data,
            );
            return;
        }
        if entry.is_clone() && entry.state == SnapshotState::Failed {
            tracing::debug!(snapshot = %snapshot, "removing failed snapshot clone");
            let reason = entry.failure.clone().unwrap_or_else(|| "clone failed".to_string());
            self.remove_failed_snapshot_from_cluster_state(
                &snapshot,
                SnapshotError::snapshot(&snapshot.repository, &snapshot.id.name, reason),
                None,
            );
            return;
        }
        let repository_name = entry.repository().to_string();
        if self.try_enter_repo_loop(&repository_name) {
            let data = match repository_data {
                Some(data) => data,
                None => {
                    let repository = match self.repository(&repository_name) {
                        Ok(r) => r,
                        Err(e) => {
                            self.fail_pending_repo_tasks(&repository_name, e);
                            return;
                        }
                    };
                    match repository.repository_data() {
                        Ok(data) => data,
                        Err(e) => {
                            self.fail_pending_repo_tasks(&repository_name, e);
                            return;
                        }
                    }
                }
            };
            self.finalize_snapshot_entry(entry.clone(), metadata.clone(), data);
        } else if new_finalization {
            self.ongoing
                .lock()
                .unwrap()
                .add_finalization(entry.clone(), metadata.clone());
        }
    }

    /// Writes the snapshot description and repository data, then removes the
    /// entry from the cluster state and resolves its listeners.
    fn finalize_snapshot_entry(
        &self,
        entry: SnapshotEntry,
        metadata: Metadata,
        repository_data: RepositoryData,
    ) {
        debug_assert!(self
            .currently_finalizing
            .lock()
            .unwrap()
            .contains(entry.repository()));
        let snapshot = entry.snapshot.clone();
        let repository_name = entry.repository().to_string();
        tracing::trace!(
            snapshot = %snapshot,
            state = ?entry.state,
            failure = ?entry.failure,
            "finalizing snapshot in repository"
        );
        let repository = match self.repository(&repository_name) {
            Ok(r) => r,
            Err(e) => {
                self.handle_finalization_failure(e, &entry, repository_data);
                return;
            }
        };
        let mut failures = Vec::new();
        let statuses: Vec<(ShardId, &crate::types::ShardSnapshotStatus)> = if entry.is_clone() {
            entry
                .clones
                .iter()
                .map(|(repo_shard, status)| {
                    (ShardId::new(repo_shard.index_name(), repo_shard.shard), status)
                })
                .collect()
        } else {
            entry
                .shards
                .iter()
                .map(|(shard_id, status)| (shard_id.clone(), status))
                .collect()
        };
        let total_shards = statuses.len();
        for (shard_id, status) in &statuses {
            match status.state {
                ShardState::Success => {}
                ShardState::Failed | ShardState::Missing | ShardState::Aborted => {
                    failures.push(ShardFailure {
                        node: status.node,
                        shard: shard_id.clone(),
                        reason: status.reason.clone().unwrap_or_else(|| "failed".to_string()),
                    });
                }
                _ => {
                    failures.push(ShardFailure {
                        node: status.node,
                        shard: shard_id.clone(),
                        reason: "skipped".to_string(),
                    });
                }
            }
        }
        let shard_generations = build_generations(&entry);
        let shard_counts = shard_counts_for_entry(&entry, &metadata);
        let info = SnapshotInfo {
            snapshot_id: snapshot.id.clone(),
            indices: entry.indices.iter().map(|i| i.name.clone()).collect(),
            data_streams: entry.data_streams.clone(),
            start_time_ms: entry.start_time_ms,
            end_time_ms: now_millis(),
            total_shards,
            failures,
            include_global_state: entry.include_global_state,
            user_metadata: entry.user_metadata.clone(),
            failure: entry.failure.clone(),
        };
        let finalization = SnapshotFinalization {
            info: info.clone(),
            indices: entry.indices.clone(),
            shard_counts,
            shard_generations,
            expected_gen: repository_data.gen_id,
            repo_meta_version: entry.repository_meta_version,
        };
        let new_repo_data = match repository.finalize_snapshot(finalization) {
            Ok(data) => data,
            Err(e) => {
                self.handle_finalization_failure(e, &entry, repository_data);
                return;
            }
        };
        let engine = self.arc();
        let task = UpdateTask::new("remove snapshot metadata after finalization", {
            let snapshot = snapshot.clone();
            move |current: &ClusterState| {
                let snapshots = state_without_snapshot(&current.snapshots, &snapshot);
                let state = current.with_updates(snapshots, None);
                let ready = ready_deletions(&state.snapshots, &state.deletions);
                Ok(state.with_updates(None, ready.deletions))
            }
        })
        .on_applied({
            let engine = engine.clone();
            let snapshot = snapshot.clone();
            let repository_name = repository_name.clone();
            let new_repo_data = new_repo_data.clone();
            move |_, _| {
                let listeners = engine.end_and_get_listeners(&snapshot);
                complete_completion_listeners(listeners, &new_repo_data, &info);
                tracing::info!(snapshot = %snapshot, state = ?info.state(), "snapshot completed");
                engine.run_next_queued_operation(new_repo_data, &repository_name, true);
            }
        })
        .on_failure({
            move |_, error| {
                engine.handle_finalization_failure(error, &entry, new_repo_data);
            }
        });
        self.bus.submit_update(task);
    }

    /// Routes a finalization failure: publication failures mean this node is
    /// done writing, repository failures fail the entry and continue.
    fn handle_finalization_failure(
        &self,
        error: SnapshotError,
        entry: &SnapshotEntry,
        repository_data: RepositoryData,
    ) {
        let snapshot = &entry.snapshot;
        if error.is_cluster_manager_failure() {
            tracing::debug!(
                snapshot = %snapshot,
                %error,
                "failed to update cluster state during snapshot finalization"
            );
            self.fail_snapshot_completion_listeners(
                snapshot,
                &SnapshotError::snapshot(
                    &snapshot.repository,
                    &snapshot.id.name,
                    "failed to update cluster state during snapshot finalization",
                ),
            );
            self.fail_all_listeners_on_failover(&error);
        } else {
            tracing::warn!(snapshot = %snapshot, %error, "failed to finalize snapshot");
            self.remove_failed_snapshot_from_cluster_state(snapshot, error, Some(repository_data));
        }
    }

    /// Runs the next queued operation for the repository, or leaves its loop.
    fn run_next_queued_operation(
        &self,
        repository_data: RepositoryData,
        repository_name: &str,
        attempt_delete: bool,
    ) {
        debug_assert!(self
            .currently_finalizing
            .lock()
            .unwrap()
            .contains(repository_name));
        let next = self.ongoing.lock().unwrap().poll_finalization(repository_name);
        match next {
            Some(pending) => {
                tracing::trace!(snapshot = %pending.entry.snapshot, "moving on to next finalization");
                self.finalize_snapshot_entry(pending.entry, pending.metadata, repository_data);
            }
            None => {
                if attempt_delete {
                    self.run_ready_deletions(repository_data, repository_name);
                } else {
                    self.leave_repo_loop(repository_name);
                }
            }
        }
    }

    /// Checks cluster state for a STARTED deletion of the repository and runs
    /// it, or leaves the repo loop.
    fn run_ready_deletions(&self, repository_data: RepositoryData, repository_name: &str) {
        let engine = self.arc();
        let deletion_slot: Slot<DeletionEntry> = slot();
        let repository_name = repository_name.to_string();
        let task = UpdateTask::new("run ready deletions", {
            let deletion_slot = deletion_slot.clone();
            let repository_name = repository_name.clone();
            move |current: &ClusterState| {
                if let Some(deletion) = current
                    .deletions
                    .entries
                    .iter()
                    .find(|d| d.repository == repository_name && d.state == DeletionState::Started)
                {
                    put(&deletion_slot, deletion.clone());
                }
                Ok(current.clone())
            }
        })
        .on_applied({
            let engine = engine.clone();
            move |_, new| match take(&deletion_slot) {
                None => engine.run_next_queued_operation(repository_data, &repository_name, false),
                Some(deletion) => engine.delete_snapshots_from_repository(
                    &deletion,
                    Some(repository_data),
                    new.min_peer_version,
                ),
            }
        })
        .on_failure({
            move |_, error| {
                tracing::warn!(%error, "failed to run ready delete operations");
                engine.fail_all_listeners_on_failover(&error);
            }
        });
        self.bus.submit_update(task);
    }

    /// Executes a STARTED deletion against the repository.
    fn delete_snapshots_from_repository(
        &self,
        delete_entry: &DeletionEntry,
        repository_data: Option<RepositoryData>,
        min_peer_version: PeerVersion,
    ) {
        debug_assert!(delete_entry.state == DeletionState::Started);
        let repository_name = delete_entry.repository.clone();
        let repository = match self.repository(&repository_name) {
            Ok(r) => r,
            Err(e) => {
                self.fail_pending_repo_tasks(&repository_name, e);
                return;
            }
        };
        let repository_data = match repository_data {
            Some(data) => data,
            None => match repository.repository_data() {
                Ok(data) => data,
                Err(e) => {
                    self.fail_pending_repo_tasks(&repository_name, e);
                    return;
                }
            },
        };
        if !self.ongoing.lock().unwrap().start_deletion(&delete_entry.uuid) {
            return;
        }
        debug_assert!(self
            .currently_finalizing
            .lock()
            .unwrap()
            .contains(&repository_name));
        let version = min_compatible_version(
            min_peer_version,
            &repository_data,
            Some(&delete_entry.snapshots),
        );
        match repository.delete_snapshots(&delete_entry.snapshots, repository_data.gen_id, version) {
            Ok(updated) => {
                tracing::info!(
                    snapshots = ?delete_entry.snapshots.iter().map(|s| &s.name).collect::<Vec<_>>(),
                    "snapshots deleted"
                );
                self.remove_snapshot_deletion_from_cluster_state(delete_entry, None, updated);
            }
            Err(error) => {
                self.remove_snapshot_deletion_from_cluster_state(
                    delete_entry,
                    Some(error),
                    repository_data,
                );
            }
        }
    }

    /// Removes a finished deletion from the cluster state, reassigns shards
    /// that were queued behind it, and continues the repo loop.
    fn remove_snapshot_deletion_from_cluster_state(
        &self,
        delete_entry: &DeletionEntry,
        failure: Option<SnapshotError>,
        repository_data: RepositoryData,
    ) {
        let engine = self.arc();
        let delete_entry = delete_entry.clone();
        let uuid = delete_entry.uuid.clone();
        let repository_name = delete_entry.repository.clone();
        let finalizations_slot: Slot<Vec<SnapshotEntry>> = slot();
        let ready_slot: Slot<Vec<DeletionEntry>> = slot();
        let task = UpdateTask::new("remove snapshot deletion metadata", {
            let delete_entry = delete_entry.clone();
            let failure = failure.clone();
            let repository_data = repository_data.clone();
            let finalizations_slot = finalizations_slot.clone();
            let ready_slot = ready_slot.clone();
            move |current: &ClusterState| {
                let updated_deletions = current.deletions.without_entry(&delete_entry.uuid);
                if updated_deletions.entries.len() == current.deletions.entries.len() {
                    return Ok(current.clone());
                }
                // A successful delete also removes its ids from any other
                // queued deletion for the repository.
                let filtered = if failure.is_none() {
                    deletions_without_snapshots(
                        &updated_deletions,
                        &delete_entry.snapshots,
                        &delete_entry.repository,
                    )
                    .unwrap_or(updated_deletions)
                } else {
                    updated_deletions
                };
                let outcome = unblock_entries_after_delete_removal(
                    current,
                    &delete_entry,
                    &filtered,
                    &repository_data,
                );
                put(&finalizations_slot, outcome.new_finalizations);
                let state = current.with_updates(outcome.snapshots, Some(filtered));
                let ready = ready_deletions(&state.snapshots, &state.deletions);
                put(&ready_slot, ready.ready);
                Ok(state.with_updates(None, ready.deletions))
            }
        })
        .on_applied({
            let engine = engine.clone();
            let uuid = uuid.clone();
            let repository_name = repository_name.clone();
            move |_, new| {
                engine.ongoing.lock().unwrap().finish_deletion(&uuid);
                let delete_listeners = engine.listeners.take_deletions(&uuid);
                match &failure {
                    None => complete_deletion_listeners(delete_listeners),
                    Some(error) => fail_deletion_listeners(delete_listeners, error),
                }
                let finalizations = take(&finalizations_slot).unwrap_or_default();
                if finalizations.is_empty() {
                    let ready = take(&ready_slot).unwrap_or_default();
                    if ready.iter().all(|d| d.repository != repository_name) {
                        engine.leave_repo_loop(&repository_name);
                    }
                    for deletion in ready {
                        if deletion.repository == repository_name {
                            engine.delete_snapshots_from_repository(
                                &deletion,
                                Some(repository_data.clone()),
                                new.min_peer_version,
                            );
                        } else if engine.try_enter_repo_loop(&deletion.repository) {
                            engine.delete_snapshots_from_repository(
                                &deletion,
                                None,
                                new.min_peer_version,
                            );
                        }
                    }
                } else {
                    engine.leave_repo_loop(&repository_name);
                    for entry in finalizations {
                        engine.end_snapshot(&entry, &new.metadata, Some(repository_data.clone()));
                    }
                }
            }
        })
        .on_failure({
            move |_, error| {
                tracing::warn!(%uuid, %error, "failed to remove snapshot deletion metadata");
                engine.ongoing.lock().unwrap().finish_deletion(&uuid);
                engine.fail_all_listeners_on_failover(&error);
            }
        });
        self.bus.submit_update(task);
    }

    /// Removes a failed snapshot's entry from the cluster state and fails its
    /// listeners. Used when the snapshot cannot finalize normally.
    fn remove_failed_snapshot_from_cluster_state(
        &self,
        snapshot: &Snapshot,
        failure: SnapshotError,
        repository_data: Option<RepositoryData>,
    ) {
        let engine = self.arc();
        let snapshot = snapshot.clone();
        let task = UpdateTask::new("remove snapshot metadata", {
            let snapshot = snapshot.clone();
            move |current: &ClusterState| {
                let snapshots = state_without_snapshot(&current.snapshots, &snapshot);
                let state = current.with_updates(snapshots, None);
                let ready = ready_deletions(&state.snapshots, &state.deletions);
                let state = state.with_updates(None, ready.deletions);
                let deletions = deletions_without_snapshots(
                    &state.deletions,
                    std::slice::from_ref(&snapshot.id),
                    &snapshot.repository,
                );
                Ok(state.with_updates(None, deletions))
            }
        })
        .on_applied({
            let engine = engine.clone();
            let snapshot = snapshot.clone();
            let failure = failure.clone();
            move |_, _| {
                engine.fail_snapshot_completion_listeners(&snapshot, &failure);
                if let Some(data) = repository_data {
                    engine.run_next_queued_operation(data, &snapshot.repository, true);
                }
            }
        })
        .on_failure({
            move |_, error| {
                tracing::warn!(snapshot = %snapshot, %error, "failed to remove snapshot metadata");
                engine.fail_snapshot_completion_listeners(&snapshot, &failure);
                engine.fail_all_listeners_on_failover(&error);
            }
        });
        self.bus.submit_update(task);
    }

    /// Removes every snapshot and deletion entry of a repository whose
    /// repository data can no longer be read, failing all their listeners.
    fn fail_pending_repo_tasks(&self, repository_name: &str, failure: SnapshotError) {
        let engine = self.arc();
        let repository_name = repository_name.to_string();
        let snapshots_slot: Slot<Vec<Snapshot>> = slot();
        let deletions_slot: Slot<Vec<String>> = slot();
        let task = UpdateTask::new(format!("fail repo tasks for [{}]", repository_name), {
            let repository_name = repository_name.clone();
            let snapshots_slot = snapshots_slot.clone();
            let deletions_slot = deletions_slot.clone();
            move |current: &ClusterState| {
                let mut snapshots_to_fail = Vec::new();
                let mut deletions_to_fail = Vec::new();
                let entries: Vec<SnapshotEntry> = current
                    .snapshots
                    .entries
                    .iter()
                    .filter(|e| {
                        if e.repository() == repository_name {
                            snapshots_to_fail.push(e.snapshot.clone());
                            false
                        } else {
                            true
                        }
                    })
                    .cloned()
                    .collect();
                let deletions: Vec<DeletionEntry> = current
                    .deletions
                    .entries
                    .iter()
                    .filter(|d| {
                        if d.repository == repository_name {
                            deletions_to_fail.push(d.uuid.clone());
                            false
                        } else {
                            true
                        }
                    })
                    .cloned()
                    .collect();
                put(&snapshots_slot, snapshots_to_fail);
                put(&deletions_slot, deletions_to_fail);
                Ok(current.with_updates(
                    Some(SnapshotsInProgress::of(entries)),
                    Some(crate::entries::SnapshotDeletionsInProgress::of(deletions)),
                ))
            }
        })
        .on_applied({
            let engine = engine.clone();
            let failure = failure.clone();
            let repository_name = repository_name.clone();
            move |_, _| {
                let wrapped = SnapshotError::repository(
                    &repository_name,
                    format!("failed to read repository data: {}", failure),
                );
                for uuid in take(&deletions_slot).unwrap_or_default() {
                    engine.ongoing.lock().unwrap().finish_deletion(&uuid);
                    fail_deletion_listeners(engine.listeners.take_deletions(&uuid), &wrapped);
                }
                for snapshot in take(&snapshots_slot).unwrap_or_default() {
                    engine.fail_snapshot_completion_listeners(&snapshot, &failure);
                }
                engine.currently_finalizing.lock().unwrap().remove(&repository_name);
            }
        })
        .on_failure({
            move |_, error| {
                tracing::warn!(%error, "failed to remove repository operations from cluster state");
                engine.fail_all_listeners_on_failover(&error);
            }
        });
        self.bus.submit_update(task);
    }

    // ---------------------------------------------------------------------
    // Failover handling

    fn end_and_get_listeners(&self, snapshot: &Snapshot) -> Vec<CompletionListener> {
        // Take the listeners before clearing the ending marker so consistency
        // checks never observe listeners without a tracked snapshot.
        let listeners = self.listeners.take_completions(snapshot);
        self.ending_snapshots.lock().unwrap().remove(snapshot);
        listeners
    }

    fn fail_snapshot_completion_listeners(&self, snapshot: &Snapshot, error: &SnapshotError) {
        let listeners = self.end_and_get_listeners(snapshot);
        fail_completion_listeners(listeners, error);
        debug_assert!(self.ongoing.lock().unwrap().not_queued(snapshot));
    }

    /// Fails every pending listener because this node can no longer publish
    /// cluster state. The next elected cluster-manager reconciles all
    /// remaining entries from the replicated state.
    fn fail_all_listeners_on_failover(&self, error: &SnapshotError) {
        tracing::debug!(%error, "failing all snapshot operation listeners");
        let mut completion_batches: Vec<Vec<CompletionListener>> = Vec::new();
        let mut deletion_listeners: Vec<DeletionListener> = Vec::new();
        let manager_failure = error.is_cluster_manager_failure();
        {
            let mut finalizing = self.currently_finalizing.lock().unwrap();
            if manager_failure {
                self.ongoing.lock().unwrap().clear();
                for snapshot in self.listeners.completion_snapshots() {
                    let listeners = self.listeners.take_completions(&snapshot);
                    self.ending_snapshots.lock().unwrap().remove(&snapshot);
                    completion_batches.push(listeners);
                }
                deletion_listeners = self.listeners.take_all_deletions();
            } else {
                debug_assert!(false, "state update failed without losing the cluster-manager role");
                tracing::error!(%error, "unexpected failure during cluster state update");
            }
            finalizing.clear();
        }
        if manager_failure {
            let failure = SnapshotError::NotClusterManager("no longer cluster-manager".to_string());
            for listeners in completion_batches {
                fail_completion_listeners(listeners, &failure);
            }
            let wrapped = SnapshotError::repository(
                "_all",
                "failed to update cluster state during repository operation",
            );
            fail_deletion_listeners(deletion_listeners, &wrapped);
        }
    }

    // ---------------------------------------------------------------------
    // Cluster state reaction

    /// Proposes a reaction pass after node or routing changes.
    fn process_external_changes(&self, changed_nodes: bool, start_shards: bool) {
        if !changed_nodes && !start_shards {
            return;
        }
        let engine = self.arc();
        let finished_slot: Slot<Vec<SnapshotEntry>> = slot();
        let deletions_slot: Slot<Vec<DeletionEntry>> = slot();
        let task = UpdateTask::new(
            format!(
                "update snapshot state after shards started [{}] or nodes changed [{}]",
                start_shards, changed_nodes
            ),
            {
                let engine = engine.clone();
                let finished_slot = finished_slot.clone();
                let deletions_slot = deletions_slot.clone();
                move |current: &ClusterState| {
                    let initializing = engine.initializing_clones.lock().unwrap().clone();
                    let outcome =
                        reactive::process_external_changes(current, changed_nodes, &initializing);
                    put(&finished_slot, outcome.finished);
                    let state = current.with_updates(outcome.snapshots, None);
                    let ready = ready_deletions(&state.snapshots, &state.deletions);
                    let state = state.with_updates(None, ready.deletions);
                    put(
                        &deletions_slot,
                        state
                            .deletions
                            .entries
                            .iter()
                            .filter(|d| d.state == DeletionState::Started)
                            .cloned()
                            .collect(),
                    );
                    Ok(state)
                }
            },
        )
        .on_applied({
            let engine = engine.clone();
            move |_, new| {
                let repos_with_running_deletes: BTreeSet<&str> = new
                    .deletions
                    .entries
                    .iter()
                    .filter(|d| d.state == DeletionState::Started)
                    .map(|d| d.repository.as_str())
                    .collect();
                for entry in take(&finished_slot).unwrap_or_default() {
                    // A running delete will pick up finished entries itself
                    // when it is removed from the state.
                    if !repos_with_running_deletes.contains(entry.repository()) {
                        engine.end_snapshot(&entry, &new.metadata, None);
                    }
                }
                engine.start_executable_clones(new, None);
                for deletion in take(&deletions_slot).unwrap_or_default() {
                    if engine.try_enter_repo_loop(&deletion.repository) {
                        engine.delete_snapshots_from_repository(&deletion, None, new.min_peer_version);
                    }
                }
            }
        })
        .on_failure(|source, error| {
            tracing::warn!(source, %error, "failed to update snapshot state after external change");
        });
        self.bus.submit_update(task);
    }

    #[cfg(debug_assertions)]
    fn assert_consistent_with_cluster_state(&self, state: &ClusterState) {
        let running: HashSet<Snapshot> = state
            .snapshots
            .entries
            .iter()
            .map(|e| e.snapshot.clone())
            .chain(self.ending_snapshots.lock().unwrap().iter().cloned())
            .collect();
        for snapshot in self.listeners.completion_snapshots() {
            debug_assert!(
                running.contains(&snapshot),
                "completion listener for untracked snapshot {}",
                snapshot
            );
        }
        // The oldest entry of a repository may only have queued shards while
        // a deletion of that repository is running.
        let mut repos_seen = HashSet::new();
        for entry in &state.snapshots.entries {
            if repos_seen.insert(entry.repository().to_string()) {
                let queued = entry
                    .shards
                    .values()
                    .any(|s| s.is_unassigned_queued());
                if queued {
                    debug_assert!(
                        state.deletions.has_started_for_repo(entry.repository()),
                        "queued shard in {} without a running delete",
                        entry.snapshot
                    );
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Read APIs

    /// In-progress entries for a repository, optionally filtered by snapshot
    /// names or patterns. `_all` matches every repository.
    pub fn current_snapshots(
        state: &ClusterState,
        repository: &str,
        names: &[String],
    ) -> Vec<SnapshotEntry> {
        state
            .snapshots
            .entries
            .iter()
            .filter(|entry| repository == "_all" || entry.repository() == repository)
            .filter(|entry| names.is_empty() || simple_match_any(names, &entry.snapshot.id.name))
            .cloned()
            .collect()
    }

    /// Indices being snapshotted by non-partial entries, limited to the
    /// candidate set. Used by index-deletion safety checks.
    pub fn snapshotting_indices(
        state: &ClusterState,
        candidates: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        let mut indices = BTreeSet::new();
        for entry in &state.snapshots.entries {
            if entry.partial {
                continue;
            }
            for index in &entry.indices {
                if state.metadata.indices.contains_key(&index.name)
                    && candidates.contains(&index.name)
                {
                    indices.insert(index.name.clone());
                }
            }
        }
        indices
    }

    /// Data streams being snapshotted by non-partial entries, limited to the
    /// candidate set.
    pub fn snapshotting_data_streams(
        state: &ClusterState,
        candidates: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        let mut streams = BTreeSet::new();
        for entry in &state.snapshots.entries {
            if entry.partial {
                continue;
            }
            for stream in &entry.data_streams {
                if state.metadata.data_streams.contains_key(stream) && candidates.contains(stream) {
                    streams.insert(stream.clone());
                }
            }
        }
        streams
    }
}

impl ClusterStateApplier for SnapshotEngine {
    fn apply_cluster_state(&self, event: &ClusterChangedEvent) {
        if event.local_node_cluster_manager() {
            let snapshots = &event.current.snapshots;
            let changed_nodes = event.new_cluster_manager()
                || reactive::removed_nodes_cleanup_needed(snapshots, &event.removed_nodes());
            let start_shards =
                event.routing_changed() && reactive::waiting_shards_started_or_unassigned(event);
            self.process_external_changes(changed_nodes, start_shards);
        } else if self.listeners.has_completions() {
            // Not the cluster-manager anymore: fail every waiting listener
            // except those already finalizing, which fail on their own
            // publication attempt.
            for snapshot in self.listeners.completion_snapshots() {
                if self.ending_snapshots.lock().unwrap().insert(snapshot.clone()) {
                    self.fail_snapshot_completion_listeners(
                        &snapshot,
                        &SnapshotError::NotClusterManager("no longer cluster-manager".to_string()),
                    );
                }
            }
        }
        #[cfg(debug_assertions)]
        self.assert_consistent_with_cluster_state(&event.current);
    }
}

/// Record of what a delete admission decided, consumed after apply.
#[derive(Default)]
struct DeleteAdmission {
    new_delete: Option<DeletionEntry>,
    reused_existing: bool,
    /// Entries dropped from the state because they had no started work;
    /// their listeners resolve with an aborted failure.
    completed_no_cleanup: Vec<Snapshot>,
    /// Aborted entries whose shards were already all complete; they finalize
    /// after this update.
    completed_with_cleanup: Vec<SnapshotEntry>,
}

/// Bookkeeping for the legacy delete path.
struct LegacyDelete {
    running: Snapshot,
    outstanding: Vec<SnapshotId>,
    aborted_during_init: bool,
}

fn ensure_snapshot_name_available(
    repository_data: &RepositoryData,
    repository: &str,
    name: &str,
) -> Result<(), SnapshotError> {
    if repository_data.has_snapshot_name(name) {
        return Err(SnapshotError::invalid_name(
            repository,
            name,
            "snapshot with the same name already exists",
        ));
    }
    Ok(())
}

fn ensure_snapshot_name_not_running(
    snapshots: &SnapshotsInProgress,
    repository: &str,
    name: &str,
) -> Result<(), SnapshotError> {
    if snapshots
        .for_repo(repository)
        .any(|e| e.snapshot.id.name == name)
    {
        return Err(SnapshotError::invalid_name(
            repository,
            name,
            "snapshot with the same name is already in-progress",
        ));
    }
    Ok(())
}

fn ensure_no_cleanup_in_progress(
    state: &ClusterState,
    repository: &str,
    name: &str,
) -> Result<(), SnapshotError> {
    if state.cleanups_in_progress.contains(repository) {
        return Err(SnapshotError::concurrent(
            repository,
            name,
            "cannot snapshot while a repository cleanup is in-progress",
        ));
    }
    Ok(())
}

/// Collects the shard generations a finalization writes to the repository.
fn build_generations(entry: &SnapshotEntry) -> Vec<(IndexId, u32, ShardGeneration)> {
    let mut generations = Vec::new();
    if entry.is_clone() {
        for (repo_shard, status) in &entry.clones {
            if let Some(generation) = &status.generation {
                generations.push((repo_shard.index.clone(), repo_shard.shard, generation.clone()));
            }
        }
    } else {
        let lookup: BTreeMap<&str, &IndexId> = entry
            .indices
            .iter()
            .map(|i| (i.name.as_str(), i))
            .collect();
        for (shard_id, status) in &entry.shards {
            let Some(index) = lookup.get(shard_id.index.as_str()) else {
                continue;
            };
            if let Some(generation) = &status.generation {
                generations.push(((*index).clone(), shard_id.shard, generation.clone()));
            }
        }
    }
    generations
}

/// Shard counts per index repository id, recorded for later clones.
fn shard_counts_for_entry(entry: &SnapshotEntry, metadata: &Metadata) -> BTreeMap<String, u32> {
    let mut counts = BTreeMap::new();
    if entry.is_clone() {
        for repo_shard in entry.clones.keys() {
            let count = counts.entry(repo_shard.index.id.clone()).or_insert(0);
            *count = (*count).max(repo_shard.shard + 1);
        }
    } else {
        for index in &entry.indices {
            if let Some(meta) = metadata.indices.get(&index.name) {
                counts.insert(index.id.clone(), meta.shard_count);
            }
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_compatible_version_empty_repo() {
        let data = RepositoryData::empty();
        assert_eq!(
            min_compatible_version(PeerVersion::CURRENT, &data, None),
            PeerVersion::CURRENT
        );
    }

    #[test]
    fn test_min_compatible_version_old_snapshot() {
        let mut data = RepositoryData::empty();
        let old = SnapshotId::new("old");
        data.versions.insert(old.uuid.clone(), PeerVersion::new(5));
        data.snapshots.push(old.clone());
        assert_eq!(
            min_compatible_version(PeerVersion::CURRENT, &data, None),
            PeerVersion::new(5)
        );
        // Excluding the old snapshot lifts the version again.
        assert_eq!(
            min_compatible_version(PeerVersion::CURRENT, &data, Some(&[old])),
            PeerVersion::CURRENT
        );
    }

    #[test]
    fn test_use_shard_generations_gate() {
        assert!(use_shard_generations(PeerVersion::CURRENT));
        assert!(!use_shard_generations(PeerVersion::new(3)));
    }

    #[test]
    fn test_build_generations_skips_missing_index() {
        let entry = SnapshotEntry::started(
            Snapshot::new("repo", SnapshotId::new("s")),
            false,
            true,
            vec![IndexId::with_id("idx", "iid")],
            vec![],
            0,
            RepoGeneration::new(0),
            [
                (
                    ShardId::new("idx", 0),
                    crate::types::ShardSnapshotStatus::success(None, ShardGeneration::new("g0")),
                ),
                (
                    ShardId::new("gone", 0),
                    crate::types::ShardSnapshotStatus::missing("missing index", None),
                ),
            ]
            .into_iter()
            .collect(),
            None,
            PeerVersion::CURRENT,
        );
        let generations = build_generations(&entry);
        assert_eq!(generations.len(), 1);
        assert_eq!(generations[0].0.name, "idx");
        assert_eq!(generations[0].2.as_str(), "g0");
    }

    #[test]
    fn test_shard_counts_for_clone_entry() {
        let index = IndexId::with_id("idx", "iid");
        let mut entry = SnapshotEntry::start_clone(
            Snapshot::new("repo", SnapshotId::new("c")),
            SnapshotId::new("src"),
            vec![index.clone()],
            0,
            RepoGeneration::new(0),
            PeerVersion::CURRENT,
        );
        entry.clones.insert(
            RepositoryShardId::new(index.clone(), 0),
            crate::types::ShardSnapshotStatus::unassigned_queued(),
        );
        entry.clones.insert(
            RepositoryShardId::new(index, 2),
            crate::types::ShardSnapshotStatus::unassigned_queued(),
        );
        let counts = shard_counts_for_entry(&entry, &Metadata::default());
        assert_eq!(counts["iid"], 3);
    }
}
