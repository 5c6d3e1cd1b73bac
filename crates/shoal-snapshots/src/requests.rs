//! Request types accepted by the engine's public operations.

use serde::{Deserialize, Serialize};

/// Request to create a snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    /// Target repository.
    pub repository: String,
    /// Snapshot name.
    pub name: String,
    /// Index and data stream patterns; empty means everything.
    pub indices: Vec<String>,
    /// Whether to include cluster-wide metadata.
    pub include_global_state: bool,
    /// Whether the snapshot may complete with failed shards.
    pub partial: bool,
    /// Opaque caller metadata stored with the snapshot.
    pub user_metadata: Option<serde_json::Value>,
}

impl CreateSnapshotRequest {
    /// Creates a request snapshotting everything in the repository.
    pub fn new(repository: impl Into<String>, name: impl Into<String>) -> Self {
        CreateSnapshotRequest {
            repository: repository.into(),
            name: name.into(),
            indices: Vec::new(),
            include_global_state: true,
            partial: false,
            user_metadata: None,
        }
    }

    /// Restricts the snapshot to the given index patterns.
    pub fn indices(mut self, indices: Vec<String>) -> Self {
        self.indices = indices;
        self
    }

    /// Sets whether failed shards abort the snapshot.
    pub fn partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }
}

/// Request to clone part of an existing snapshot into a new one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloneSnapshotRequest {
    /// Target repository.
    pub repository: String,
    /// Name of the source snapshot.
    pub source: String,
    /// Name of the clone to create.
    pub target: String,
    /// Index patterns to clone; empty means all source indices.
    pub indices: Vec<String>,
}

impl CloneSnapshotRequest {
    /// Creates a clone request for all indices of the source.
    pub fn new(
        repository: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        CloneSnapshotRequest {
            repository: repository.into(),
            source: source.into(),
            target: target.into(),
            indices: vec!["*".to_string()],
        }
    }

    /// Restricts the clone to the given index patterns.
    pub fn indices(mut self, indices: Vec<String>) -> Self {
        self.indices = indices;
        self
    }
}

/// Request to delete snapshots by name or glob pattern.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteSnapshotRequest {
    /// Target repository.
    pub repository: String,
    /// Snapshot names or `*` patterns.
    pub snapshots: Vec<String>,
}

impl DeleteSnapshotRequest {
    /// Creates a delete request.
    pub fn new(repository: impl Into<String>, snapshots: Vec<String>) -> Self {
        DeleteSnapshotRequest {
            repository: repository.into(),
            snapshots,
        }
    }
}
