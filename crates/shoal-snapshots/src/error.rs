//! Error types for the snapshot orchestration engine.

use thiserror::Error;

/// Errors surfaced by snapshot operations.
///
/// Variant names are part of the wire surface: RPC handlers map them 1:1 to
/// transport error codes, so they must stay stable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// The operation conflicts with another in-progress snapshot operation.
    #[error("[{repository}:{name}] concurrent snapshot execution: {reason}")]
    ConcurrentSnapshotExecution {
        /// Repository the operation targeted.
        repository: String,
        /// Snapshot name of the rejected operation.
        name: String,
        /// Why the operation could not run concurrently.
        reason: String,
    },

    /// The requested snapshot name is not acceptable.
    #[error("[{repository}:{name}] invalid snapshot name: {reason}")]
    InvalidSnapshotName {
        /// Repository the operation targeted.
        repository: String,
        /// The offending name.
        name: String,
        /// Which naming rule was violated.
        reason: String,
    },

    /// The named snapshot does not exist in the repository.
    #[error("[{repository}:{name}] snapshot is missing")]
    SnapshotMissing {
        /// Repository that was searched.
        repository: String,
        /// Name that was not found.
        name: String,
    },

    /// A snapshot-level execution failure.
    #[error("[{repository}:{name}] {reason}")]
    SnapshotException {
        /// Repository of the failed snapshot.
        repository: String,
        /// Name of the failed snapshot.
        name: String,
        /// Failure description.
        reason: String,
    },

    /// A repository-level failure.
    #[error("[{repository}] repository error: {reason}")]
    RepositoryException {
        /// The repository that failed.
        repository: String,
        /// Failure description.
        reason: String,
    },

    /// The repository is not registered with the cluster.
    #[error("[{0}] repository is missing")]
    RepositoryMissing(String),

    /// The local node is no longer the elected cluster-manager.
    #[error("no longer cluster-manager: {0}")]
    NotClusterManager(String),

    /// A proposed cluster state failed to commit to a majority.
    #[error("failed to commit cluster state: {0}")]
    FailedToCommitClusterState(String),
}

impl SnapshotError {
    /// Builds a [`SnapshotError::ConcurrentSnapshotExecution`].
    pub fn concurrent(repository: &str, name: &str, reason: impl Into<String>) -> Self {
        SnapshotError::ConcurrentSnapshotExecution {
            repository: repository.to_string(),
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Builds a [`SnapshotError::InvalidSnapshotName`].
    pub fn invalid_name(repository: &str, name: &str, reason: impl Into<String>) -> Self {
        SnapshotError::InvalidSnapshotName {
            repository: repository.to_string(),
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Builds a [`SnapshotError::SnapshotMissing`].
    pub fn missing(repository: &str, name: &str) -> Self {
        SnapshotError::SnapshotMissing {
            repository: repository.to_string(),
            name: name.to_string(),
        }
    }

    /// Builds a [`SnapshotError::SnapshotException`].
    pub fn snapshot(repository: &str, name: &str, reason: impl Into<String>) -> Self {
        SnapshotError::SnapshotException {
            repository: repository.to_string(),
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Builds a [`SnapshotError::RepositoryException`].
    pub fn repository(repository: &str, reason: impl Into<String>) -> Self {
        SnapshotError::RepositoryException {
            repository: repository.to_string(),
            reason: reason.into(),
        }
    }

    /// True for failures that mean this node can no longer publish cluster
    /// state. Such failures must not trigger further state writes; the next
    /// elected cluster-manager reconciles instead.
    pub fn is_cluster_manager_failure(&self) -> bool {
        matches!(
            self,
            SnapshotError::NotClusterManager(_) | SnapshotError::FailedToCommitClusterState(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrent_display() {
        let err = SnapshotError::concurrent("repo", "snap", "a deletion is running");
        assert_eq!(
            format!("{}", err),
            "[repo:snap] concurrent snapshot execution: a deletion is running"
        );
    }

    #[test]
    fn test_repository_missing_display() {
        let err = SnapshotError::RepositoryMissing("backup".to_string());
        assert_eq!(format!("{}", err), "[backup] repository is missing");
    }

    #[test]
    fn test_cluster_manager_failure_classification() {
        assert!(SnapshotError::NotClusterManager("stepped down".into()).is_cluster_manager_failure());
        assert!(
            SnapshotError::FailedToCommitClusterState("publication timed out".into())
                .is_cluster_manager_failure()
        );
        assert!(!SnapshotError::missing("r", "s").is_cluster_manager_failure());
        assert!(!SnapshotError::repository("r", "io error").is_cluster_manager_failure());
    }
}
