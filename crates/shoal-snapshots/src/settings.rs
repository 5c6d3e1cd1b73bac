//! Dynamic engine settings.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Default value of `snapshot.max_concurrent_operations`.
pub const DEFAULT_MAX_CONCURRENT_OPERATIONS: usize = 1000;

/// Runtime-updatable snapshot settings.
pub struct SnapshotSettings {
    max_concurrent_operations: AtomicUsize,
}

impl SnapshotSettings {
    /// Creates settings with an explicit concurrency limit (clamped to 1).
    pub fn new(max_concurrent_operations: usize) -> Self {
        SnapshotSettings {
            max_concurrent_operations: AtomicUsize::new(max_concurrent_operations.max(1)),
        }
    }

    /// Upper bound on concurrently admitted snapshot and deletion operations.
    pub fn max_concurrent_operations(&self) -> usize {
        self.max_concurrent_operations.load(Ordering::Relaxed)
    }

    /// Updates the concurrency limit at runtime. Values below 1 are clamped.
    pub fn set_max_concurrent_operations(&self, limit: usize) {
        self.max_concurrent_operations
            .store(limit.max(1), Ordering::Relaxed);
    }
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        SnapshotSettings::new(DEFAULT_MAX_CONCURRENT_OPERATIONS)
    }
}
