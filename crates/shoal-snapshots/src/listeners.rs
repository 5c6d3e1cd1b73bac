//! Typed registries of pending completion and deletion callbacks.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::SnapshotError;
use crate::repository::{RepositoryData, SnapshotInfo};
use crate::types::Snapshot;

/// Outcome delivered to snapshot completion listeners.
pub type CompletionResult = Result<(RepositoryData, SnapshotInfo), SnapshotError>;

/// Callback resolved when a snapshot finishes finalizing or fails.
pub type CompletionListener = Box<dyn FnOnce(CompletionResult) + Send>;

/// Callback resolved when a deletion finishes or fails.
pub type DeletionListener = Box<dyn FnOnce(Result<(), SnapshotError>) + Send>;

/// Pending callbacks keyed by snapshot and by deletion uuid. Delivery is
/// iterate-and-clear: taking the listeners removes them under the lock, then
/// they are invoked outside it.
#[derive(Default)]
pub struct ListenerRegistry {
    completions: Mutex<HashMap<Snapshot, Vec<CompletionListener>>>,
    deletions: Mutex<HashMap<String, Vec<DeletionListener>>>,
}

impl ListenerRegistry {
    /// Registers a completion listener for a snapshot.
    pub fn add_completion(&self, snapshot: Snapshot, listener: CompletionListener) {
        self.completions
            .lock()
            .unwrap()
            .entry(snapshot)
            .or_default()
            .push(listener);
    }

    /// Takes all completion listeners of a snapshot.
    pub fn take_completions(&self, snapshot: &Snapshot) -> Vec<CompletionListener> {
        self.completions
            .lock()
            .unwrap()
            .remove(snapshot)
            .unwrap_or_default()
    }

    /// Snapshots that currently have completion listeners.
    pub fn completion_snapshots(&self) -> Vec<Snapshot> {
        self.completions.lock().unwrap().keys().cloned().collect()
    }

    /// True if any completion listener is pending.
    pub fn has_completions(&self) -> bool {
        !self.completions.lock().unwrap().is_empty()
    }

    /// Registers a deletion listener under the deletion's uuid.
    pub fn add_deletion(&self, uuid: impl Into<String>, listener: DeletionListener) {
        self.deletions
            .lock()
            .unwrap()
            .entry(uuid.into())
            .or_default()
            .push(listener);
    }

    /// Takes all listeners of a deletion.
    pub fn take_deletions(&self, uuid: &str) -> Vec<DeletionListener> {
        self.deletions
            .lock()
            .unwrap()
            .remove(uuid)
            .unwrap_or_default()
    }

    /// Takes every pending deletion listener.
    pub fn take_all_deletions(&self) -> Vec<DeletionListener> {
        self.deletions
            .lock()
            .unwrap()
            .drain()
            .flat_map(|(_, listeners)| listeners)
            .collect()
    }
}

/// Resolves completion listeners with a shared success value.
pub fn complete_completion_listeners(
    listeners: Vec<CompletionListener>,
    repository_data: &RepositoryData,
    info: &SnapshotInfo,
) {
    for listener in listeners {
        listener(Ok((repository_data.clone(), info.clone())));
    }
}

/// Fails completion listeners with a shared error.
pub fn fail_completion_listeners(listeners: Vec<CompletionListener>, error: &SnapshotError) {
    for listener in listeners {
        listener(Err(error.clone()));
    }
}

/// Resolves deletion listeners successfully.
pub fn complete_deletion_listeners(listeners: Vec<DeletionListener>) {
    for listener in listeners {
        listener(Ok(()));
    }
}

/// Fails deletion listeners with a shared error.
pub fn fail_deletion_listeners(listeners: Vec<DeletionListener>, error: &SnapshotError) {
    for listener in listeners {
        listener(Err(error.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SnapshotId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn snapshot() -> Snapshot {
        Snapshot::new("repo", SnapshotId::with_uuid("s", "u"))
    }

    #[test]
    fn test_completion_listeners_taken_once() {
        let registry = ListenerRegistry::default();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        registry.add_completion(snapshot(), Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(registry.has_completions());
        let listeners = registry.take_completions(&snapshot());
        assert_eq!(listeners.len(), 1);
        assert!(registry.take_completions(&snapshot()).is_empty());
        fail_completion_listeners(listeners, &SnapshotError::missing("repo", "s"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!registry.has_completions());
    }

    #[test]
    fn test_deletion_listeners_by_uuid() {
        let registry = ListenerRegistry::default();
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        let c2 = count.clone();
        registry.add_deletion("u1", Box::new(move |r| {
            assert!(r.is_ok());
            c1.fetch_add(1, Ordering::SeqCst);
        }));
        registry.add_deletion("u2", Box::new(move |r| {
            assert!(r.is_ok());
            c2.fetch_add(1, Ordering::SeqCst);
        }));
        complete_deletion_listeners(registry.take_deletions("u1"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        complete_deletion_listeners(registry.take_all_deletions());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_completion_snapshots_listing() {
        let registry = ListenerRegistry::default();
        registry.add_completion(snapshot(), Box::new(|_| {}));
        assert_eq!(registry.completion_snapshots(), vec![snapshot()]);
    }
}
