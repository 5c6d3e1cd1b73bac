//! Serialized cluster-state update queue.
//!
//! Models the consensus layer's update-task framework: tasks are applied one
//! at a time in priority order, every applied change is pushed to registered
//! appliers, and only then is the submitting task's listener notified. This
//! makes the engine logically single-threaded with respect to state
//! transitions, exactly like the real publication pipeline, while staying
//! fully deterministic for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use crate::cluster::{ClusterChangedEvent, ClusterState};
use crate::error::SnapshotError;

/// Scheduling priority of an update task.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Default priority.
    Normal,
    /// Jumps ahead of all queued normal-priority tasks.
    Immediate,
}

type ExecuteFn = Box<dyn FnOnce(&ClusterState) -> Result<ClusterState, SnapshotError> + Send>;
type AppliedFn = Box<dyn FnOnce(&ClusterState, &ClusterState) + Send>;
type FailureFn = Box<dyn FnOnce(&str, SnapshotError) + Send>;

/// One proposed cluster-state transition plus its completion callbacks.
pub struct UpdateTask {
    source: String,
    priority: Priority,
    execute: ExecuteFn,
    on_applied: Option<AppliedFn>,
    on_failure: Option<FailureFn>,
}

impl UpdateTask {
    /// Creates a task with the given source tag and transition function. The
    /// transition receives the current state and returns the proposed state
    /// or an admission error.
    pub fn new(
        source: impl Into<String>,
        execute: impl FnOnce(&ClusterState) -> Result<ClusterState, SnapshotError> + Send + 'static,
    ) -> Self {
        UpdateTask {
            source: source.into(),
            priority: Priority::Normal,
            execute: Box::new(execute),
            on_applied: None,
            on_failure: None,
        }
    }

    /// Sets the callback invoked after the new state has been applied and all
    /// appliers have observed it.
    pub fn on_applied(
        mut self,
        f: impl FnOnce(&ClusterState, &ClusterState) + Send + 'static,
    ) -> Self {
        self.on_applied = Some(Box::new(f));
        self
    }

    /// Sets the callback invoked when the transition is rejected or the
    /// publication fails.
    pub fn on_failure(mut self, f: impl FnOnce(&str, SnapshotError) + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(f));
        self
    }

    /// Sets the scheduling priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Observer of applied cluster-state changes.
pub trait ClusterStateApplier: Send + Sync {
    /// Called after every applied change, before task listeners run.
    fn apply_cluster_state(&self, event: &ClusterChangedEvent);
}

struct PublishFailpoint {
    source_fragment: Option<String>,
    error: SnapshotError,
}

struct BusInner {
    state: Arc<ClusterState>,
    queue: VecDeque<UpdateTask>,
    pumping: bool,
    publish_failure: Option<PublishFailpoint>,
}

/// The cluster-state update queue.
pub struct ClusterStateBus {
    inner: Mutex<BusInner>,
    appliers: Mutex<Vec<Weak<dyn ClusterStateApplier>>>,
}

impl ClusterStateBus {
    /// Creates a bus seeded with an initial state.
    pub fn new(initial: ClusterState) -> Arc<Self> {
        Arc::new(ClusterStateBus {
            inner: Mutex::new(BusInner {
                state: Arc::new(initial),
                queue: VecDeque::new(),
                pumping: false,
                publish_failure: None,
            }),
            appliers: Mutex::new(Vec::new()),
        })
    }

    /// The most recently applied state.
    pub fn state(&self) -> Arc<ClusterState> {
        self.inner.lock().unwrap().state.clone()
    }

    /// Registers an applied-state observer. Held weakly.
    pub fn add_applier(&self, applier: Arc<dyn ClusterStateApplier>) {
        self.appliers.lock().unwrap().push(Arc::downgrade(&applier));
    }

    /// Makes the next successful transition fail at publication time with the
    /// given error instead of being applied. Failpoint for exercising
    /// cluster-manager failover handling.
    pub fn fail_next_publish(&self, error: SnapshotError) {
        self.inner.lock().unwrap().publish_failure = Some(PublishFailpoint {
            source_fragment: None,
            error,
        });
    }

    /// Like [`fail_next_publish`](Self::fail_next_publish), but only trips on
    /// the first transition whose source tag contains `source_fragment`.
    pub fn fail_next_publish_matching(&self, source_fragment: impl Into<String>, error: SnapshotError) {
        self.inner.lock().unwrap().publish_failure = Some(PublishFailpoint {
            source_fragment: Some(source_fragment.into()),
            error,
        });
    }

    /// Enqueues a task and drains the queue unless a drain is already in
    /// progress (tasks submitted from inside callbacks are picked up by the
    /// active drain).
    pub fn submit_update(&self, task: UpdateTask) {
        {
            let mut inner = self.inner.lock().unwrap();
            match task.priority {
                Priority::Immediate => {
                    let pos = inner
                        .queue
                        .iter()
                        .position(|t| t.priority != Priority::Immediate)
                        .unwrap_or(inner.queue.len());
                    inner.queue.insert(pos, task);
                }
                Priority::Normal => inner.queue.push_back(task),
            }
        }
        self.pump();
    }

    fn pump(&self) {
        loop {
            let task = {
                let mut inner = self.inner.lock().unwrap();
                if inner.pumping {
                    return;
                }
                match inner.queue.pop_front() {
                    Some(task) => {
                        inner.pumping = true;
                        task
                    }
                    None => return,
                }
            };
            self.run_task(task);
            let mut inner = self.inner.lock().unwrap();
            inner.pumping = false;
            if inner.queue.is_empty() {
                return;
            }
            // More tasks were enqueued by callbacks; keep draining.
            drop(inner);
        }
    }

    fn run_task(&self, task: UpdateTask) {
        let previous = {
            let inner = self.inner.lock().unwrap();
            inner.state.clone()
        };
        let source = task.source;
        tracing::trace!(source = %source, "executing cluster state update");
        match (task.execute)(&previous) {
            Ok(new_state) => {
                let unchanged = *previous == new_state;
                if !unchanged {
                    // Only real transitions go through publication.
                    let injected = {
                        let mut inner = self.inner.lock().unwrap();
                        let matches = inner
                            .publish_failure
                            .as_ref()
                            .map(|f| {
                                f.source_fragment
                                    .as_deref()
                                    .map(|fragment| source.contains(fragment))
                                    .unwrap_or(true)
                            })
                            .unwrap_or(false);
                        if matches {
                            inner.publish_failure.take().map(|f| f.error)
                        } else {
                            None
                        }
                    };
                    if let Some(error) = injected {
                        tracing::debug!(source = %source, %error, "cluster state publication failed");
                        if let Some(on_failure) = task.on_failure {
                            on_failure(&source, error);
                        }
                        return;
                    }
                }
                let current = if unchanged {
                    previous.clone()
                } else {
                    let mut inner = self.inner.lock().unwrap();
                    let mut new_state = new_state;
                    new_state.version = previous.version + 1;
                    inner.state = Arc::new(new_state);
                    inner.state.clone()
                };
                if !unchanged {
                    let event = ClusterChangedEvent {
                        previous: previous.clone(),
                        current: current.clone(),
                    };
                    self.notify_appliers(&event);
                }
                if let Some(on_applied) = task.on_applied {
                    on_applied(&previous, &current);
                }
            }
            Err(error) => {
                tracing::debug!(source = %source, %error, "cluster state update rejected");
                if let Some(on_failure) = task.on_failure {
                    on_failure(&source, error);
                }
            }
        }
    }

    fn notify_appliers(&self, event: &ClusterChangedEvent) {
        let appliers: Vec<Arc<dyn ClusterStateApplier>> = {
            let mut guard = self.appliers.lock().unwrap();
            guard.retain(|w| w.strong_count() > 0);
            guard.iter().filter_map(|w| w.upgrade()).collect()
        };
        for applier in appliers {
            applier.apply_cluster_state(event);
        }
    }

    /// Runs the pump for tasks submitted while no drain was active. Intended
    /// for drivers that enqueue work from outside a callback.
    pub fn drain(&self) {
        self.pump();
    }
}
