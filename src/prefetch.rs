//! Background prefetching with bounded concurrency.
//!
//! Requests are queued in FIFO order and warmed through the same
//! [`FetchCoordinator`] path as foreground loads. At most
//! `max_concurrent_tasks` entries run at once; the rest wait their turn.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::config::PipelineConfig;
use crate::coordinator::FetchCoordinator;
use crate::request::{ImageRequest, PrefetchKey};

/// A queued prefetch; `task` is set once it is running.
struct PrefetchEntry {
    key: PrefetchKey,
    /// Distinguishes this entry from a later one enqueued under the same key.
    id: u64,
    request: ImageRequest,
    task: Option<AbortHandle>,
}

#[derive(Default)]
struct QueueState {
    /// Queued and running entries in admission order.
    queue: VecDeque<PrefetchEntry>,
    active: usize,
    next_id: u64,
}

struct SchedulerInner {
    coordinator: FetchCoordinator,
    runtime: Handle,
    max_concurrent_tasks: usize,
    state: Mutex<QueueState>,
}

/// Warms the image cache ahead of display.
///
/// All scheduling calls are non-blocking; results and errors of prefetch
/// fetches are discarded. Cheap to clone. Dropping the last handle cancels
/// every running prefetch.
#[derive(Clone)]
pub struct PrefetchScheduler {
    inner: Arc<SchedulerInner>,
}

impl PrefetchScheduler {
    /// Create a scheduler on the current Tokio runtime.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime; use
    /// [`with_runtime`](Self::with_runtime) to pass a handle explicitly.
    pub fn new(coordinator: FetchCoordinator, max_concurrent_tasks: usize) -> Self {
        Self::with_runtime(coordinator, max_concurrent_tasks, Handle::current())
    }

    /// Create a scheduler that spawns prefetch tasks on `runtime`.
    ///
    /// A bound of zero is raised to one.
    pub fn with_runtime(
        coordinator: FetchCoordinator,
        max_concurrent_tasks: usize,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                coordinator,
                runtime,
                max_concurrent_tasks: max_concurrent_tasks.max(1),
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Create a scheduler using `max_concurrent_prefetch` from the config.
    pub fn from_config(coordinator: FetchCoordinator, config: &PipelineConfig) -> Self {
        Self::new(coordinator, config.max_concurrent_prefetch)
    }

    /// Queue requests for prefetching. Requests already queued are skipped.
    pub fn start_prefetching(&self, requests: &[ImageRequest]) {
        let mut state = self.inner.state.lock();
        for request in requests {
            let key = PrefetchKey::new(request);
            if state.position(&key).is_some() {
                continue;
            }
            state.next_id += 1;
            let id = state.next_id;
            trace!(%key, "prefetch queued");
            state.queue.push_back(PrefetchEntry {
                key,
                id,
                request: request.clone(),
                task: None,
            });
        }
        SchedulerInner::fill_slots(&self.inner, &mut state);
    }

    /// Remove requests from the queue, cancelling any that are running.
    pub fn stop_prefetching(&self, requests: &[ImageRequest]) {
        let mut state = self.inner.state.lock();
        for request in requests {
            let key = PrefetchKey::new(request);
            let Some(entry) = state.position(&key).and_then(|i| state.queue.remove(i)) else {
                continue;
            };
            if let Some(task) = entry.task {
                task.abort();
                state.active -= 1;
                debug!(%key, "running prefetch cancelled");
            }
        }
        SchedulerInner::fill_slots(&self.inner, &mut state);
    }

    /// Cancel every running prefetch and clear the queue.
    pub fn stop_all(&self) {
        let mut state = self.inner.state.lock();
        let cancelled = state.queue.len();
        for entry in state.queue.drain(..) {
            if let Some(task) = entry.task {
                task.abort();
            }
        }
        state.active = 0;
        debug!(cancelled, "prefetch queue cleared");
    }

    /// Entries queued or running.
    pub fn queued_count(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Entries currently running.
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active
    }

    pub fn max_concurrent_tasks(&self) -> usize {
        self.inner.max_concurrent_tasks
    }
}

impl QueueState {
    fn position(&self, key: &PrefetchKey) -> Option<usize> {
        self.queue.iter().position(|entry| &entry.key == key)
    }
}

impl SchedulerInner {
    /// Start pending entries, earliest first, until the concurrency bound is reached.
    fn fill_slots(this: &Arc<Self>, state: &mut QueueState) {
        while state.active < this.max_concurrent_tasks {
            let Some(entry) = state.queue.iter_mut().find(|entry| entry.task.is_none()) else {
                break;
            };

            let scheduler = Arc::downgrade(this);
            let coordinator = this.coordinator.clone();
            let request = entry.request.clone();
            let key = entry.key.clone();
            let id = entry.id;

            trace!(%key, "prefetch started");
            let handle = this.runtime.spawn(async move {
                // Warm-cache only; errors are not surfaced
                let _ = coordinator.image(&request).await;
                Self::finish(scheduler, &key, id);
            });
            entry.task = Some(handle.abort_handle());
            state.active += 1;
        }
    }

    /// Remove a completed entry and admit the next pending one.
    fn finish(scheduler: Weak<Self>, key: &PrefetchKey, id: u64) {
        let Some(this) = scheduler.upgrade() else {
            return;
        };
        let mut state = this.state.lock();
        // Entry may have been dequeued (and re-enqueued) while running
        if let Some(i) = state.queue.iter().position(|entry| entry.id == id) {
            state.queue.remove(i);
            state.active -= 1;
            trace!(%key, "prefetch finished");
        }
        Self::fill_slots(&this, &mut state);
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        for entry in &self.state.get_mut().queue {
            if let Some(task) = &entry.task {
                task.abort();
            }
        }
    }
}
