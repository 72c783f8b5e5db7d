//! The execution substrate background work units run on.
//!
//! The engine never spawns work itself. It hands [`WorkUnit`]s to an [`Executor`] and keeps the
//! returned [`WorkHandle`], which it can later use to take a unit back out of the queue if the
//! unit has not started yet.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// A unit of background work.
pub type WorkUnit = BoxFuture<'static, ()>;

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const REMOVED: u8 = 2;

#[derive(Debug)]
struct HandleState {
    state: AtomicU8,
    removed: CancellationToken,
}

/// Tracks whether a submitted [`WorkUnit`] is still queued, running, or was removed.
///
/// A unit moves from queued to either running or removed exactly once. Both transitions are a
/// single atomic compare-and-swap, so a unit that was successfully removed never runs, and a unit
/// that started running can no longer be removed.
#[derive(Clone)]
pub struct WorkHandle {
    inner: Arc<HandleState>,
}

impl fmt::Debug for WorkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.state.load(Ordering::Acquire) {
            QUEUED => "queued",
            RUNNING => "running",
            _ => "removed",
        };
        f.debug_tuple("WorkHandle").field(&state).finish()
    }
}

impl Default for WorkHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkHandle {
    /// Creates the handle of a freshly queued unit.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HandleState {
                state: AtomicU8::new(QUEUED),
                removed: CancellationToken::new(),
            }),
        }
    }

    fn transition(&self, to: u8) -> bool {
        self.inner
            .state
            .compare_exchange(QUEUED, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Marks the unit as running.
    ///
    /// Executors call this right before polling the unit, and must drop the unit without
    /// polling it if this returns `false`.
    pub fn try_start(&self) -> bool {
        self.transition(RUNNING)
    }

    /// Removes the unit from the queue, returning `false` if it already started.
    pub fn try_remove(&self) -> bool {
        let removed = self.transition(REMOVED);
        if removed {
            self.inner.removed.cancel();
        }
        removed
    }

    pub fn is_queued(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == QUEUED
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == RUNNING
    }

    pub fn is_removed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == REMOVED
    }

    /// Resolves once the unit was removed from the queue.
    pub async fn removed(&self) {
        self.inner.removed.cancelled().await
    }
}

/// A pool running [`WorkUnit`]s in the background.
pub trait Executor: Send + Sync + 'static {
    /// Queues `unit` for execution.
    fn submit(&self, unit: WorkUnit) -> WorkHandle;

    /// Best-effort removal of a queued unit, returning whether it was removed before it started.
    fn try_remove(&self, handle: &WorkHandle) -> bool {
        handle.try_remove()
    }
}

/// An [`Executor`] spawning units onto a tokio runtime, running at most a fixed number of them
/// concurrently.
///
/// Units waiting for a free slot count as queued and can be removed.
#[derive(Clone)]
pub struct WorkerPool {
    runtime: Handle,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_concurrent", &self.max_concurrent)
            .field("available", &self.permits.available_permits())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(runtime: Handle, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }
}

impl Executor for WorkerPool {
    fn submit(&self, unit: WorkUnit) -> WorkHandle {
        let handle = WorkHandle::new();
        let task_handle = handle.clone();
        let permits = Arc::clone(&self.permits);

        self.runtime.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = task_handle.removed() => return,
                permit = permits.acquire_owned() => permit,
            };
            // The semaphore is never closed.
            let Ok(_permit) = permit else { return };

            if task_handle.try_start() {
                unit.await;
            }
        });

        handle
    }
}
