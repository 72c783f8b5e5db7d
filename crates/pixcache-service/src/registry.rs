//! Tracking of in-flight background loads, one per [`ResourceKey`].
//!
//! The registry is what keeps two near-simultaneous loads of the same image from both going to
//! the network, and what lets a background unit find out whether anybody still wants its result.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::caching::ResourceKey;
use crate::executor::{Executor, WorkHandle, WorkUnit};

/// Identifies one registered task.
///
/// Ids are never reused, so a unit holding a stale id can always detect that it was superseded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    /// Submitted to the executor, but its unit did not begin yet.
    Queued,
    /// The unit began and is doing I/O.
    Running,
}

#[derive(Debug)]
struct Task<W> {
    id: TaskId,
    state: TaskState,
    /// `None` until the executor accepted the unit.
    handle: Option<WorkHandle>,
    /// Everybody who asked for this key while the task was registered.
    waiters: Vec<W>,
}

/// What [`TaskRegistry::start_or_replace`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A new unit was submitted.
    Started(TaskId),
    /// A queued unit was cancelled, and a new unit taking over its waiters was submitted.
    Replaced { old: TaskId, new: TaskId },
    /// The key is already being loaded by a running unit, which will deliver to this waiter too.
    Joined(TaskId),
}

impl Registration {
    /// The task that will serve the request.
    pub fn task_id(&self) -> TaskId {
        match *self {
            Self::Started(id) | Self::Joined(id) => id,
            Self::Replaced { new, .. } => new,
        }
    }
}

/// The set of in-flight background loads, keyed by [`ResourceKey`].
///
/// At most one task exists per key. All transitions happen under a single lock, so two callers
/// racing on the same key can never both end up submitting a unit that does I/O.
pub struct TaskRegistry<W> {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<ResourceKey, Task<W>>>,
}

impl<W> fmt::Debug for TaskRegistry<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.lock().len())
            .finish()
    }
}

impl<W> Default for TaskRegistry<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> TaskRegistry<W> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ResourceKey, Task<W>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers interest of `waiter` in `key`, submitting a unit created by `make_unit` when
    /// needed.
    ///
    /// - Without a task for `key`, a new one is registered and its unit submitted.
    /// - If the task for `key` is still queued, it is cancelled and removed from the executor's
    ///   queue. The new task inherits its waiters.
    /// - If the task for `key` is already running, `waiter` joins it and nothing is submitted.
    pub fn start_or_replace<F>(
        &self,
        key: ResourceKey,
        waiter: W,
        executor: &dyn Executor,
        make_unit: F,
    ) -> Registration
    where
        F: FnOnce(TaskId) -> WorkUnit,
    {
        let (id, registration) = {
            let mut tasks = self.lock();

            let mut waiters = Vec::new();
            let mut replaced = None;
            if let Some(task) = tasks.get_mut(&key) {
                if task.state == TaskState::Running {
                    tracing::trace!(%key, task = %task.id, "Joining running load");
                    task.waiters.push(waiter);
                    return Registration::Joined(task.id);
                }

                if let Some(old) = tasks.remove(&key) {
                    tracing::trace!(%key, task = %old.id, "Replacing queued load");
                    if let Some(handle) = &old.handle {
                        executor.try_remove(handle);
                    }
                    replaced = Some(old.id);
                    waiters = old.waiters;
                }
            }
            waiters.push(waiter);

            let id = self.next_id();
            tasks.insert(
                key.clone(),
                Task {
                    id,
                    state: TaskState::Queued,
                    handle: None,
                    waiters,
                },
            );

            let registration = match replaced {
                Some(old) => Registration::Replaced { old, new: id },
                None => Registration::Started(id),
            };
            (id, registration)
        };

        // The executor is called without holding the lock, the unit might already run (and
        // call back into the registry) before `submit` returns.
        let handle = executor.submit(make_unit(id));

        let mut tasks = self.lock();
        match tasks.get_mut(&key) {
            Some(task) if task.id == id => task.handle = Some(handle),
            _ => {
                // cancelled or replaced while we were submitting
                executor.try_remove(&handle);
            }
        }

        registration
    }

    /// Called by a unit when it starts executing.
    ///
    /// Returns `true` and marks the task as running if `id` is still the current task for
    /// `key`. A unit for which this returns `false` was superseded or cancelled, and must exit
    /// without doing any I/O.
    pub fn begin(&self, key: &ResourceKey, id: TaskId) -> bool {
        let mut tasks = self.lock();
        match tasks.get_mut(key) {
            Some(task) if task.id == id => {
                task.state = TaskState::Running;
                true
            }
            _ => false,
        }
    }

    /// Whether `id` is the current task for `key`.
    pub fn is_current(&self, key: &ResourceKey, id: TaskId) -> bool {
        self.lock().get(key).is_some_and(|task| task.id == id)
    }

    /// Cancels the task for `key`, returning whether there was one.
    ///
    /// A queued unit is taken out of the executor's queue if possible, and in any case will not
    /// do any I/O. A running unit notices at its next [`is_current`](Self::is_current) check,
    /// and never gets to deliver its result.
    pub fn cancel(&self, key: &ResourceKey, executor: &dyn Executor) -> bool {
        let Some(task) = self.lock().remove(key) else {
            return false;
        };

        let removed = task
            .handle
            .as_ref()
            .is_some_and(|handle| executor.try_remove(handle));
        tracing::debug!(%key, task = %task.id, removed, "Cancelled load");
        true
    }

    /// Unregisters the task `id` once its unit completed, handing out its waiters.
    ///
    /// Returns no waiters if the task was cancelled in the meantime.
    pub fn finish(&self, key: &ResourceKey, id: TaskId) -> Vec<W> {
        let mut tasks = self.lock();
        match tasks.get(key) {
            Some(task) if task.id == id => tasks
                .remove(key)
                .map(|task| task.waiters)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Whether a task is registered for `key`.
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.lock().contains_key(key)
    }

    /// The number of waiters of the task for `key`.
    pub fn waiter_count(&self, key: &ResourceKey) -> usize {
        self.lock().get(key).map_or(0, |task| task.waiters.len())
    }

    /// The number of registered tasks.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
