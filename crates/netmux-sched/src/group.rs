use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::task::{Priority, Task, TaskId};

/// Fallback sleep when a group has nothing scheduled at all.
pub(crate) const IDLE_WAIT: Duration = Duration::from_secs(1);

/// A named collection of tasks sharing one priority.
///
/// Holds a normal pool and a "top" pool; while any top task exists, top
/// tasks fully pre-empt normal tasks. Selection removes the chosen task
/// from its pool and the worker re-inserts it after the run unless it
/// finished, so two workers never execute the same task concurrently.
pub struct WorkerGroup {
    name: String,
    priority: Priority,
    inner: Mutex<GroupInner>,
}

struct GroupInner {
    tasks: Vec<Task>,
    top: Vec<Task>,
    /// Ids decommissioned while their task was checked out by a worker;
    /// the re-insert drops them instead.
    cancelled: std::collections::HashSet<TaskId>,
}

impl WorkerGroup {
    pub fn new(name: impl Into<String>, priority: Priority) -> Self {
        Self {
            name: name.into(),
            priority,
            inner: Mutex::new(GroupInner {
                tasks: Vec::new(),
                top: Vec::new(),
                cancelled: std::collections::HashSet::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    fn lock(&self) -> MutexGuard<'_, GroupInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn submit(&self, task: Task) {
        self.lock().tasks.push(task);
    }

    pub(crate) fn submit_top(&self, task: Task) {
        self.lock().top.push(task);
    }

    /// Remove a task from either pool. A task currently checked out by
    /// a worker is dropped when that worker tries to re-insert it.
    pub fn decommission(&self, id: TaskId) -> bool {
        let mut inner = self.lock();
        let before = inner.tasks.len() + inner.top.len();
        inner.tasks.retain(|task| task.id() != id);
        inner.top.retain(|task| task.id() != id);
        let removed = before != inner.tasks.len() + inner.top.len();
        if !removed {
            inner.cancelled.insert(id);
        }
        removed
    }

    /// `pending ^ priority_weight` over the active pool (top tasks
    /// pre-empt, so they define the pool while present).
    pub fn significance(&self) -> f32 {
        let inner = self.lock();
        let pending = if inner.top.is_empty() {
            inner.tasks.len()
        } else {
            inner.top.len()
        };
        (pending as f32).powf(self.priority.weight())
    }

    /// Pending tasks in the active pool.
    pub fn pending(&self) -> usize {
        let inner = self.lock();
        if inner.top.is_empty() {
            inner.tasks.len()
        } else {
            inner.top.len()
        }
    }

    pub fn has_work(&self) -> bool {
        let inner = self.lock();
        !inner.tasks.is_empty() || !inner.top.is_empty()
    }

    /// Take the most significant task out of the active pool. A timed
    /// task that is not yet due can be returned (significance 0); the
    /// worker checks readiness and re-inserts it with a sleep.
    pub(crate) fn take_next(&self, now: Instant) -> Option<(Task, bool)> {
        let mut inner = self.lock();
        let from_top = !inner.top.is_empty();
        let pool = if from_top {
            &mut inner.top
        } else {
            &mut inner.tasks
        };

        let mut best: Option<(usize, f32)> = None;
        for (index, task) in pool.iter().enumerate() {
            let significance = task.significance(now);
            match best {
                Some((_, current)) if significance <= current => {}
                _ => best = Some((index, significance)),
            }
        }

        best.map(|(index, _)| (pool.swap_remove(index), from_top))
    }

    pub(crate) fn reinsert(&self, task: Task, into_top: bool) {
        let mut inner = self.lock();
        if inner.cancelled.remove(&task.id()) {
            return;
        }
        if into_top {
            inner.top.push(task);
        } else {
            inner.tasks.push(task);
        }
    }

    /// Minimum time until any task in the active pool becomes eligible.
    pub fn next_requested(&self, now: Instant) -> Duration {
        let inner = self.lock();
        let pool = if inner.top.is_empty() {
            &inner.tasks
        } else {
            &inner.top
        };

        pool.iter()
            .map(|task| task.next_requested(now))
            .min()
            .unwrap_or(IDLE_WAIT)
    }

    /// Drop all normal tasks, keeping top tasks.
    pub fn clear(&self) {
        self.lock().tasks.clear();
    }

    /// Drop everything.
    pub fn destroy(&self) {
        let mut inner = self.lock();
        inner.tasks.clear();
        inner.top.clear();
        inner.cancelled.clear();
    }
}

impl std::fmt::Debug for WorkerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("WorkerGroup")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("tasks", &inner.tasks.len())
            .field("top", &inner.top.len())
            .finish()
    }
}
