use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};

use crate::error::{Result, SchedError};
use crate::group::{WorkerGroup, IDLE_WAIT};
use crate::task::Priority;

/// Worker lifecycle states.
///
/// Legal transitions: `Terminated→Starting→Active`, `Active⇄Sleeping`,
/// `{Active,Sleeping}→Terminating→Terminated`. Anything else is
/// rejected with [`SchedError::InvalidState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Terminated,
    Starting,
    Active,
    Sleeping,
    Terminating,
}

/// One scheduler thread bound to a set of groups.
pub struct Worker {
    priority: Priority,
    groups: Vec<Arc<WorkerGroup>>,
    status: Mutex<WorkerStatus>,
    wake: Condvar,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    computations: AtomicU64,
}

impl Worker {
    pub(crate) fn new(priority: Priority, groups: Vec<Arc<WorkerGroup>>) -> Arc<Self> {
        Arc::new(Self {
            priority,
            groups,
            status: Mutex::new(WorkerStatus::Terminated),
            wake: Condvar::new(),
            handle: Mutex::new(None),
            computations: AtomicU64::new(0),
        })
    }

    pub fn status(&self) -> WorkerStatus {
        *self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Tasks executed since the worker started.
    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::Relaxed)
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn is_in_group(&self, name: &str) -> bool {
        self.groups.iter().any(|group| group.name() == name)
    }

    pub fn has_active_group(&self) -> bool {
        self.groups.iter().any(|group| group.has_work())
    }

    /// Request a status transition. Illegal transitions are rejected
    /// and the current status is left unchanged.
    pub fn change_status(self: &Arc<Self>, status: WorkerStatus) -> Result<()> {
        let mut current = self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *current == status {
            return Ok(());
        }

        match (*current, status) {
            (WorkerStatus::Terminated, WorkerStatus::Starting) => {
                *current = WorkerStatus::Starting;
                drop(current);
                if let Err(err) = self.spawn() {
                    self.set_status(WorkerStatus::Terminated);
                    return Err(err);
                }
                Ok(())
            }
            (WorkerStatus::Sleeping, WorkerStatus::Active) => {
                *current = WorkerStatus::Active;
                self.wake.notify_all();
                Ok(())
            }
            (WorkerStatus::Active, WorkerStatus::Sleeping) => {
                *current = WorkerStatus::Sleeping;
                Ok(())
            }
            (WorkerStatus::Active | WorkerStatus::Sleeping, WorkerStatus::Terminating) => {
                *current = WorkerStatus::Terminating;
                self.wake.notify_all();
                Ok(())
            }
            (from, to) => Err(SchedError::InvalidState { from, to }),
        }
    }

    /// Wait for the worker thread to exit. Call after requesting
    /// `Terminating`.
    pub fn join(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }

    fn spawn(self: &Arc<Self>) -> Result<()> {
        let worker = Arc::clone(self);
        let name = format!(
            "netmux-worker-{}",
            self.groups
                .iter()
                .map(|group| group.name())
                .collect::<Vec<_>>()
                .join("+")
        );
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || worker.run())
            .map_err(SchedError::Spawn)?;
        *self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        Ok(())
    }

    fn run(self: Arc<Self>) {
        self.set_status(WorkerStatus::Active);
        debug!(groups = self.groups.len(), "worker started");

        loop {
            if self.status() == WorkerStatus::Terminating {
                break;
            }

            let now = Instant::now();
            let group = self.most_significant_group();
            let picked = group.and_then(|group| {
                group
                    .take_next(now)
                    .map(|(task, from_top)| (group, task, from_top))
            });

            match picked {
                Some((group, mut task, from_top)) => {
                    if task.ready(now) {
                        task.run(now);
                        self.computations.fetch_add(1, Ordering::Relaxed);
                        if task.finished() {
                            trace!(group = group.name(), "repeatable task finished");
                        } else {
                            group.reinsert(task, from_top);
                        }
                    } else {
                        // The soonest task is not due yet; put it back
                        // and sleep until the group needs us.
                        let wait = group.next_requested(now);
                        group.reinsert(task, from_top);
                        self.sleep(wait);
                    }
                }
                None => {
                    if !self.has_active_group() {
                        self.sleep(IDLE_WAIT);
                    }
                }
            }
        }

        self.set_status(WorkerStatus::Terminated);
        debug!("worker terminated");
    }

    /// Park in `Sleeping` until woken or the wait elapses. A submission
    /// to any bound group wakes the worker via `change_status(Active)`.
    fn sleep(&self, wait: Duration) {
        if wait.is_zero() {
            return;
        }
        let mut status = self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *status != WorkerStatus::Active {
            return;
        }
        *status = WorkerStatus::Sleeping;
        let (mut status, _) = self
            .wake
            .wait_timeout(status, wait)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *status == WorkerStatus::Sleeping {
            *status = WorkerStatus::Active;
        }
    }

    fn set_status(&self, status: WorkerStatus) {
        *self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = status;
    }

    /// The bound group with the highest significance that has work.
    fn most_significant_group(&self) -> Option<&Arc<WorkerGroup>> {
        let mut best: Option<(&Arc<WorkerGroup>, f32)> = None;
        for group in &self.groups {
            if !group.has_work() {
                continue;
            }
            let significance = group.significance();
            match best {
                Some((_, current)) if significance <= current => {}
                _ => best = Some((group, significance)),
            }
        }
        best.map(|(group, _)| group)
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("priority", &self.priority)
            .field("status", &self.status())
            .field("groups", &self.groups.len())
            .field("computations", &self.computations())
            .finish()
    }
}
