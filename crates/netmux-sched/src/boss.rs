use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{Result, SchedError};
use crate::group::WorkerGroup;
use crate::task::{Task, TaskId, TaskSpec};
use crate::worker::{Worker, WorkerStatus};

/// Owns every worker and group of one scheduler instance.
///
/// One boss per subsystem (one per server, one per client). Submitting a
/// task wakes sleeping workers bound to the target group; status changes
/// broadcast to every owned worker.
pub struct WorkerBoss {
    groups: Mutex<HashMap<String, Arc<WorkerGroup>>>,
    workers: Mutex<Vec<Arc<Worker>>>,
    next_task_id: AtomicU64,
}

impl WorkerBoss {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            next_task_id: AtomicU64::new(1),
        }
    }

    /// Create (or return the existing) group with this name.
    pub fn create_group(&self, name: &str, priority: crate::task::Priority) -> Arc<WorkerGroup> {
        let mut groups = self
            .groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            groups
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(WorkerGroup::new(name, priority))),
        )
    }

    pub fn group(&self, name: &str) -> Option<Arc<WorkerGroup>> {
        self.groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    /// Forget a group. Workers still bound to it keep draining it.
    pub fn decommission_group(&self, name: &str) {
        if let Some(group) = self
            .groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name)
        {
            group.destroy();
            debug!(group = name, "group decommissioned");
        }
    }

    pub fn clear_group(&self, name: &str) {
        if let Some(group) = self.group(name) {
            group.clear();
        }
    }

    /// Create a worker bound to the named groups. Referencing a group
    /// the boss does not own is an error.
    pub fn create_worker(
        &self,
        priority: crate::task::Priority,
        group_names: &[&str],
    ) -> Result<Arc<Worker>> {
        let mut bound = Vec::with_capacity(group_names.len());
        for name in group_names {
            bound.push(
                self.group(name)
                    .ok_or_else(|| SchedError::UnknownGroup(name.to_string()))?,
            );
        }

        let worker = Worker::new(priority, bound);
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::clone(&worker));
        Ok(worker)
    }

    /// Terminate and forget one worker.
    pub fn decommission_worker(&self, worker: &Arc<Worker>) {
        // A worker still in Starting rejects Terminating; its thread
        // flips to Active right after spawn.
        while worker.status() == WorkerStatus::Starting {
            std::thread::yield_now();
        }
        if !matches!(
            worker.status(),
            WorkerStatus::Terminating | WorkerStatus::Terminated
        ) {
            let _ = worker.change_status(WorkerStatus::Terminating);
        }
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|owned| !Arc::ptr_eq(owned, worker));
    }

    /// Submit a task to a group and wake sleeping workers bound to it.
    pub fn submit_task(&self, group_name: &str, spec: TaskSpec) -> Result<TaskId> {
        self.submit(group_name, spec, false)
    }

    /// Submit a top task: it pre-empts all normal tasks in the group.
    pub fn submit_top_task(&self, group_name: &str, spec: TaskSpec) -> Result<TaskId> {
        self.submit(group_name, spec, true)
    }

    fn submit(&self, group_name: &str, spec: TaskSpec, top: bool) -> Result<TaskId> {
        let group = self
            .group(group_name)
            .ok_or_else(|| SchedError::UnknownGroup(group_name.to_string()))?;

        let id = TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed));
        let task = Task::new(id, spec);
        if top {
            group.submit_top(task);
        } else {
            group.submit(task);
        }

        let workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for worker in workers {
            if worker.status() == WorkerStatus::Sleeping && worker.is_in_group(group_name) {
                // A worker mid-transition rejects this; it will find
                // the task on its next pass anyway.
                let _ = worker.change_status(WorkerStatus::Active);
            }
        }
        Ok(id)
    }

    pub fn decommission_task(&self, group_name: &str, id: TaskId) {
        if let Some(group) = self.group(group_name) {
            group.decommission(id);
        }
    }

    /// Broadcast a status change to every owned worker.
    pub fn change_status(&self, status: WorkerStatus) -> Result<()> {
        let workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for worker in workers {
            worker.change_status(status)?;
        }
        Ok(())
    }

    /// The common status of all workers; an error if they disagree.
    pub fn status(&self) -> Result<WorkerStatus> {
        let workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut status = None;
        for worker in workers.iter() {
            match status {
                None => status = Some(worker.status()),
                Some(seen) if seen == worker.status() => {}
                Some(_) => return Err(SchedError::OutOfSync),
            }
        }
        Ok(status.unwrap_or(WorkerStatus::Terminated))
    }

    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Terminate every worker, join their threads and drop all groups.
    pub fn shutdown(&self) {
        let workers = self.workers();
        for worker in &workers {
            // A worker still in Starting rejects Terminating; its
            // thread flips to Active right after spawn.
            while worker.status() == WorkerStatus::Starting {
                std::thread::yield_now();
            }
            let _ = worker.change_status(WorkerStatus::Terminating);
        }
        for worker in &workers {
            worker.join();
        }
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        self.groups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        debug!("scheduler shut down");
    }
}

impl Default for WorkerBoss {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::task::Priority;

    #[test]
    fn unknown_group_is_an_error() {
        let boss = WorkerBoss::new();
        let err = boss
            .create_worker(Priority::Medium, &["missing"])
            .unwrap_err();
        assert!(matches!(err, SchedError::UnknownGroup(name) if name == "missing"));

        let err = boss
            .submit_task("missing", TaskSpec::new(Priority::Medium, |_| {}))
            .unwrap_err();
        assert!(matches!(err, SchedError::UnknownGroup(_)));
    }

    #[test]
    fn create_group_is_idempotent() {
        let boss = WorkerBoss::new();
        let first = boss.create_group("io", Priority::High);
        let second = boss.create_group("io", Priority::Low);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn submitted_task_wakes_sleeping_worker() {
        let boss = WorkerBoss::new();
        boss.create_group("io", Priority::Medium);
        let worker = boss.create_worker(Priority::Medium, &["io"]).unwrap();
        worker.change_status(WorkerStatus::Starting).unwrap();

        // Give the worker time to go idle.
        let deadline = Instant::now() + Duration::from_secs(2);
        while worker.status() != WorkerStatus::Sleeping && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        let (tx, rx) = mpsc::channel();
        boss.submit_task(
            "io",
            TaskSpec::new(Priority::Medium, move |_| {
                tx.send(()).unwrap();
            })
            .repeat(1),
        )
        .unwrap();

        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        boss.shutdown();
    }

    #[test]
    fn decommissioned_task_never_runs() {
        let boss = WorkerBoss::new();
        boss.create_group("io", Priority::Medium);

        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let id = boss
            .submit_task(
                "io",
                TaskSpec::new(Priority::Medium, move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .every(Duration::from_millis(50)),
            )
            .unwrap();
        boss.decommission_task("io", id);

        let worker = boss.create_worker(Priority::Medium, &["io"]).unwrap();
        worker.change_status(WorkerStatus::Starting).unwrap();
        std::thread::sleep(Duration::from_millis(150));

        assert_eq!(count.load(Ordering::SeqCst), 0);
        boss.shutdown();
    }

    #[test]
    fn status_reports_out_of_sync_workers() {
        let boss = WorkerBoss::new();
        boss.create_group("io", Priority::Medium);
        let started = boss.create_worker(Priority::Medium, &["io"]).unwrap();
        let _idle = boss.create_worker(Priority::Medium, &["io"]).unwrap();

        started.change_status(WorkerStatus::Starting).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while started.status() == WorkerStatus::Starting && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(matches!(boss.status(), Err(SchedError::OutOfSync)));
        boss.shutdown();
    }

    #[test]
    fn shutdown_terminates_and_joins_all_workers() {
        let boss = WorkerBoss::new();
        boss.create_group("a", Priority::Medium);
        boss.create_group("b", Priority::High);
        let w1 = boss.create_worker(Priority::Medium, &["a"]).unwrap();
        let w2 = boss.create_worker(Priority::Medium, &["a", "b"]).unwrap();
        w1.change_status(WorkerStatus::Starting).unwrap();
        w2.change_status(WorkerStatus::Starting).unwrap();

        boss.shutdown();
        assert_eq!(w1.status(), WorkerStatus::Terminated);
        assert_eq!(w2.status(), WorkerStatus::Terminated);
        assert!(boss.workers().is_empty());
    }
}
