use std::time::{Duration, Instant};

/// Scheduling priority, used as the exponent of the significance score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Medium,
    High,
    Absolute,
}

impl Priority {
    pub fn weight(self) -> f32 {
        match self {
            Priority::Low => 0.5,
            Priority::Medium => 1.0,
            Priority::High => 1.5,
            Priority::Absolute => 2.0,
        }
    }
}

/// What a job learns about its own execution.
#[derive(Debug, Clone, Copy)]
pub struct TaskContext {
    /// Time since this task's previous run (or its submission).
    pub delta: Duration,
    /// Repetitions left after this run; `None` for unbounded tasks.
    pub remaining: Option<u32>,
}

pub(crate) type Job = Box<dyn FnMut(&TaskContext) + Send>;

/// Identifies a submitted task for decommissioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) u64);

/// A task under construction: a job plus optional interval and
/// repetition count. All four task shapes are this one type.
pub struct TaskSpec {
    pub(crate) priority: Priority,
    pub(crate) interval: Option<Duration>,
    pub(crate) repetitions: Option<u32>,
    pub(crate) job: Job,
}

impl TaskSpec {
    pub fn new(priority: Priority, job: impl FnMut(&TaskContext) + Send + 'static) -> Self {
        Self {
            priority,
            interval: None,
            repetitions: None,
            job: Box::new(job),
        }
    }

    /// Gate execution: run only once `interval` has elapsed since the
    /// previous run.
    pub fn every(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Run at most `repetitions` times, then get gracefully removed.
    pub fn repeat(mut self, repetitions: u32) -> Self {
        self.repetitions = Some(repetitions);
        self
    }
}

/// A submitted task with its scheduling state.
pub(crate) struct Task {
    id: TaskId,
    priority: Priority,
    interval: Option<Duration>,
    repetitions: Option<u32>,
    last_run: Instant,
    job: Job,
}

impl Task {
    pub(crate) fn new(id: TaskId, spec: TaskSpec) -> Self {
        Self {
            id,
            priority: spec.priority,
            interval: spec.interval,
            repetitions: spec.repetitions,
            last_run: Instant::now(),
            job: spec.job,
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    /// A timed task is ready once its interval has elapsed; untimed
    /// tasks are always ready.
    pub(crate) fn ready(&self, now: Instant) -> bool {
        match self.interval {
            Some(interval) => now.duration_since(self.last_run) >= interval,
            None => true,
        }
    }

    /// Priority weight when eligible, 0 for timed tasks not yet due.
    pub(crate) fn significance(&self, now: Instant) -> f32 {
        if self.ready(now) {
            self.priority.weight()
        } else {
            0.0
        }
    }

    /// Time until this task next wants to run; zero when ready.
    pub(crate) fn next_requested(&self, now: Instant) -> Duration {
        match self.interval {
            Some(interval) => interval.saturating_sub(now.duration_since(self.last_run)),
            None => Duration::ZERO,
        }
    }

    pub(crate) fn run(&mut self, now: Instant) {
        let delta = now.duration_since(self.last_run);
        if let Some(repetitions) = &mut self.repetitions {
            *repetitions = repetitions.saturating_sub(1);
        }
        let ctx = TaskContext {
            delta,
            remaining: self.repetitions,
        };
        (self.job)(&ctx);
        self.last_run = now;
    }

    /// A repeatable task with no repetitions left is gracefully removed
    /// after its final run.
    pub(crate) fn finished(&self) -> bool {
        self.repetitions == Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(priority: Priority) -> TaskSpec {
        TaskSpec::new(priority, |_| {})
    }

    #[test]
    fn priority_weights() {
        assert_eq!(Priority::Low.weight(), 0.5);
        assert_eq!(Priority::Medium.weight(), 1.0);
        assert_eq!(Priority::High.weight(), 1.5);
        assert_eq!(Priority::Absolute.weight(), 2.0);
    }

    #[test]
    fn untimed_task_is_always_ready() {
        let task = Task::new(TaskId(1), spec(Priority::Medium));
        let now = Instant::now();
        assert!(task.ready(now));
        assert_eq!(task.next_requested(now), Duration::ZERO);
        assert_eq!(task.significance(now), 1.0);
    }

    #[test]
    fn timed_task_gates_on_interval() {
        let interval = Duration::from_millis(500);
        let task = Task::new(TaskId(1), spec(Priority::High).every(interval));
        let start = Instant::now();

        // Simulated clock: the task becomes ready exactly once the
        // interval has elapsed, never inside the window.
        for tick in 0..10u32 {
            let now = start + interval * tick / 10;
            assert!(!task.ready(now), "ready inside the interval at tick {tick}");
            assert_eq!(task.significance(now), 0.0);
        }
        let due = start + interval;
        assert!(task.ready(due));
        assert_eq!(task.significance(due), Priority::High.weight());
    }

    #[test]
    fn timed_task_never_runs_twice_within_interval() {
        let interval = Duration::from_millis(500);
        let mut task = Task::new(TaskId(1), spec(Priority::Medium).every(interval));
        let start = Instant::now();

        let mut runs = 0u32;
        // 40 simulated ticks of 125 ms cover 5 s; at most one run per
        // 500 ms window can happen.
        for tick in 1..=40u32 {
            let now = start + Duration::from_millis(125) * tick;
            if task.ready(now) {
                task.run(now);
                runs += 1;
            }
        }
        assert_eq!(runs, 10);
    }

    #[test]
    fn repetitions_count_down_to_finished() {
        let mut task = Task::new(TaskId(1), spec(Priority::Medium).repeat(3));
        let now = Instant::now();

        assert!(!task.finished());
        task.run(now);
        task.run(now);
        assert!(!task.finished());
        task.run(now);
        assert!(task.finished());
    }

    #[test]
    fn context_reports_remaining_repetitions() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&seen);
        let mut task = Task::new(
            TaskId(1),
            TaskSpec::new(Priority::Medium, move |ctx| {
                sink.lock().unwrap().push(ctx.remaining);
            })
            .repeat(2),
        );

        let now = Instant::now();
        task.run(now);
        task.run(now);
        assert_eq!(*seen.lock().unwrap(), vec![Some(1), Some(0)]);
    }

    #[test]
    fn next_requested_counts_down() {
        let interval = Duration::from_millis(100);
        let task = Task::new(TaskId(1), spec(Priority::Medium).every(interval));
        let start = Instant::now();

        let halfway = task.next_requested(start + Duration::from_millis(50));
        assert!(halfway <= Duration::from_millis(50));
        assert_eq!(
            task.next_requested(start + Duration::from_millis(150)),
            Duration::ZERO
        );
    }
}
