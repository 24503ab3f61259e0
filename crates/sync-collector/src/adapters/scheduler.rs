//! Core-thread schedulers
//!
//! - `TokioLocalScheduler`: production adapter, runs tasks with
//!   `tokio::task::spawn_local` (must be used inside a `LocalSet`)
//! - `ManualScheduler`: virtual clock for deterministic tests

use std::cell::{Cell, RefCell};
use std::time::Duration;

use crate::ports::{CoreScheduler, Task};

/// Scheduler backed by the current tokio `LocalSet`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioLocalScheduler;

impl TokioLocalScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl CoreScheduler for TokioLocalScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        tokio::task::spawn_local(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            task();
        });
    }
}

struct Pending {
    due: Duration,
    seq: u64,
    task: Task,
}

/// Scheduler with a virtual clock.
///
/// Nothing runs until the test calls `run_pending()` or `advance()`. Tasks
/// due at the same instant run in scheduling order.
#[derive(Default)]
pub struct ManualScheduler {
    now: Cell<Duration>,
    next_seq: Cell<u64>,
    tasks: RefCell<Vec<Pending>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual time elapsed since creation
    pub fn now(&self) -> Duration {
        self.now.get()
    }

    /// Number of tasks not yet run
    pub fn pending(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Remaining delays of all pending tasks, ascending
    pub fn pending_delays(&self) -> Vec<Duration> {
        let now = self.now.get();
        let mut delays: Vec<Duration> = self
            .tasks
            .borrow()
            .iter()
            .map(|p| p.due.saturating_sub(now))
            .collect();
        delays.sort();
        delays
    }

    /// Pending tasks with a non-zero remaining delay
    pub fn timers(&self) -> usize {
        self.pending_delays()
            .iter()
            .filter(|d| !d.is_zero())
            .count()
    }

    /// Remove and return the earliest task due at or before `deadline`.
    fn pop_due(&self, deadline: Duration) -> Option<Pending> {
        let mut tasks = self.tasks.borrow_mut();
        let idx = tasks
            .iter()
            .enumerate()
            .filter(|(_, p)| p.due <= deadline)
            .min_by_key(|(_, p)| (p.due, p.seq))
            .map(|(i, _)| i)?;
        Some(tasks.swap_remove(idx))
    }

    /// Run every task due now, including tasks they schedule without delay.
    ///
    /// Returns the number of tasks run.
    pub fn run_pending(&self) -> usize {
        self.advance(Duration::ZERO)
    }

    /// Move the clock forward by `by`, running tasks as they come due.
    ///
    /// Returns the number of tasks run.
    pub fn advance(&self, by: Duration) -> usize {
        let deadline = self.now.get() + by;
        let mut ran = 0;
        // The borrow on `tasks` is released before a task runs, so tasks may
        // schedule more work.
        while let Some(pending) = self.pop_due(deadline) {
            if pending.due > self.now.get() {
                self.now.set(pending.due);
            }
            (pending.task)();
            ran += 1;
        }
        self.now.set(deadline);
        ran
    }
}

impl CoreScheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        self.tasks.borrow_mut().push(Pending {
            due: self.now.get() + delay,
            seq,
            task,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_nothing_runs_until_driven() {
        let sched = ManualScheduler::new();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        sched.schedule(Duration::ZERO, Box::new(move || h.set(h.get() + 1)));

        assert_eq!(hits.get(), 0);
        assert_eq!(sched.run_pending(), 1);
        assert_eq!(hits.get(), 1);
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn test_timers_fire_in_due_order() {
        let sched = ManualScheduler::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for (label, secs) in [("late", 5), ("early", 1), ("mid", 3)] {
            let o = order.clone();
            sched.schedule(
                Duration::from_secs(secs),
                Box::new(move || o.borrow_mut().push(label)),
            );
        }

        assert_eq!(sched.run_pending(), 0, "Nothing is due yet");
        assert_eq!(sched.advance(Duration::from_secs(3)), 2);
        assert_eq!(*order.borrow(), vec!["early", "mid"]);
        assert_eq!(sched.pending_delays(), vec![Duration::from_secs(2)]);
        assert_eq!(sched.now(), Duration::from_secs(3));
    }

    #[test]
    fn test_tasks_may_schedule_follow_up_work() {
        let sched = Rc::new(ManualScheduler::new());
        let hits = Rc::new(Cell::new(0));

        let s = Rc::downgrade(&sched);
        let h = hits.clone();
        sched.schedule(
            Duration::ZERO,
            Box::new(move || {
                h.set(h.get() + 1);
                if let Some(s) = s.upgrade() {
                    let h = h.clone();
                    s.schedule(Duration::ZERO, Box::new(move || h.set(h.get() + 1)));
                }
            }),
        );

        assert_eq!(sched.run_pending(), 2);
        assert_eq!(hits.get(), 2);
    }

    #[tokio::test]
    async fn test_tokio_local_scheduler_runs_on_local_set() {
        let local = tokio::task::LocalSet::new();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let task: Task = Box::new(move || h.set(h.get() + 1));

        local
            .run_until(async move {
                TokioLocalScheduler::new().schedule(Duration::from_millis(1), task);
                tokio::time::sleep(Duration::from_millis(20)).await;
            })
            .await;

        assert_eq!(hits.get(), 1);
    }
}
