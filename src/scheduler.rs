//! Cooperative I/O scheduler
//!
//! Runs a FIFO queue of resumable tasks a few milliseconds at a time, so
//! persistence never blocks the thread that feeds the cache. The host drives
//! it: while [`Scheduler::is_running`] is true it calls [`Scheduler::tick`]
//! once per [`Scheduler::interval`]. An empty queue stops the timer.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::Result;

/// Time budget of one scheduler tick
#[derive(Debug, Clone, Copy)]
pub struct Quota {
    started: Instant,
    budget: Duration,
}

impl Quota {
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    /// Whether the running task must yield
    pub fn exceeded(&self) -> bool {
        self.started.elapsed() >= self.budget
    }
}

/// A unit of resumable work.
///
/// A task owns its progress; it is re-invoked from the head of the queue until
/// it reports completion.
pub trait Task<C> {
    /// Make progress until done or until `quota` is exceeded.
    ///
    /// Returns `Ok(true)` once the task has fully completed.
    fn run(&mut self, ctx: &mut C, quota: &Quota) -> Result<bool>;
}

/// FIFO queue of tasks drained in time-boxed ticks
pub struct Scheduler<T> {
    pending: VecDeque<T>,
    running: bool,
    interval: Duration,
    budget: Duration,
}

impl<T> Scheduler<T> {
    /// Create a scheduler ticking every `interval` with `budget` of work per tick
    pub fn new(interval: Duration, budget: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            running: false,
            interval,
            budget,
        }
    }

    /// Enqueue a task and make sure the timer is running
    pub fn schedule(&mut self, task: T) {
        self.pending.push_back(task);
        if !self.running {
            self.running = true;
            tracing::trace!("scheduler timer started");
        }
    }

    /// Run queued tasks until one yields or the queue empties.
    ///
    /// A failing task stays at the head of the queue and the error is returned.
    pub fn tick<C>(&mut self, ctx: &mut C) -> Result<()>
    where
        T: Task<C>,
    {
        let quota = Quota::new(self.budget);

        while let Some(task) = self.pending.front_mut() {
            if !task.run(ctx, &quota)? {
                break;
            }
            self.pending.pop_front();
        }

        if self.pending.is_empty() && self.running {
            self.running = false;
            tracing::trace!("scheduler timer stopped");
        }
        Ok(())
    }

    /// Abandon every pending task without running it
    pub fn clear(&mut self) -> usize {
        let abandoned = self.pending.len();
        self.pending.clear();
        self.running = false;
        abandoned
    }

    /// Whether the timer is running, i.e. whether the host should keep ticking
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}
