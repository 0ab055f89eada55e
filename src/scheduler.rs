//! Hosts that run deferred callbacks after the current synchronous turn.
//!
//! A [`Deferred`](crate::Deferred) never runs a callback from inside
//! `resolve`, `reject` or `then`. It hands the callback to a [`Scheduler`]
//! instead, and every container derived from it reuses the same one.
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use futures::executor::LocalSpawner;
use futures::task::LocalSpawnExt;

/// A unit of work queued for a later turn.
pub type Task = Box<dyn FnOnce() + 'static>;

/// Scheduler handle shared by a container and everything chained from it.
pub type SharedScheduler = Rc<dyn Scheduler>;

/// Runs tasks after the current turn, first scheduled first run.
pub trait Scheduler {
    fn schedule(&self, task: Task);
}

/// A FIFO run queue drained explicitly by the host.
///
/// # Examples
///
/// ```
/// use deferred::{Scheduler, TaskQueue};
/// use std::{cell::Cell, rc::Rc};
///
/// let queue = TaskQueue::new();
/// let hits = Rc::new(Cell::new(0));
/// let counter = hits.clone();
/// queue.schedule(Box::new(move || counter.set(counter.get() + 1)));
/// assert_eq!(hits.get(), 0);
/// assert_eq!(queue.run_until_idle(), 1);
/// assert_eq!(hits.get(), 1);
/// ```
#[derive(Clone, Default)]
pub struct TaskQueue {
    tasks: Rc<RefCell<VecDeque<Task>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// A [`SharedScheduler`] pushing onto this queue.
    pub fn scheduler(&self) -> SharedScheduler {
        Rc::new(self.clone())
    }

    /// Runs queued tasks, including ones they schedule, until the queue is
    /// empty. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            // The borrow must end before the task runs: tasks schedule more tasks.
            let next = self.tasks.borrow_mut().pop_front();
            match next {
                Some(task) => task(),
                None => break,
            }
            ran += 1;
        }
        if ran > 0 {
            tracing::trace!(ran, "task queue idle");
        }
        ran
    }

    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue").field("len", &self.len()).finish()
    }
}

impl Scheduler for TaskQueue {
    fn schedule(&self, task: Task) {
        self.tasks.borrow_mut().push_back(task);
    }
}

impl Scheduler for LocalSpawner {
    fn schedule(&self, task: Task) {
        if let Err(err) = self.spawn_local(async move { task() }) {
            tracing::warn!(%err, "local pool refused a deferred task");
        }
    }
}
