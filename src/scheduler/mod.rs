//! Task scheduling atop a [`Pool`](crate::Pool).
//!
//! A [`TaskScheduler`] multiplexes an ordered queue of higher-level tasks
//! onto shared pool threads. Instead of submitting every task to the pool
//! individually, the scheduler submits *drain closures*: each one pops
//! tasks from the scheduler's own FIFO until it runs dry, consolidating
//! many small tasks under a single pool submission. While a drain closure
//! runs, its thread is marked as belonging to the scheduler, which allows
//! a task to execute another task inline instead of paying a re-enqueue
//! round-trip.

use crate::error::Result;

mod pool_scheduler;

pub use self::pool_scheduler::PoolScheduler;

/// A unit of schedulable work: run once, returns nothing, may panic.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Opaque, process-unique identity of a queued task.
///
/// Closures have no object identity of their own, so the scheduler hands
/// one of these back from [`TaskScheduler::queue`]; it addresses the task
/// in `try_dequeue` and inline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) u64);

/// The contract a task runtime expects from its scheduler.
pub trait TaskScheduler {
    /// Appends a task to the scheduler's FIFO and returns its identity.
    /// Schedules a drain closure on the underlying pool unless enough
    /// are already active.
    fn queue<F>(&self, task: F) -> TaskId
    where
        F: FnOnce() + Send + 'static;

    /// Removes a queued task before it runs. Returns the task so the
    /// caller can run or drop it.
    fn try_dequeue(&self, id: TaskId) -> Option<Task>;

    /// Runs a not-yet-queued task on the current thread, provided this
    /// thread is inside one of this scheduler's drain closures. Otherwise
    /// the task is handed back unexecuted.
    fn try_execute_inline<F>(&self, task: F) -> std::result::Result<(), F>
    where
        F: FnOnce() + Send + 'static;

    /// Dequeues `id` and runs it on the current thread, provided this
    /// thread is inside one of this scheduler's drain closures and the
    /// task is still queued. Returns whether the task ran.
    fn try_execute_inline_queued(&self, id: TaskId) -> bool;

    /// Best-effort snapshot of queued task identities.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Unsupported`](crate::PoolError::Unsupported)
    /// when the queue lock is contended, so diagnostic callers can never
    /// deadlock against a running scheduler.
    fn scheduled_tasks(&self) -> Result<Vec<TaskId>>;

    /// Upper bound on concurrently active drain closures.
    fn max_concurrency(&self) -> usize;
}
