use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, trace};

use super::{Task, TaskId, TaskScheduler};
use crate::error::{PoolError, Result};
use crate::pool::Pool;

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Identity of the scheduler whose drain closure is running on this
    /// thread, or 0. An identity rather than a flag: nested drain
    /// closures of *different* schedulers must not satisfy each other's
    /// inline checks.
    static ACTIVE_SCHEDULER: Cell<u64> = Cell::new(0);
}

/// Marks the current thread as a drain worker for the scheduler and
/// restores the previous marking on every exit path.
struct DrainMark {
    previous: u64,
}

impl DrainMark {
    fn enter(scheduler_id: u64) -> DrainMark {
        DrainMark {
            previous: ACTIVE_SCHEDULER.with(|cell| cell.replace(scheduler_id)),
        }
    }
}

impl Drop for DrainMark {
    fn drop(&mut self) {
        ACTIVE_SCHEDULER.with(|cell| cell.set(self.previous));
    }
}

struct QueuedTask {
    id: TaskId,
    task: Task,
}

struct SchedState {
    tasks: VecDeque<QueuedTask>,
    /// Drain closures currently active in the pool for this scheduler.
    parallel_workers: usize,
    /// Queue depth; matches `tasks.len()` under the mutex.
    waiting_work: usize,
}

struct Shared {
    id: u64,
    pool: Pool,
    state: Mutex<SchedState>,
}

/// A [`TaskScheduler`] backed by a [`Pool`].
///
/// Tasks go into a mutex-guarded FIFO; for each burst of enqueues, up to
/// `max_concurrency` drain closures are submitted to the pool, and each
/// closure pops tasks in order until the FIFO is empty. Tasks popped by
/// the same closure run in submission order; closures run concurrently
/// with each other.
///
/// Cloning produces another handle onto the same queue.
#[derive(Clone)]
pub struct PoolScheduler {
    shared: Arc<Shared>,
}

impl PoolScheduler {
    /// Creates a scheduler over the given pool.
    pub fn new(pool: Pool) -> PoolScheduler {
        PoolScheduler {
            shared: Arc::new(Shared {
                id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
                pool,
                state: Mutex::new(SchedState {
                    tasks: VecDeque::new(),
                    parallel_workers: 0,
                    waiting_work: 0,
                }),
            }),
        }
    }

    /// Estimated queue depth.
    pub fn waiting_work(&self) -> usize {
        self.shared.state.lock().unwrap().waiting_work
    }

    /// Drain closures currently active on the pool for this scheduler.
    pub fn parallel_workers(&self) -> usize {
        self.shared.state.lock().unwrap().parallel_workers
    }

    /// Whether the current thread is inside one of this scheduler's
    /// drain closures.
    fn on_drain_thread(&self) -> bool {
        ACTIVE_SCHEDULER.with(|cell| cell.get()) == self.shared.id
    }
}

impl TaskScheduler for PoolScheduler {
    fn queue<F>(&self, task: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed));
        let spawn_drain = {
            let mut state = self.shared.state.lock().unwrap();
            state.tasks.push_back(QueuedTask {
                id,
                task: Box::new(task),
            });
            state.waiting_work += 1;
            if state.parallel_workers < self.shared.pool.settings().max_threads() {
                state.parallel_workers += 1;
                true
            } else {
                false
            }
        };

        if spawn_drain {
            let shared = Arc::clone(&self.shared);
            if !self.shared.pool.submit(move || drain(&shared)) {
                // Pool closed: roll the reservation back. The task stays
                // queued for try_dequeue or inline execution.
                let mut state = self.shared.state.lock().unwrap();
                state.parallel_workers -= 1;
                debug!(
                    "scheduler {}: pool closed, drain closure not scheduled",
                    self.shared.id
                );
            }
        }

        id
    }

    fn try_dequeue(&self, id: TaskId) -> Option<Task> {
        let mut state = self.shared.state.lock().unwrap();
        let position = state.tasks.iter().position(|queued| queued.id == id)?;
        state.waiting_work -= 1;
        state.tasks.remove(position).map(|queued| queued.task)
    }

    fn try_execute_inline<F>(&self, task: F) -> std::result::Result<(), F>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.on_drain_thread() {
            return Err(task);
        }
        run_task(&self.shared, Box::new(task));
        Ok(())
    }

    fn try_execute_inline_queued(&self, id: TaskId) -> bool {
        if !self.on_drain_thread() {
            return false;
        }
        match self.try_dequeue(id) {
            Some(task) => {
                run_task(&self.shared, task);
                true
            }
            None => false,
        }
    }

    fn scheduled_tasks(&self) -> Result<Vec<TaskId>> {
        match self.shared.state.try_lock() {
            Ok(state) => Ok(state.tasks.iter().map(|queued| queued.id).collect()),
            Err(_) => Err(PoolError::Unsupported(
                "scheduled-task enumeration while the queue is contended",
            )),
        }
    }

    fn max_concurrency(&self) -> usize {
        self.shared.pool.settings().max_threads()
    }
}

/// Body of a drain closure: pop and run tasks until the FIFO is empty,
/// then release the worker reservation.
fn drain(shared: &Arc<Shared>) {
    let _mark = DrainMark::enter(shared.id);
    trace!("scheduler {}: drain started", shared.id);
    loop {
        let queued = {
            let mut state = shared.state.lock().unwrap();
            match state.tasks.pop_front() {
                Some(queued) => {
                    state.waiting_work -= 1;
                    queued
                }
                None => {
                    state.parallel_workers -= 1;
                    trace!("scheduler {}: drain finished", shared.id);
                    return;
                }
            }
        };
        run_task(shared, queued.task);
    }
}

/// Runs one task, capturing a panic so the drain closure itself never
/// unwinds through the pool worker.
fn run_task(shared: &Shared, task: Task) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        error!("scheduler {}: task panicked", shared.id);
        shared.pool.settings().deliver_panic(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn scheduler(num_threads: usize) -> PoolScheduler {
        PoolScheduler::new(Pool::new(Settings::new(num_threads).unwrap()))
    }

    #[test]
    fn queued_tasks_run_in_order() {
        let scheduler = scheduler(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut ids = Vec::new();
        for i in 0..10 {
            let order = Arc::clone(&order);
            ids.push(scheduler.queue(move || {
                order.lock().unwrap().push(i);
            }));
        }
        assert_eq!(ids.len(), 10);

        let pool = scheduler.shared.pool.clone();
        pool.close();
        assert!(pool.wait_for_exit(Some(Duration::from_secs(10))));
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert_eq!(scheduler.waiting_work(), 0);
        assert_eq!(scheduler.parallel_workers(), 0);
    }

    #[test]
    fn try_dequeue_removes_a_pending_task() {
        // No pool workers consume the queue here: the pool is closed
        // first so drain closures are never scheduled.
        let pool = Pool::new(Settings::new(1).unwrap());
        pool.close();
        assert!(pool.wait_for_exit(Some(Duration::from_secs(10))));
        let scheduler = PoolScheduler::new(pool);

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        let id = scheduler.queue(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(scheduler.waiting_work(), 1);
        assert_eq!(scheduler.scheduled_tasks().unwrap(), vec![id]);

        let task = scheduler.try_dequeue(id).expect("task should be queued");
        assert_eq!(scheduler.waiting_work(), 0);
        assert!(scheduler.try_dequeue(id).is_none());
        task();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn inline_execution_is_refused_off_drain_threads() {
        let scheduler = scheduler(1);
        let result = scheduler.try_execute_inline(|| ());
        assert!(result.is_err());
        assert!(!scheduler.try_execute_inline_queued(TaskId(u64::MAX)));
    }

    #[test]
    fn task_panics_do_not_leak_workers() {
        let faults = Arc::new(AtomicUsize::new(0));
        let handler_faults = Arc::clone(&faults);
        let pool = Pool::new(
            Settings::builder()
                .num_threads(1)
                .panic_handler(move |_| {
                    handler_faults.fetch_add(1, Ordering::SeqCst);
                })
                .build()
                .unwrap(),
        );
        let scheduler = PoolScheduler::new(pool.clone());

        scheduler.queue(|| panic!("task failure"));
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        scheduler.queue(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });

        pool.close();
        assert!(pool.wait_for_exit(Some(Duration::from_secs(10))));
        assert_eq!(faults.load(Ordering::SeqCst), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.parallel_workers(), 0);
    }

    #[test]
    fn max_concurrency_tracks_settings() {
        let pool = Pool::new(
            Settings::builder()
                .num_threads(2)
                .max_threads(6)
                .build()
                .unwrap(),
        );
        let scheduler = PoolScheduler::new(pool);
        assert_eq!(scheduler.max_concurrency(), 6);
    }
}
