//! The dedicated worker-thread pool.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::channel::{ChannelHints, WorkChannel};
use crate::settings::{Settings, ThreadType};

mod worker;

use self::worker::{Worker, WorkerState, IDLE_DEAD};

/// A bounded group of long-lived OS threads consuming a shared queue of
/// jobs, supervised by an adaptive resize controller.
///
/// `Pool` is a cheap clonable handle; all clones drive the same workers.
/// Submitting is lock-free against the queue itself. Under the
/// `synchronous_scheduler` contract every fiftieth submission (by
/// default) additionally runs a resize tick that retires over-idle
/// workers down to `min_threads` and grows the pool toward `max_threads`
/// when every worker is busy.
///
/// # Examples
///
/// ```
/// use workpool::{Pool, Settings};
///
/// let pool = Pool::new(Settings::new(2)?);
/// assert!(pool.submit(|| println!("hello from a worker")));
/// pool.close();
/// assert!(pool.wait_for_exit(None));
/// # Ok::<(), workpool::PoolError>(())
/// ```
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    settings: Settings,
    channel: Arc<WorkChannel>,
    /// Resize-controller state. The mutex enforces the single-submitter
    /// contract instead of merely documenting it.
    state: Mutex<PoolState>,
}

struct PoolState {
    /// Worker slots. Grows up to `max_threads`, never shrinks; a `None`
    /// slot is a vacancy left by a dead worker awaiting replacement.
    slots: Vec<Option<Worker>>,
    /// Live worker count; equals the number of non-dead slots after
    /// every resize tick.
    num_threads: usize,
    /// Submission counter driving the periodic resize tick.
    clean_counter: u64,
    next_worker_id: usize,
}

/// Decisions of one resize tick, computed from an idleness snapshot.
struct ResizePlan {
    /// Slots whose worker has exited.
    dead: Vec<usize>,
    /// Slots to send a cooperative stop.
    stop: Vec<usize>,
    /// Whether to spawn replacements and possibly one extra worker.
    grow: bool,
    /// Live workers remaining after the dead slots are cleared.
    live: usize,
}

impl Pool {
    /// Creates a pool and spawns `settings.num_threads()` workers.
    pub fn new(settings: Settings) -> Pool {
        let channel = Arc::new(WorkChannel::new(ChannelHints {
            allow_synchronous_continuations: settings.allow_synchronous_continuations(),
            single_reader: false,
            single_writer: settings.synchronous_scheduler(),
        }));

        let num_threads = settings.num_threads();
        let mut slots = Vec::with_capacity(num_threads);
        for id in 0..num_threads {
            slots.push(Some(Worker::spawn(id, &settings, Arc::clone(&channel))));
        }

        debug!(
            "pool {}: started with {} workers (bounds {}..={}), hints {:?}",
            settings.name(),
            num_threads,
            settings.min_threads(),
            settings.max_threads(),
            channel.hints(),
        );

        Pool {
            inner: Arc::new(PoolInner {
                settings,
                channel,
                state: Mutex::new(PoolState {
                    slots,
                    num_threads,
                    clean_counter: 0,
                    next_worker_id: num_threads,
                }),
            }),
        }
    }

    /// Creates a pool sized to the machine with default settings.
    pub fn with_defaults() -> crate::Result<Pool> {
        Ok(Pool::new(Settings::builder().build()?))
    }

    /// Submits a job for execution on some worker thread.
    ///
    /// Returns `false` once the pool has been closed; the job is dropped
    /// in that case. A `true` return guarantees the job runs exactly once
    /// before the workers exit, and that a panic it raises is delivered
    /// to the configured panic handler rather than resurfacing here.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.inner.channel.try_write(Box::new(job)) {
            return false;
        }

        if self.inner.settings.synchronous_scheduler() {
            let mut state = self.inner.state.lock().unwrap();
            state.clean_counter += 1;
            if state.clean_counter % self.inner.settings.tick_interval() == 0 {
                state.clean_counter = 0;
                self.resize_tick(&mut state);
            }
        }

        true
    }

    /// Closes the pool: no further submissions are accepted, workers
    /// drain outstanding jobs and then exit. Does not block.
    pub fn close(&self) {
        self.inner.channel.complete();
    }

    /// Waits for every worker thread to exit. `None` waits forever.
    /// Returns `false` if the timeout expired first.
    pub fn wait_for_exit(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        // Snapshot outside the wait: recv on a worker's exit channel must
        // not hold the controller lock.
        let exits: Vec<_> = {
            let state = self.inner.state.lock().unwrap();
            state
                .slots
                .iter()
                .flatten()
                .map(|worker| worker.exit_receiver())
                .collect()
        };
        for exit in exits {
            if !Worker::wait_exit_on(&exit, deadline) {
                return false;
            }
        }
        true
    }

    /// Current live worker count.
    pub fn num_threads(&self) -> usize {
        self.inner.state.lock().unwrap().num_threads
    }

    /// The settings this pool was built with.
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.channel.is_completed()
    }

    /// One controller step: clear dead slots, retire over-idle workers
    /// above `min_threads`, and grow when shrunk below `min_threads` or
    /// when every worker is busy. Restores
    /// `min_threads <= num_threads <= max_threads` before returning.
    fn resize_tick(&self, state: &mut PoolState) {
        let settings = &self.inner.settings;
        let idles: Vec<Option<i32>> = state
            .slots
            .iter()
            .map(|slot| slot.as_ref().map(Worker::idle))
            .collect();
        let plan = plan_resize(&idles, state.num_threads, settings);

        for &index in &plan.dead {
            if let Some(worker) = &state.slots[index] {
                debug_assert_eq!(worker.state(), WorkerState::Dead);
                trace!(
                    "pool {}: clearing dead worker {} from slot {}",
                    settings.name(),
                    worker.id(),
                    index
                );
            }
            state.slots[index] = None;
        }
        for &index in &plan.stop {
            if let Some(worker) = &state.slots[index] {
                debug!(
                    "pool {}: retiring worker {} (idle {})",
                    settings.name(),
                    worker.id(),
                    worker.idle()
                );
                worker.stop();
            }
        }
        state.num_threads = plan.live;

        if plan.grow {
            if state.slots.iter().all(Option::is_some)
                && state.slots.len() < settings.max_threads()
            {
                state.slots.push(None);
            }
            for index in 0..state.slots.len() {
                if state.slots[index].is_none() {
                    let id = state.next_worker_id;
                    state.next_worker_id += 1;
                    debug!("pool {}: spawning worker {}", settings.name(), id);
                    state.slots[index] =
                        Some(Worker::spawn(id, settings, Arc::clone(&self.inner.channel)));
                    state.num_threads += 1;
                }
            }
        }

        debug_assert!(state.num_threads >= settings.min_threads());
        debug_assert!(state.num_threads <= settings.max_threads());
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.channel.complete();
        if self.settings.thread_type() == ThreadType::Foreground {
            let state = self.state.get_mut().unwrap();
            for slot in state.slots.iter_mut().flatten() {
                if let Some(handle) = slot.take_handle() {
                    let _ = handle.join();
                }
            }
        }
    }
}

/// Pure decision pass of the resize tick over an idleness snapshot
/// (`None` marks an empty slot). Scans in index order: dead workers are
/// struck from the live count, over-idle workers are retired while the
/// count stays above `min_threads`, and busy workers vote for growth.
fn plan_resize(idles: &[Option<i32>], num_threads: usize, settings: &Settings) -> ResizePlan {
    let mut live = num_threads;
    let mut stoppable = num_threads.saturating_sub(settings.min_threads());
    let mut running = 0usize;
    let mut dead = Vec::new();
    let mut stop = Vec::new();

    for (index, slot) in idles.iter().enumerate() {
        match *slot {
            Some(IDLE_DEAD) => {
                dead.push(index);
                live = live.saturating_sub(1);
                stoppable = stoppable.saturating_sub(1);
            }
            Some(idle) if stoppable > 0 && idle > settings.retire_above() => {
                stop.push(index);
                stoppable -= 1;
            }
            Some(idle) if idle < settings.busy_below() => running += 1,
            _ => {}
        }
    }

    let grow = live < settings.min_threads()
        || (running == live && live < settings.max_threads());

    ResizePlan {
        dead,
        stop,
        grow,
        live,
    }
}
