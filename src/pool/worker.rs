use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};
use log::{debug, error, trace};

use crate::channel::WorkChannel;
use crate::settings::Settings;

/// Idleness value marking a worker whose thread has exited.
pub(crate) const IDLE_DEAD: i32 = -1;

/// Cap of the idleness estimator.
const IDLE_MAX: i32 = 100;

/// Lifecycle of a worker as seen by the resize controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerState {
    /// Consuming the channel.
    Running,
    /// Stop requested; exits at the top of the next loop iteration.
    Stopping,
    /// The thread has returned. Terminal; dead slots are replaced,
    /// never resurrected.
    Dead,
}

/// One dedicated OS thread draining the work channel.
///
/// The worker maintains a coarse idleness estimator in `0..=100`:
/// executing a job decrements it by 1, polling an empty queue increments
/// it by 2. The resize controller reads the estimator to decide which
/// workers to retire; `-1` is the terminal value stored when the thread
/// exits. The estimator has a single writer (the worker thread), so plain
/// atomic loads and stores suffice.
pub(crate) struct Worker {
    id: usize,
    idle: Arc<AtomicI32>,
    stop: Arc<AtomicBool>,
    exit: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns a worker thread named `"{settings.name}_{id}"`.
    pub(crate) fn spawn(id: usize, settings: &Settings, channel: Arc<WorkChannel>) -> Worker {
        let idle = Arc::new(AtomicI32::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = bounded(1);

        let thread_settings = settings.clone();
        let thread_idle = Arc::clone(&idle);
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(format!("{}_{}", settings.name(), id))
            .spawn(move || {
                run(id, &channel, &thread_idle, &thread_stop, &thread_settings);
                thread_idle.store(IDLE_DEAD, Ordering::Release);
                let _ = exit_tx.send(());
            })
            .expect("failed to spawn worker thread");

        Worker {
            id,
            idle,
            stop,
            exit: exit_rx,
            handle: Some(handle),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Current idleness estimate; [`IDLE_DEAD`] once the thread exited.
    pub(crate) fn idle(&self) -> i32 {
        self.idle.load(Ordering::Acquire)
    }

    /// Requests a cooperative stop. The worker exits at the next loop
    /// iteration; one blocked in `wait_for_read` leaves at its next
    /// wakeup without consuming the job that woke it.
    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub(crate) fn state(&self) -> WorkerState {
        if self.idle() == IDLE_DEAD {
            WorkerState::Dead
        } else if self.stop.load(Ordering::Acquire) {
            WorkerState::Stopping
        } else {
            WorkerState::Running
        }
    }

    /// A clone of the exit signal, so callers can wait without keeping
    /// the worker (or any pool lock) alive.
    pub(crate) fn exit_receiver(&self) -> Receiver<()> {
        self.exit.clone()
    }

    /// Waits on an exit signal. Returns `false` only on timeout; a
    /// disconnected signal means the thread is gone and counts as exited.
    pub(crate) fn wait_exit_on(exit: &Receiver<()>, deadline: Option<Instant>) -> bool {
        match deadline {
            None => {
                let _ = exit.recv();
                true
            }
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match exit.recv_timeout(remaining) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
                    Err(RecvTimeoutError::Timeout) => false,
                }
            }
        }
    }

    pub(crate) fn take_handle(&mut self) -> Option<JoinHandle<()>> {
        self.handle.take()
    }
}

/// Worker thread body.
fn run(
    id: usize,
    channel: &WorkChannel,
    idle: &AtomicI32,
    stop: &AtomicBool,
    settings: &Settings,
) {
    debug!("worker {}: started", id);
    loop {
        if stop.load(Ordering::Acquire) {
            debug!("worker {}: stop requested, exiting", id);
            return;
        }

        match channel.try_read() {
            Some(job) => {
                let estimate = idle.load(Ordering::Relaxed);
                idle.store((estimate - 1).max(0), Ordering::Relaxed);
                trace!("worker {}: executing job", id);
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    error!("worker {}: job panicked", id);
                    settings.deliver_panic(payload);
                }
            }
            None => {
                let estimate = idle.load(Ordering::Relaxed);
                idle.store((estimate + 2).min(IDLE_MAX), Ordering::Relaxed);
                if !channel.wait_for_read() {
                    debug!("worker {}: channel completed, exiting", id);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelHints;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn test_channel() -> Arc<WorkChannel> {
        Arc::new(WorkChannel::new(ChannelHints {
            allow_synchronous_continuations: true,
            single_reader: false,
            single_writer: true,
        }))
    }

    #[test]
    fn executes_jobs_and_exits_on_completion() {
        let channel = test_channel();
        let settings = Settings::new(1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            channel.try_write(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let worker = Worker::spawn(0, &settings, Arc::clone(&channel));
        channel.complete();
        assert!(Worker::wait_exit_on(
            &worker.exit_receiver(),
            Some(Instant::now() + Duration::from_secs(5)),
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(worker.state(), WorkerState::Dead);
    }

    #[test]
    fn job_panic_reaches_handler_and_worker_survives() {
        let channel = test_channel();
        let faults = Arc::new(AtomicUsize::new(0));
        let handler_faults = Arc::clone(&faults);
        let settings = Settings::builder()
            .num_threads(1)
            .panic_handler(move |_| {
                handler_faults.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();

        let worker = Worker::spawn(0, &settings, Arc::clone(&channel));
        channel.try_write(Box::new(|| panic!("job failure")));
        let after = Arc::new(AtomicUsize::new(0));
        let after_clone = Arc::clone(&after);
        channel.try_write(Box::new(move || {
            after_clone.fetch_add(1, Ordering::SeqCst);
        }));

        channel.complete();
        assert!(Worker::wait_exit_on(
            &worker.exit_receiver(),
            Some(Instant::now() + Duration::from_secs(5)),
        ));
        assert_eq!(faults.load(Ordering::SeqCst), 1);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_is_honored() {
        let channel = test_channel();
        let settings = Settings::new(1).unwrap();
        let worker = Worker::spawn(0, &settings, Arc::clone(&channel));
        assert_eq!(worker.state(), WorkerState::Running);

        worker.stop();
        // A parked worker leaves at its next wakeup; the channel re-arms
        // blocked readers on a bounded interval, so the exit is prompt.
        assert!(Worker::wait_exit_on(
            &worker.exit_receiver(),
            Some(Instant::now() + Duration::from_secs(5)),
        ));
        assert_eq!(worker.idle(), IDLE_DEAD);
    }
}
