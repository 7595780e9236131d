use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam::queue::SegQueue;
use log::trace;

use crate::semaphore::UnfairSemaphore;

/// A unit of pool work: run once, returns nothing, may panic.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Upper bound on a single blocked wait before the reader is sent back
/// to re-check the queue and its own stop signal.
const WAKEUP_REARM: Duration = Duration::from_millis(100);

/// Usage hints supplied by the pool configuration. The channel stores
/// them for diagnostics; the queue itself is always safe for multiple
/// readers and writers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChannelHints {
    pub allow_synchronous_continuations: bool,
    pub single_reader: bool,
    pub single_writer: bool,
}

/// Unbounded MPMC FIFO of jobs with a single-shot completion signal.
///
/// Writers push into a lock-free queue and grant a wakeup credit through
/// the [`UnfairSemaphore`], capped at the CPU count so a burst of writes
/// cannot oversubscribe sleeping readers. After `complete()` writes are
/// refused while readers drain whatever is left before observing
/// end-of-stream.
pub(crate) struct WorkChannel {
    queue: SegQueue<Job>,
    wakeup: UnfairSemaphore,
    completed: AtomicBool,
    credit_cap: u64,
    hints: ChannelHints,
}

impl WorkChannel {
    pub(crate) fn new(hints: ChannelHints) -> WorkChannel {
        WorkChannel {
            queue: SegQueue::new(),
            wakeup: UnfairSemaphore::new(0),
            completed: AtomicBool::new(false),
            credit_cap: num_cpus::get().max(1) as u64,
            hints,
        }
    }

    /// Enqueues a job unless completion has been signalled.
    pub(crate) fn try_write(&self, job: Job) -> bool {
        if self.completed.load(Ordering::Acquire) {
            return false;
        }
        self.queue.push(job);
        if self.wakeup.available_permits() < self.credit_cap {
            self.wakeup.release(1);
        }
        true
    }

    /// Non-blocking pop. Keeps draining after completion.
    pub(crate) fn try_read(&self) -> Option<Job> {
        self.queue.pop()
    }

    /// Blocks until a job is likely available (`true`) or the channel has
    /// been completed and drained (`false`). Never pops; the caller reads
    /// via [`WorkChannel::try_read`].
    ///
    /// A wait that exceeds the re-arm bound also returns `true`: the
    /// caller re-checks its stop signal, misses the read, and comes back.
    /// That keeps parked readers responsive to cooperative shutdown and
    /// sweeps up any wakeup lost to a reader that exited.
    pub(crate) fn wait_for_read(&self) -> bool {
        loop {
            if !self.queue.is_empty() {
                return true;
            }
            if self.completed.load(Ordering::Acquire) {
                // Re-check: a write racing completion must still be drained.
                return !self.queue.is_empty();
            }
            if !self.wakeup.acquire(Some(WAKEUP_REARM)) {
                return true;
            }
        }
    }

    /// Signals completion. Idempotent; wakes blocked readers so they can
    /// observe end-of-stream once the queue drains.
    pub(crate) fn complete(&self) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!("work channel completed, waking readers");
        self.wakeup.release(self.credit_cap as u16);
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn hints(&self) -> ChannelHints {
        self.hints
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    fn channel() -> WorkChannel {
        WorkChannel::new(ChannelHints {
            allow_synchronous_continuations: true,
            single_reader: false,
            single_writer: true,
        })
    }

    #[test]
    fn jobs_round_trip_in_order() {
        let chan = channel();
        let seen = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let seen = Arc::clone(&seen);
            assert!(chan.try_write(Box::new(move || {
                seen.store(i, Ordering::SeqCst);
            })));
        }
        assert_eq!(chan.len(), 3);
        for i in 0..3 {
            let job = chan.try_read().unwrap();
            job();
            assert_eq!(seen.load(Ordering::SeqCst), i);
        }
        assert!(chan.try_read().is_none());
    }

    #[test]
    fn complete_is_idempotent_and_refuses_writes() {
        let chan = channel();
        assert!(chan.try_write(Box::new(|| ())));
        chan.complete();
        chan.complete();
        assert!(chan.is_completed());
        assert!(!chan.try_write(Box::new(|| ())));
        // The item written before completion still drains.
        assert!(chan.wait_for_read());
        assert!(chan.try_read().is_some());
        assert!(!chan.wait_for_read());
    }

    #[test]
    fn wait_for_read_blocks_until_write() {
        let chan = Arc::new(channel());
        let waiter = {
            let chan = Arc::clone(&chan);
            thread::spawn(move || chan.wait_for_read())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(chan.try_write(Box::new(|| ())));
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn wait_for_read_unblocks_on_completion() {
        let chan = Arc::new(channel());
        let waiter = {
            let chan = Arc::clone(&chan);
            thread::spawn(move || chan.wait_for_read())
        };
        thread::sleep(Duration::from_millis(20));
        chan.complete();
        assert!(!waiter.join().unwrap());
    }
}
