//! A latency-biased counting semaphore.
//!
//! `UnfairSemaphore` deliberately prefers threads that started waiting
//! most recently: they are still hot in cache and can often be handed a
//! permit without any kernel transition. Arriving threads first spin in
//! user space; only when their spin budget runs out do they park on the
//! kernel-side primitive. Released permits go to spinners first, then to
//! parked waiters, and any surplus is banked as credit for future
//! spinners.
//!
//! All user-space state lives in a single 64-bit word mutated exclusively
//! through compare-and-swap, packed as four fields of at most `0x7FFF`
//! each: spinner count, permits reserved for spinners, waiter count, and
//! permits reserved for waiters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;

/// Upper bound for each packed field.
const FIELD_MAX: u64 = 0x7FFF;

const SPINNERS_SHIFT: u32 = 0;
const SPINNER_CREDIT_SHIFT: u32 = 16;
const WAITERS_SHIFT: u32 = 32;
const WAITER_CREDIT_SHIFT: u32 = 48;

/// Baseline iterations granted to a lone spinner on a single core.
const SPIN_BASELINE: f64 = 50.0;

/// Snapshot of the packed state word.
///
/// Transition methods compose a new value purely; the CAS loop in
/// [`UnfairSemaphore`] is the only mutator of the shared word.
#[derive(Clone, Copy, PartialEq, Eq)]
struct Counts(u64);

impl Counts {
    fn field(self, shift: u32) -> u64 {
        (self.0 >> shift) & 0xFFFF
    }

    fn with_field(self, shift: u32, value: u64) -> Counts {
        Counts((self.0 & !(0xFFFF << shift)) | (value << shift))
    }

    fn spinners(self) -> u64 {
        self.field(SPINNERS_SHIFT)
    }

    fn spinner_credit(self) -> u64 {
        self.field(SPINNER_CREDIT_SHIFT)
    }

    fn waiters(self) -> u64 {
        self.field(WAITERS_SHIFT)
    }

    fn waiter_credit(self) -> u64 {
        self.field(WAITER_CREDIT_SHIFT)
    }

    fn add_spinner(self) -> Counts {
        self.with_field(SPINNERS_SHIFT, self.spinners() + 1)
    }

    fn remove_spinner(self) -> Counts {
        self.with_field(SPINNERS_SHIFT, self.spinners() - 1)
    }

    fn add_waiter(self) -> Counts {
        self.with_field(WAITERS_SHIFT, self.waiters() + 1)
    }

    fn remove_waiter(self) -> Counts {
        self.with_field(WAITERS_SHIFT, self.waiters() - 1)
    }

    fn add_spinner_credit(self, n: u64) -> Counts {
        self.with_field(SPINNER_CREDIT_SHIFT, self.spinner_credit() + n)
    }

    fn take_spinner_credit(self) -> Counts {
        self.with_field(SPINNER_CREDIT_SHIFT, self.spinner_credit() - 1)
    }

    fn add_waiter_credit(self, n: u64) -> Counts {
        self.with_field(WAITER_CREDIT_SHIFT, self.waiter_credit() + n)
    }

    fn take_waiter_credit(self) -> Counts {
        self.with_field(WAITER_CREDIT_SHIFT, self.waiter_credit() - 1)
    }

    /// Field-range invariants, checked in debug builds after every
    /// successful CAS.
    fn check(self) {
        debug_assert!(self.spinners() <= FIELD_MAX);
        debug_assert!(self.spinner_credit() <= FIELD_MAX);
        debug_assert!(self.waiters() <= FIELD_MAX);
        debug_assert!(self.waiter_credit() <= FIELD_MAX);
        debug_assert!(self.spinner_credit() + self.waiter_credit() <= FIELD_MAX);
    }
}

/// Kernel-side stand-in: a condvar-guarded permit count that parked
/// threads block on once their spin budget is exhausted.
struct KernelSemaphore {
    permits: Mutex<u64>,
    available: Condvar,
}

impl KernelSemaphore {
    fn new() -> KernelSemaphore {
        KernelSemaphore {
            permits: Mutex::new(0),
            available: Condvar::new(),
        }
    }

    /// Blocks until a permit is taken or the timeout elapses.
    fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut permits = self.permits.lock().unwrap();
        match timeout {
            None => {
                while *permits == 0 {
                    permits = self.available.wait(permits).unwrap();
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while *permits == 0 {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        return false;
                    };
                    permits = self.available.wait_timeout(permits, remaining).unwrap().0;
                }
            }
        }
        *permits -= 1;
        true
    }

    fn post(&self, n: u64) {
        let mut permits = self.permits.lock().unwrap();
        *permits += n;
        if n == 1 {
            self.available.notify_one();
        } else {
            self.available.notify_all();
        }
    }
}

/// A counting semaphore that favors recently-arrived waiters.
///
/// Unfairness is the point: handing permits to the hottest threads avoids
/// kernel transitions and cache misses on the handoff path. Do not use it
/// where FIFO admission matters.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use workpool::UnfairSemaphore;
///
/// let sem = UnfairSemaphore::new(1);
/// assert!(sem.acquire(Some(Duration::from_millis(10))));
/// sem.release(1);
/// assert!(sem.acquire(Some(Duration::from_millis(10))));
/// ```
pub struct UnfairSemaphore {
    /// Packed spinner/waiter state; padded to keep the hot word off
    /// neighboring cache lines.
    state: CachePadded<AtomicU64>,
    kernel: KernelSemaphore,
}

impl UnfairSemaphore {
    /// Creates a semaphore with `permits` immediately available.
    pub fn new(permits: u16) -> UnfairSemaphore {
        let initial = Counts(0).add_spinner_credit(u64::from(permits));
        UnfairSemaphore {
            state: CachePadded::new(AtomicU64::new(initial.0)),
            kernel: KernelSemaphore::new(),
        }
    }

    /// Acquires one permit, blocking up to `timeout` (forever if `None`).
    ///
    /// Returns `true` if a permit was obtained. The spin phase is bounded
    /// by a budget scaled to CPU count and current spinner pressure; the
    /// timeout applies to the kernel wait that follows it.
    pub fn acquire(&self, timeout: Option<Duration>) -> bool {
        let mut current = self.load();
        loop {
            if current.spinner_credit() > 0 {
                match self.cas(current, current.take_spinner_credit()) {
                    Ok(()) => return true,
                    Err(actual) => current = actual,
                }
            } else {
                match self.cas(current, current.add_spinner()) {
                    Ok(()) => break,
                    Err(actual) => current = actual,
                }
            }
        }
        self.acquire_slow(timeout)
    }

    /// Spin phase: poll for spinner credit, demoting to a kernel waiter
    /// once the budget is exhausted.
    fn acquire_slow(&self, timeout: Option<Duration>) -> bool {
        let cpus = num_cpus::get().max(1) as f64;
        let mut spins: u64 = 0;
        loop {
            let current = self.load();
            if current.spinner_credit() > 0 {
                // Take the credit and retire this spinner in one step.
                if self
                    .cas(current, current.take_spinner_credit().remove_spinner())
                    .is_ok()
                {
                    return true;
                }
                continue;
            }

            let budget = spin_budget(current.spinners(), cpus);
            if spins >= budget {
                if self
                    .cas(current, current.remove_spinner().add_waiter())
                    .is_ok()
                {
                    break;
                }
                continue;
            }

            spins += 1;
            // A zero-duration sleep, not yield_now: yielding is not
            // guaranteed to migrate across cores on all platforms.
            thread::sleep(Duration::ZERO);
        }
        self.wait_kernel(timeout)
    }

    /// Kernel wait phase; on wake this thread stops being a waiter and,
    /// if the wait succeeded, consumes one waiter-reserved permit.
    fn wait_kernel(&self, timeout: Option<Duration>) -> bool {
        let acquired = self.kernel.wait(timeout);
        let mut current = self.load();
        loop {
            let mut next = current.remove_waiter();
            if acquired {
                next = next.take_waiter_credit();
            }
            match self.cas(current, next) {
                Ok(()) => return acquired,
                Err(actual) => current = actual,
            }
        }
    }

    /// Releases `count` permits.
    ///
    /// Permits are handed out top down: spinners that have no credit yet
    /// are satisfied first (no kernel transition), parked waiters next,
    /// and whatever remains is banked as credit for future spinners. The
    /// whole partition commits through a single CAS; the kernel post for
    /// woken waiters happens after the CAS succeeds.
    pub fn release(&self, count: u16) {
        let mut current = self.load();
        loop {
            let mut remaining = u64::from(count);
            let mut next = current;

            let hot = remaining.min(next.spinners().saturating_sub(next.spinner_credit()));
            next = next.add_spinner_credit(hot);
            remaining -= hot;

            let woken = remaining.min(next.waiters().saturating_sub(next.waiter_credit()));
            next = next.add_waiter_credit(woken);
            remaining -= woken;

            next = next.add_spinner_credit(remaining);

            match self.cas(current, next) {
                Ok(()) => {
                    if woken > 0 {
                        self.kernel.post(woken);
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Permits currently reserved for spinners or waiters. A heuristic
    /// snapshot; callers use it to cap outstanding wakeup credits.
    pub fn available_permits(&self) -> u64 {
        let counts = self.load();
        counts.spinner_credit() + counts.waiter_credit()
    }

    fn load(&self) -> Counts {
        Counts(self.state.load(Ordering::Acquire))
    }

    fn cas(&self, current: Counts, next: Counts) -> Result<(), Counts> {
        match self.state.compare_exchange_weak(
            current.0,
            next.0,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                next.check();
                Ok(())
            }
            Err(actual) => Err(Counts(actual)),
        }
    }
}

/// Per-spinner budget: `round(50 / (spinners / cpu_count))`. More
/// contending spinners means each one gives up sooner.
fn spin_budget(spinners: u64, cpus: f64) -> u64 {
    let spinners = spinners.max(1) as f64;
    (SPIN_BASELINE / (spinners / cpus)).round() as u64
}
