use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::error;

use crate::error::{PoolError, Result};

/// Handler invoked on a worker thread with the payload of a panicking job.
///
/// Handlers run on worker threads concurrently and must therefore be
/// thread-safe. A panic raised by the handler itself is caught and
/// discarded so that it can never take a worker down.
pub type PanicHandler = Arc<dyn Fn(Box<dyn Any + Send>) + Send + Sync>;

/// Sequence used to generate unique default pool names.
static NAME_SEQ: AtomicU64 = AtomicU64::new(0);

/// Smallest accepted `deadlock_timeout`.
const MIN_DEADLOCK_TIMEOUT: Duration = Duration::from_millis(1);

/// How worker threads relate to process shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadType {
    /// The pool joins its worker threads when the last handle is dropped,
    /// so outstanding work finishes before the owner moves on. The last
    /// handle must not be dropped from inside a submitted job: the worker
    /// would be joining itself.
    Foreground,
    /// Worker threads are detached when the last handle is dropped.
    Background,
}

/// Validated, immutable pool configuration.
///
/// Built through [`Settings::builder`]; all fields are fixed once
/// `build()` succeeds. Cloning is cheap and clones share the same panic
/// handler.
///
/// # Examples
///
/// ```
/// use workpool::Settings;
///
/// let settings = Settings::builder()
///     .num_threads(4)
///     .name("encoder")
///     .build()?;
/// assert_eq!(settings.min_threads(), 2);
/// # Ok::<(), workpool::PoolError>(())
/// ```
#[derive(Clone)]
pub struct Settings {
    num_threads: usize,
    min_threads: usize,
    max_threads: usize,
    thread_type: ThreadType,
    name: String,
    deadlock_timeout: Option<Duration>,
    panic_handler: PanicHandler,
    allow_synchronous_continuations: bool,
    synchronous_scheduler: bool,
    tick_interval: u64,
    retire_above: i32,
    busy_below: i32,
}

impl Settings {
    /// Creates settings for `num_threads` workers with all defaults.
    pub fn new(num_threads: usize) -> Result<Settings> {
        Settings::builder().num_threads(num_threads).build()
    }

    /// Returns a builder for customized settings.
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }

    /// Initial worker count.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Lower bound enforced by the resize controller: `min(2, num_threads)`.
    pub fn min_threads(&self) -> usize {
        self.min_threads
    }

    /// Upper bound enforced by the resize controller.
    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Whether workers are joined or detached on the pool's last drop.
    pub fn thread_type(&self) -> ThreadType {
        self.thread_type
    }

    /// Thread-name prefix; workers are named `"{name}_{worker_id}"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reserved for a future supervisor; validated but never consulted.
    pub fn deadlock_timeout(&self) -> Option<Duration> {
        self.deadlock_timeout
    }

    /// Whether a producer may resume a blocked consumer on its own thread.
    pub fn allow_synchronous_continuations(&self) -> bool {
        self.allow_synchronous_continuations
    }

    /// Whether `submit` is called from a bounded set of producers,
    /// enabling the resize tick on the submission path.
    pub fn synchronous_scheduler(&self) -> bool {
        self.synchronous_scheduler
    }

    /// Submissions between resize ticks.
    pub fn tick_interval(&self) -> u64 {
        self.tick_interval
    }

    /// Idleness above which a worker is eligible for retirement.
    pub fn retire_above(&self) -> i32 {
        self.retire_above
    }

    /// Idleness below which a worker counts as busy for the grow decision.
    pub fn busy_below(&self) -> i32 {
        self.busy_below
    }

    /// Hands a panic payload to the configured handler. A panic raised by
    /// the handler is swallowed so the calling worker stays alive.
    pub(crate) fn deliver_panic(&self, payload: Box<dyn Any + Send>) {
        let handler = &self.panic_handler;
        if panic::catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
            error!("panic handler panicked; ignoring");
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("num_threads", &self.num_threads)
            .field("min_threads", &self.min_threads)
            .field("max_threads", &self.max_threads)
            .field("thread_type", &self.thread_type)
            .field("name", &self.name)
            .field("deadlock_timeout", &self.deadlock_timeout)
            .field(
                "allow_synchronous_continuations",
                &self.allow_synchronous_continuations,
            )
            .field("synchronous_scheduler", &self.synchronous_scheduler)
            .field("tick_interval", &self.tick_interval)
            .field("retire_above", &self.retire_above)
            .field("busy_below", &self.busy_below)
            .finish()
    }
}

/// Builder for [`Settings`].
///
/// Unset options fall back to their defaults: `num_threads` from the CPU
/// count, a generated unique `name`, background threads, a no-op panic
/// handler, and the stock controller tunables.
pub struct SettingsBuilder {
    num_threads: Option<usize>,
    max_threads: Option<usize>,
    thread_type: ThreadType,
    name: Option<String>,
    deadlock_timeout: Option<Duration>,
    panic_handler: Option<PanicHandler>,
    allow_synchronous_continuations: bool,
    synchronous_scheduler: bool,
    tick_interval: u64,
    retire_above: i32,
    busy_below: i32,
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        SettingsBuilder {
            num_threads: None,
            max_threads: None,
            thread_type: ThreadType::Background,
            name: None,
            deadlock_timeout: None,
            panic_handler: None,
            allow_synchronous_continuations: true,
            synchronous_scheduler: true,
            tick_interval: 50,
            retire_above: 75,
            busy_below: 10,
        }
    }
}

impl SettingsBuilder {
    /// Sets the initial worker count. Must be greater than zero.
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    /// Overrides the derived upper bound for the resize controller.
    ///
    /// If not set, the bound is `max(num_threads, max(2, cpu_count - 1))`.
    pub fn max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = Some(max_threads);
        self
    }

    /// Sets whether workers are joined or detached on the last drop.
    pub fn thread_type(mut self, thread_type: ThreadType) -> Self {
        self.thread_type = thread_type;
        self
    }

    /// Sets the thread-name prefix.
    pub fn name<T: Into<String>>(mut self, name: T) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the reserved deadlock timeout. Must be at least 1 ms.
    pub fn deadlock_timeout(mut self, timeout: Duration) -> Self {
        self.deadlock_timeout = Some(timeout);
        self
    }

    /// Installs a handler for panics escaping submitted jobs.
    ///
    /// The handler runs on worker threads and must be thread-safe.
    pub fn panic_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Box<dyn Any + Send>) + Send + Sync + 'static,
    {
        self.panic_handler = Some(Arc::new(handler));
        self
    }

    /// Declares whether a producer may resume a blocked consumer inline.
    pub fn allow_synchronous_continuations(mut self, allow: bool) -> Self {
        self.allow_synchronous_continuations = allow;
        self
    }

    /// Declares the single-submitter contract, enabling the resize tick.
    pub fn synchronous_scheduler(mut self, synchronous: bool) -> Self {
        self.synchronous_scheduler = synchronous;
        self
    }

    /// Sets how many submissions pass between resize ticks.
    pub fn tick_interval(mut self, interval: u64) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Sets the idleness threshold above which workers are retired.
    pub fn retire_above(mut self, threshold: i32) -> Self {
        self.retire_above = threshold;
        self
    }

    /// Sets the idleness threshold below which workers count as busy.
    pub fn busy_below(mut self, threshold: i32) -> Self {
        self.busy_below = threshold;
        self
    }

    /// Validates the configuration and produces immutable [`Settings`].
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidSettings`] if `num_threads` is zero,
    /// `max_threads` is below `num_threads`, `deadlock_timeout` is below
    /// 1 ms, `tick_interval` is zero, or the idleness thresholds are out
    /// of range.
    pub fn build(self) -> Result<Settings> {
        let num_threads = self
            .num_threads
            .unwrap_or_else(|| num_cpus::get().max(1));
        if num_threads == 0 {
            return Err(PoolError::InvalidSettings(
                "num_threads must be greater than zero".to_owned(),
            ));
        }

        let min_threads = num_threads.min(2);
        let max_threads = match self.max_threads {
            Some(max) => {
                if max < num_threads {
                    return Err(PoolError::InvalidSettings(format!(
                        "max_threads ({}) must be at least num_threads ({})",
                        max, num_threads
                    )));
                }
                max
            }
            None => num_threads.max((num_cpus::get().saturating_sub(1)).max(2)),
        };

        if let Some(timeout) = self.deadlock_timeout {
            if timeout < MIN_DEADLOCK_TIMEOUT {
                return Err(PoolError::InvalidSettings(
                    "deadlock_timeout must be at least 1ms".to_owned(),
                ));
            }
        }

        if self.tick_interval == 0 {
            return Err(PoolError::InvalidSettings(
                "tick_interval must be greater than zero".to_owned(),
            ));
        }

        let range = 0..=100;
        if !range.contains(&self.retire_above) || !range.contains(&self.busy_below) {
            return Err(PoolError::InvalidSettings(
                "idleness thresholds must lie in 0..=100".to_owned(),
            ));
        }
        if self.busy_below > self.retire_above {
            return Err(PoolError::InvalidSettings(
                "busy_below must not exceed retire_above".to_owned(),
            ));
        }

        let name = self
            .name
            .unwrap_or_else(|| format!("workpool-{}", NAME_SEQ.fetch_add(1, Ordering::Relaxed)));

        Ok(Settings {
            num_threads,
            min_threads,
            max_threads,
            thread_type: self.thread_type,
            name,
            deadlock_timeout: self.deadlock_timeout,
            panic_handler: self.panic_handler.unwrap_or_else(|| Arc::new(|_| ())),
            allow_synchronous_continuations: self.allow_synchronous_continuations,
            synchronous_scheduler: self.synchronous_scheduler,
            tick_interval: self.tick_interval,
            retire_above: self.retire_above,
            busy_below: self.busy_below,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_bounds_from_num_threads() {
        let settings = Settings::new(1).unwrap();
        assert_eq!(settings.min_threads(), 1);
        assert!(settings.max_threads() >= 2);

        let settings = Settings::new(8).unwrap();
        assert_eq!(settings.min_threads(), 2);
        assert!(settings.max_threads() >= 8);
    }

    #[test]
    fn rejects_zero_threads() {
        assert!(Settings::new(0).is_err());
    }

    #[test]
    fn rejects_max_below_num() {
        let result = Settings::builder().num_threads(4).max_threads(2).build();
        assert!(result.is_err());
    }

    #[test]
    fn rejects_sub_millisecond_deadlock_timeout() {
        let result = Settings::builder()
            .num_threads(1)
            .deadlock_timeout(Duration::from_micros(10))
            .build();
        assert!(result.is_err());

        let result = Settings::builder()
            .num_threads(1)
            .deadlock_timeout(Duration::from_millis(1))
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_bad_tunables() {
        assert!(Settings::builder().num_threads(1).tick_interval(0).build().is_err());
        assert!(Settings::builder()
            .num_threads(1)
            .retire_above(10)
            .busy_below(20)
            .build()
            .is_err());
    }

    #[test]
    fn generated_names_are_unique() {
        let a = Settings::new(1).unwrap();
        let b = Settings::new(1).unwrap();
        assert_ne!(a.name(), b.name());
    }

    #[test]
    fn handler_panics_are_swallowed() {
        let settings = Settings::builder()
            .num_threads(1)
            .panic_handler(|_| panic!("handler blew up"))
            .build()
            .unwrap();
        settings.deliver_panic(Box::new("payload"));
    }
}
