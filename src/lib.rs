#![deny(missing_docs)]

//! A dedicated worker-thread pool.
//!
//! `workpool` owns a bounded group of long-lived OS threads that consume
//! a shared queue of jobs, as an alternative to a process-global
//! work-stealing pool. An adaptive controller, piggy-backed on the
//! submission path, retires workers that have gone idle and spawns new
//! ones while the whole pool is busy, keeping the thread count between
//! the configured bounds. A [`TaskScheduler`] adapter layers an ordered
//! task queue on top, with support for executing a task inline on a
//! thread that is already running pool work.
//!
//! # Examples
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use workpool::{Pool, Settings};
//!
//! let pool = Pool::new(Settings::new(2)?);
//!
//! let counter = Arc::new(AtomicUsize::new(0));
//! for _ in 0..16 {
//!     let counter = Arc::clone(&counter);
//!     pool.submit(move || {
//!         counter.fetch_add(1, Ordering::Relaxed);
//!     });
//! }
//!
//! pool.close();
//! assert!(pool.wait_for_exit(None));
//! assert_eq!(counter.load(Ordering::Relaxed), 16);
//! # Ok::<(), workpool::PoolError>(())
//! ```

mod channel;
mod error;
mod pool;
mod scheduler;
mod semaphore;
mod settings;

pub use self::error::{PoolError, Result};
pub use self::pool::Pool;
pub use self::scheduler::{PoolScheduler, Task, TaskId, TaskScheduler};
pub use self::semaphore::UnfairSemaphore;
pub use self::settings::{PanicHandler, Settings, SettingsBuilder, ThreadType};
