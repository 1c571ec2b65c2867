//! A single-threaded cooperative task kernel.
//!
//! One event loop multiplexes user coroutines (plain Rust futures returning
//! [`Result`]) over nonblocking I/O readiness, timers, signals, worker
//! pools and synchronization primitives, with precise cancellation and
//! timeout semantics: cancelling a blocked task evicts it from whatever it
//! is parked on and injects [`Error::Cancelled`] into its pending
//! operation.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! fn main() -> corral::Result<()> {
//!     corral::run(async {
//!         let child = corral::spawn(async {
//!             corral::sleep(Duration::from_millis(10)).await?;
//!             Ok(42)
//!         })
//!         .await?;
//!         let value = child.join().await?;
//!         assert_eq!(value, 42);
//!         Ok(())
//!     })
//! }
//! ```

pub mod errors;
pub use errors::{Error, Result};

pub mod kernel;
pub use kernel::{run, Builder, Kernel};

pub mod task;
pub use task::{current_task, spawn, spawn_daemon, Task, TaskId, TaskRef};

pub mod time;
pub use time::{ignore_after, sleep, timeout_after};

pub mod traps;

pub mod sync;

pub mod signals;
pub use signals::{Signal, SignalSet};

pub mod workers;
pub use workers::{
    abide, run_in_executor, run_in_process, run_in_thread, AbideLock, Executor, SyncLock,
};

pub(crate) mod utils;
