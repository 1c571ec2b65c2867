use crate::errors::{Error, Result};
use crate::task::handle::Task;
use crate::utils::ScopeGuard;
use anyhow::anyhow;
use std::future::Future;
use std::rc::Rc;
use std::thread;

// Public API
pub(crate) mod context;
pub(crate) mod core;
pub(crate) mod notify;
pub(crate) mod selector;
pub(crate) mod timers;
pub(crate) mod waitq;

pub use selector::Interest;

#[cfg(test)]
mod tests;

use self::core::Core;

/// Default cap on lazily-spawned worker threads.
const MAX_WORKER_THREADS: usize = 64;

/// Configures and builds a [`Kernel`].
///
/// All knobs are process-facing (worker pool sizes, error logging) and are
/// frozen into the kernel at build time; there is no mutation after the
/// first `run`.
#[derive(Debug)]
pub struct Builder {
    log_errors: bool,
    max_worker_threads: usize,
    max_worker_processes: Option<usize>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            log_errors: true,
            max_worker_threads: MAX_WORKER_THREADS,
            max_worker_processes: None,
        }
    }

    /// Report tasks that terminate with a non-cancellation error through
    /// `log::error!`. Defaults to true.
    pub fn log_errors(mut self, val: bool) -> Self {
        self.log_errors = val;
        self
    }

    /// Cap on worker threads for `run_in_thread` and friends. Defaults
    /// to 64.
    pub fn max_worker_threads(mut self, val: usize) -> Self {
        self.max_worker_threads = val;
        self
    }

    /// Cap on concurrently running `run_in_process` children. Defaults to
    /// the host CPU count.
    pub fn max_worker_processes(mut self, val: usize) -> Self {
        self.max_worker_processes = Some(val);
        self
    }

    /// Creates the configured `Kernel`, ready to run coroutines.
    pub fn try_build(self) -> Result<Kernel> {
        let config: KernelConfig = self.try_into()?;
        let core = Core::try_new(config)?;
        Ok(Kernel {
            core: Rc::new(core),
        })
    }
}

/// Validated, immutable kernel configuration.
#[derive(Debug, Clone)]
pub(crate) struct KernelConfig {
    pub(crate) log_errors: bool,
    pub(crate) max_worker_threads: usize,
    pub(crate) max_worker_processes: usize,
}

impl TryFrom<Builder> for KernelConfig {
    type Error = Error;

    fn try_from(builder: Builder) -> Result<Self> {
        let max_worker_processes = match builder.max_worker_processes {
            Some(n) => n,
            None => thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        };

        if builder.max_worker_threads == 0 {
            return Err(Error::Other(anyhow!(
                "max_worker_threads must be greater than 0"
            )));
        }
        if max_worker_processes == 0 {
            return Err(Error::Other(anyhow!(
                "max_worker_processes must be greater than 0"
            )));
        }

        Ok(KernelConfig {
            log_errors: builder.log_errors,
            max_worker_threads: builder.max_worker_threads,
            max_worker_processes,
        })
    }
}

/// The task kernel: one event loop multiplexing cooperative tasks over I/O
/// readiness, timers, signals and worker completions.
///
/// `run` may be called repeatedly; daemon tasks spawned in one call keep
/// their state and continue in the next. `shutdown` cancels everything that
/// is left and releases process-wide resources.
pub struct Kernel {
    core: Rc<Core>,
}

impl Kernel {
    /// Run `fut` as a task, along with everything it spawns, until no
    /// non-daemon task remains. Returns the root task's output.
    pub fn run<F, T>(&mut self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + 'static,
        T: 'static,
    {
        context::install(Rc::clone(&self.core))?;
        let _guard = ScopeGuard::new(context::uninstall);

        log::debug!("kernel run: entering event loop");
        let root: Task<T> = self.core.spawn_task(fut, false);
        self.core.run_loop()?;

        root.into_result()
    }

    /// Cancel all remaining tasks (daemons included), drain them, restore
    /// signal dispositions and release the worker pools.
    pub fn shutdown(&mut self) -> Result<()> {
        context::install(Rc::clone(&self.core))?;
        let _guard = ScopeGuard::new(context::uninstall);

        self.core.cancel_all();
        self.core.run_until_empty()?;
        self.core.release_resources();
        log::debug!("kernel shut down");
        Ok(())
    }
}

#[cfg(test)]
impl Kernel {
    pub(crate) fn core_for_tests(&self) -> Rc<Core> {
        Rc::clone(&self.core)
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        // Best effort: a kernel dropped mid-run on a panicking thread must
        // not abort the process by double-panicking.
        let _ = self.shutdown();
    }
}

/// Run a single coroutine on a fresh default kernel, shutting the kernel
/// down afterwards.
pub fn run<F, T>(fut: F) -> Result<T>
where
    F: Future<Output = Result<T>> + 'static,
    T: 'static,
{
    let mut kernel = Builder::new().try_build()?;
    let result = kernel.run(fut);
    kernel.shutdown()?;
    result
}
