//! Bridges to external execution contexts.
//!
//! Work shipped to a worker thread or a worker process completes by storing
//! its result in a shared slot and poking the kernel's wakeup pipe; the
//! parked task resumes on the next selector tick. Cancellation semantics
//! differ by target:
//!
//! - a worker *process* is sent SIGTERM immediately;
//! - a worker *thread* cannot be interrupted: the task resumes with
//!   [`Error::Cancelled`] at once, while the thread finishes the callable,
//!   discards the result, and rejoins the pool ("set aside").

use crate::errors::{Error, Result};
use crate::kernel::context;
use crate::kernel::notify::RemoteMsg;
use crate::task::record::State;
use crate::traps;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::process::{Command, Output, Stdio};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

// Public API
pub(crate) mod pool;
pub use pool::{Executor, Job};

mod abide;
pub use abide::{abide, AbideLock, SyncLock};

/// Run a blocking callable on the kernel's thread pool and await its result.
pub async fn run_in_thread<F, R>(f: F) -> Result<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    call_on(
        |job| context::with_core(|core| core.thread_pool().submit_job(job)),
        f,
        None,
    )
    .await
}

/// Like [`run_in_thread`], but with a compensation to run on the worker if
/// the awaiting task is cancelled before the callable finishes.
pub(crate) async fn run_in_thread_with_rollback<F, R>(f: F, rollback: Rollback<R>) -> Result<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    call_on(
        |job| context::with_core(|core| core.thread_pool().submit_job(job)),
        f,
        Some(rollback),
    )
    .await
}

/// Run a blocking callable on a caller-supplied [`Executor`].
///
/// Same contract as [`run_in_thread`]; completion is observed through the
/// same wakeup mechanism, cancellation leaves the executor's worker to
/// finish and discard.
pub async fn run_in_executor<E, F, R>(executor: &E, f: F) -> Result<R>
where
    E: Executor + ?Sized,
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    call_on(
        |job| {
            executor.submit(job);
            Ok(())
        },
        f,
        None,
    )
    .await
}

/// Run `command` as a worker process and await its captured output.
///
/// At most `max_worker_processes` children run at a time; submitters over
/// the cap park FIFO. Cancelling the awaiting task SIGTERMs the child.
pub async fn run_in_process(mut command: Command) -> Result<Output> {
    traps::check_pending()?;

    // Claim a pool slot, parking while at capacity.
    loop {
        let (acquired, waiting) = context::with_core(|core| {
            let pool = core.process_pool();
            (pool.try_acquire(), Rc::clone(pool.waiting()))
        })?;
        if acquired {
            break;
        }
        traps::wait_on(waiting, State::QueueWait).await?;
    }

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            context::with_core(|core| {
                core.process_pool().release_slot();
                core.wake_one(core.process_pool().waiting());
            })?;
            return Err(Error::Io(e));
        }
    };
    let pid = Pid::from_raw(child.id() as i32);
    let injector = context::with_core(|core| core.injector())?;

    // The reaper runs on a pool thread; it frees the process slot whether
    // or not anyone is still waiting for the output.
    let reap = move || {
        let output = child.wait_with_output();
        injector.post(RemoteMsg::ProcessSlotFreed);
        output
    };

    match call_on(
        |job| context::with_core(|core| core.thread_pool().submit_job(job)),
        reap,
        None,
    )
    .await
    {
        Ok(output) => output.map_err(Error::Io),
        Err(e) => {
            if e.is_cancellation() {
                // Best effort: the child may already have exited.
                let _ = kill(pid, Signal::SIGTERM);
            }
            Err(e)
        }
    }
}

pub(crate) type Rollback<R> = Box<dyn FnOnce(R) + Send + 'static>;

struct JobShared<R> {
    slot: Mutex<Option<Result<R>>>,
    cancelled: AtomicBool,
}

/// Ship `f` through `submit` and park in `FUTURE_WAIT` until the worker
/// posts the result.
async fn call_on<S, F, R>(submit: S, f: F, rollback: Option<Rollback<R>>) -> Result<R>
where
    S: FnOnce(Job) -> Result<()>,
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    traps::check_pending()?;
    let record = context::current_record()?;
    let waker = context::with_core(|core| core.remote_waker(&record))?;

    let shared = Arc::new(JobShared {
        slot: Mutex::new(None),
        cancelled: AtomicBool::new(false),
    });

    let job: Job = {
        let shared = Arc::clone(&shared);
        Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(f));
            match result {
                Ok(value) => {
                    if shared.cancelled.load(Ordering::Acquire) {
                        // The awaiting task is gone; compensate and discard.
                        if let Some(rollback) = rollback {
                            rollback(value);
                        }
                    } else {
                        shared.slot.lock().replace(Ok(value));
                        waker.wake();
                    }
                }
                Err(payload) => {
                    if !shared.cancelled.load(Ordering::Acquire) {
                        shared
                            .slot
                            .lock()
                            .replace(Err(Error::Panicked(panic_text(payload))));
                        waker.wake();
                    }
                }
            }
        })
    };

    submit(job)?;
    JobWait { shared }.await
}

struct JobWait<R> {
    shared: Arc<JobShared<R>>,
}

impl<R> Future for JobWait<R> {
    type Output = Result<R>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let stepped = context::with_core(|core| {
            let Some(record) = core.current() else {
                return Poll::Ready(Err(Error::NoKernel));
            };
            if let Some(err) = record.take_pending() {
                // Set the worker aside: it finishes, discards, rejoins.
                this.shared.cancelled.store(true, Ordering::Release);
                return Poll::Ready(Err(err));
            }
            if let Some(result) = this.shared.slot.lock().take() {
                return Poll::Ready(result);
            }
            if let Err(e) = core.park_current_future() {
                return Poll::Ready(Err(e));
            }
            Poll::Pending
        });
        stepped.unwrap_or_else(|e| Poll::Ready(Err(e)))
    }
}

fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
