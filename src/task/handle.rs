use crate::errors::{Error, Result};
use crate::kernel::context;
use crate::task::record::{State, TaskRecord};
use crate::task::TaskId;
use crate::traps;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Spawn `fut` as a new task. Returns only after the child has run at least
/// one cycle, so the caller can observe that it started.
pub async fn spawn<F, T>(fut: F) -> Result<Task<T>>
where
    F: Future<Output = Result<T>> + 'static,
    T: 'static,
{
    spawn_inner(fut, false).await
}

/// Spawn a daemon task: one whose liveness does not keep the kernel from
/// returning out of `run`.
pub async fn spawn_daemon<F, T>(fut: F) -> Result<Task<T>>
where
    F: Future<Output = Result<T>> + 'static,
    T: 'static,
{
    spawn_inner(fut, true).await
}

async fn spawn_inner<F, T>(fut: F, daemon: bool) -> Result<Task<T>>
where
    F: Future<Output = Result<T>> + 'static,
    T: 'static,
{
    traps::check_pending()?;
    let task = context::with_core(|core| core.spawn_task(fut, daemon))?;
    // The child sits ahead of us in the ready queue; one yield guarantees
    // it gets its first cycle before spawn returns.
    traps::yield_now().await?;
    Ok(task)
}

/// A handle on the task currently being polled.
pub async fn current_task() -> Result<TaskRef> {
    Ok(TaskRef {
        record: context::current_record()?,
    })
}

/// A cheap, clonable reference to a task: identity, observable state, and
/// the cancel/wait operations. Carries no result value.
#[derive(Clone)]
pub struct TaskRef {
    pub(crate) record: Rc<TaskRecord>,
}

impl TaskRef {
    pub fn id(&self) -> TaskId {
        self.record.id
    }

    pub fn daemon(&self) -> bool {
        self.record.daemon
    }

    /// Scheduling state name, for diagnostics (`"READY"`, `"TIME_SLEEP"`,
    /// ...).
    pub fn state(&self) -> &'static str {
        self.record.state().name()
    }

    /// Number of times this task has been resumed.
    pub fn cycles(&self) -> u64 {
        self.record.cycles()
    }

    pub fn terminated(&self) -> bool {
        self.record.terminated.get()
    }

    pub fn cancelled(&self) -> bool {
        self.record.cancelled.get()
    }

    /// The error this task terminated with, if any.
    pub fn error(&self) -> Option<Arc<Error>> {
        self.record.outcome()
    }

    /// Wait for this task to terminate, leaving its result in place.
    pub fn wait(&self) -> impl Future<Output = Result<()>> {
        WaitTask {
            target: Rc::clone(&self.record),
        }
    }

    /// Cancel this task and wait until it has terminated.
    ///
    /// Returns false if the task had already terminated. A second cancel
    /// racing a first one simply waits for the same termination. A task
    /// cannot cancel itself.
    pub fn cancel(&self) -> impl Future<Output = Result<bool>> {
        CancelTask {
            target: Rc::clone(&self.record),
            requested: false,
        }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// An owned handle on a spawned task, carrying its typed result.
///
/// Joining consumes the handle; observers that only need identity or
/// cancellation can clone out the [`TaskRef`] it derefs to.
pub struct Task<T> {
    r: TaskRef,
    value: Rc<RefCell<Option<T>>>,
}

impl<T> Task<T> {
    pub(crate) fn new(record: Rc<TaskRecord>, value: Rc<RefCell<Option<T>>>) -> Self {
        Self {
            r: TaskRef { record },
            value,
        }
    }

    /// Wait for the task to terminate and return its result.
    ///
    /// A task that failed yields [`Error::TaskError`] wrapping the original
    /// failure; a cancelled task yields [`Error::Cancelled`].
    pub async fn join(self) -> Result<T> {
        self.r.wait().await?;
        self.into_result()
    }

    /// Result extraction for an already-terminated task.
    pub(crate) fn into_result(self) -> Result<T> {
        if let Some(err) = self.r.record.outcome() {
            return Err(Error::for_joiner(self.r.id(), &err));
        }
        self.value
            .borrow_mut()
            .take()
            .ok_or_else(|| Error::Other(anyhow::anyhow!("task result already taken")))
    }

    /// A clonable, value-free reference to the same task.
    pub fn as_ref(&self) -> TaskRef {
        self.r.clone()
    }
}

impl<T> Deref for Task<T> {
    type Target = TaskRef;

    fn deref(&self) -> &Self::Target {
        &self.r
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.r.id())
            .field("state", &self.r.state())
            .finish()
    }
}

struct WaitTask {
    target: Rc<TaskRecord>,
}

impl Future for WaitTask {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let stepped = context::with_core(|core| {
            let Some(record) = core.current() else {
                return Poll::Ready(Err(Error::NoKernel));
            };
            if let Some(err) = record.take_pending() {
                return Poll::Ready(Err(err));
            }
            if this.target.terminated.get() {
                return Poll::Ready(Ok(()));
            }
            if let Err(e) = core.park_current_on_queue(&this.target.joiners, State::JoinWait) {
                return Poll::Ready(Err(e));
            }
            Poll::Pending
        });
        stepped.unwrap_or_else(|e| Poll::Ready(Err(e)))
    }
}

struct CancelTask {
    target: Rc<TaskRecord>,
    requested: bool,
}

impl Future for CancelTask {
    type Output = Result<bool>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let stepped = context::with_core(|core| {
            let Some(record) = core.current() else {
                return Poll::Ready(Err(Error::NoKernel));
            };
            if let Some(err) = record.take_pending() {
                return Poll::Ready(Err(err));
            }
            if !this.requested {
                if this.target.terminated.get() {
                    return Poll::Ready(Ok(false));
                }
                if this.target.id == record.id {
                    return Poll::Ready(Err(Error::SelfCancel));
                }
                core.cancel(&this.target);
                this.requested = true;
            }
            if this.target.terminated.get() {
                return Poll::Ready(Ok(true));
            }
            // Park until the cancellation lands; a second canceller ends up
            // here too, piggybacking on the first.
            if let Err(e) = core.park_current_on_queue(&this.target.joiners, State::JoinWait) {
                return Poll::Ready(Err(e));
            }
            Poll::Pending
        });
        stepped.unwrap_or_else(|e| Poll::Ready(Err(e)))
    }
}
