use crate::task::TaskId;
use std::io;
use std::sync::Arc;

/// Outcome type used across the kernel and by user coroutines.
pub type Result<T> = std::result::Result<T, Error>;

/// A centralized error type for all kernel and primitive operations.
///
/// Cancellation and timeout are the two *injected* kinds: they are delivered
/// into a task through its currently pending trap rather than raised at the
/// call site. Everything else is returned synchronously to the caller.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Delivered into a task being cancelled. If it propagates out of the
    /// task, the task terminates silently with `cancelled == true`.
    #[error("task was cancelled")]
    Cancelled,

    /// Delivered when a `timeout_after` deadline expires. Treated as a kind
    /// of cancellation (see [`Error::is_cancellation`]); `ignore_after`
    /// swallows exactly this variant.
    #[error("operation timed out")]
    Timeout,

    /// Raised out of `join` when the joined task failed with anything other
    /// than cancellation. Wraps the original failure as the source.
    #[error("task {id} terminated with an error")]
    TaskError {
        id: TaskId,
        #[source]
        source: Arc<Error>,
    },

    /// A task future or a worker callable panicked.
    #[error("panic: {0}")]
    Panicked(String),

    /// Another task is already waiting for the same readiness direction on
    /// this file descriptor.
    #[error("fd {0} already has a task waiting for this event")]
    ResourceBusy(i32),

    /// Releasing a lock that the calling task does not hold.
    #[error("lock is not held by the calling task")]
    NotHeld,

    /// Releasing a bounded semaphore above its initial value.
    #[error("semaphore released too many times")]
    SemaphoreOverflow,

    /// `task_done` called more times than there were items put.
    #[error("task_done() called without a matching put()")]
    TooManyTaskDone,

    /// A task may not cancel itself.
    #[error("a task cannot cancel itself")]
    SelfCancel,

    /// A kernel service was requested outside of a running kernel.
    #[error("no kernel is running on this thread")]
    NoKernel,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A catch-all for user task failures and anything else unexpected.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True for the injected kinds that mean "this task is being torn down":
    /// plain cancellation and timeout expiry.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Timeout)
    }

    /// Rebuild the error a joiner observes from a terminated task's stored
    /// failure. Cancellation is reported as-is; everything else is wrapped.
    pub(crate) fn for_joiner(id: TaskId, source: &Arc<Error>) -> Error {
        if source.is_cancellation() {
            Error::Cancelled
        } else {
            Error::TaskError {
                id,
                source: Arc::clone(source),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_cancellation_taxonomy() {
        assert!(Error::Cancelled.is_cancellation());
        assert!(Error::Timeout.is_cancellation());
        assert!(!Error::NotHeld.is_cancellation());
        assert!(!Error::Other(anyhow!("boom")).is_cancellation());
    }

    #[test]
    fn test_joiner_error_wraps_non_cancellation() {
        let id = TaskId::next();
        let source = Arc::new(Error::Other(anyhow!("boom")));

        let err = Error::for_joiner(id, &source);
        assert!(matches!(err, Error::TaskError { .. }));

        let cancelled = Arc::new(Error::Cancelled);
        assert!(matches!(
            Error::for_joiner(id, &cancelled),
            Error::Cancelled
        ));
    }
}
