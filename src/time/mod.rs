//! Sleeping and deadlines.
//!
//! `timeout_after` and `ignore_after` are future combinators: they install
//! an absolute deadline for the current task on first poll and restore the
//! previous deadline on the way out, so scopes nest. Expiry is delivered
//! into whatever trap the task is blocked on as [`Error::Timeout`].

use crate::errors::{Error, Result};
use crate::kernel::context;
use crate::kernel::timers::TimerKey;
use crate::traps;
use pin_project::{pin_project, pinned_drop};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Park the current task for `duration`. A zero duration yields instead,
/// moving the task to the back of the ready queue.
pub async fn sleep(duration: Duration) -> Result<()> {
    if duration.is_zero() {
        return traps::yield_now().await;
    }
    Sleep {
        duration,
        parked: false,
    }
    .await
}

struct Sleep {
    duration: Duration,
    parked: bool,
}

impl Future for Sleep {
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
            if this.parked {
                // Natural wakeup: the deadline fired.
                return Poll::Ready(Ok(()));
            }
            if let Err(e) = core.park_current_timer(Instant::now() + this.duration) {
                return Poll::Ready(Err(e));
            }
            this.parked = true;
            Poll::Pending
        });
        stepped.unwrap_or_else(|e| Poll::Ready(Err(e)))
    }
}

/// Run `fut` under a deadline; expiry injects [`Error::Timeout`] into the
/// task and the error surfaces here.
pub fn timeout_after<F, T>(duration: Duration, fut: F) -> TimeoutAfter<F>
where
    F: Future<Output = Result<T>>,
{
    TimeoutAfter {
        inner: fut,
        duration,
        deadline: None,
        prev: None,
    }
}

/// Like [`timeout_after`], but expiry is swallowed and reported as
/// `Ok(None)`; any other error still propagates.
pub fn ignore_after<F, T>(duration: Duration, fut: F) -> IgnoreAfter<F>
where
    F: Future<Output = Result<T>>,
{
    IgnoreAfter {
        inner: timeout_after(duration, fut),
    }
}

#[pin_project(PinnedDrop)]
pub struct TimeoutAfter<F> {
    #[pin]
    inner: F,
    duration: Duration,
    deadline: Option<Instant>,
    /// The displaced outer deadline, present while ours is installed.
    prev: Option<Option<TimerKey>>,
}

impl<F> TimeoutAfter<F> {
    fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| d <= Instant::now())
    }
}

impl<F, T> Future for TimeoutAfter<F>
where
    F: Future<Output = Result<T>>,
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if this.deadline.is_none() {
            let deadline = Instant::now() + *this.duration;
            let prev = match context::with_core(|core| core.set_timeout(deadline)) {
                Ok(Ok(prev)) => prev,
                Ok(Err(e)) | Err(e) => return Poll::Ready(Err(e)),
            };
            *this.deadline = Some(deadline);
            *this.prev = Some(prev);
        }

        match this.inner.poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(res) => {
                // Restore the outer deadline; if it already passed while it
                // was masked, the timeout surfaces now.
                let restored = match this.prev.take() {
                    Some(prev) => {
                        match context::with_core(|core| core.unset_timeout(prev)) {
                            Ok(r) => r,
                            Err(e) => Err(e),
                        }
                    }
                    None => Ok(()),
                };
                Poll::Ready(match (res, restored) {
                    (Ok(v), Ok(())) => Ok(v),
                    (Ok(_), Err(e)) => Err(e),
                    (Err(e), _) => Err(e),
                })
            }
        }
    }
}

#[pinned_drop]
impl<F> PinnedDrop for TimeoutAfter<F> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        // Dropped mid-flight (never polled to completion): put the outer
        // deadline back without delivering anything.
        if let Some(prev) = this.prev.take() {
            let _ = context::with_core(|core| core.restore_timeout(prev));
        }
    }
}

#[pin_project]
pub struct IgnoreAfter<F> {
    #[pin]
    inner: TimeoutAfter<F>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel;
    use rstest::rstest;

    #[rstest]
    #[case::fifty(Duration::from_millis(50))]
    #[case::one_twenty(Duration::from_millis(120))]
    fn test_sleep_duration_is_accurate(#[case] duration: Duration) -> anyhow::Result<()> {
        let start = Instant::now();
        kernel::run(async move { sleep(duration).await })?;
        let elapsed = start.elapsed();

        // Never shorter than asked for; the upper margin absorbs scheduler
        // latency on loaded machines.
        assert!(elapsed >= duration, "woke early: {elapsed:?} < {duration:?}");
        assert!(
            elapsed < duration + Duration::from_millis(400),
            "woke far too late: {elapsed:?}"
        );
        Ok(())
    }
}

impl<F, T> Future for IgnoreAfter<F>
where
    F: Future<Output = Result<T>>,
{
    type Output = Result<Option<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        match this.inner.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(v)) => Poll::Ready(Ok(Some(v))),
            Poll::Ready(Err(Error::Timeout)) if this.inner.expired() => Poll::Ready(Ok(None)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
        }
    }
}
