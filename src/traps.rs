//! Low-level kernel traps.
//!
//! A trap is a small future that requests one kernel service: it records the
//! current task into the matching wait structure on first poll, returns
//! `Pending`, and observes the wakeup value or the injected error when the
//! kernel polls it again. Traps are the only legal way to touch kernel
//! state; the public synchronization primitives and timer helpers are all
//! built out of them.

use crate::errors::{Error, Result};
use crate::kernel::context;
use crate::kernel::selector::Interest;
use crate::kernel::waitq::WaitQueue;
use crate::task::record::State;
use std::future::Future;
use std::io;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// Deliver any pending cancellation or timeout to the current task without
/// blocking. Used at the head of operations that may complete synchronously.
pub(crate) fn check_pending() -> Result<()> {
    let record = context::current_record()?;
    match record.take_pending() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Park the current task on `queue` until rescheduled.
pub(crate) fn wait_on(queue: Rc<WaitQueue>, state: State) -> WaitOnQueue {
    WaitOnQueue {
        queue,
        state,
        parked: false,
    }
}

pub(crate) struct WaitOnQueue {
    queue: Rc<WaitQueue>,
    state: State,
    parked: bool,
}

impl Future for WaitOnQueue {
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
                // The kernel dequeued us; the wakeup carried no error.
                return Poll::Ready(Ok(()));
            }
            if let Err(e) = core.park_current_on_queue(&this.queue, this.state) {
                return Poll::Ready(Err(e));
            }
            this.parked = true;
            Poll::Pending
        });
        stepped.unwrap_or_else(|e| Poll::Ready(Err(e)))
    }
}

/// Wait until `fd` is readable.
pub async fn read_wait(fd: RawFd) -> Result<()> {
    IoWait {
        fd,
        interest: Interest::READ,
        parked: false,
    }
    .await
}

/// Wait until `fd` is writable.
pub async fn write_wait(fd: RawFd) -> Result<()> {
    IoWait {
        fd,
        interest: Interest::WRITE,
        parked: false,
    }
    .await
}

struct IoWait {
    fd: RawFd,
    interest: Interest,
    parked: bool,
}

impl Future for IoWait {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let stepped = context::with_core(|core| {
            let Some(record) = core.current() else {
                return Poll::Ready(Err(Error::NoKernel));
            };
            if let Some(err) = record.take_pending() {
                // Eviction already deregistered the selector interest.
                return Poll::Ready(Err(err));
            }
            if this.parked {
                return Poll::Ready(Ok(()));
            }
            if let Err(e) = core.park_current_io(this.fd, this.interest) {
                return Poll::Ready(Err(e));
            }
            this.parked = true;
            Poll::Pending
        });
        stepped.unwrap_or_else(|e| Poll::Ready(Err(e)))
    }
}

/// Retry a nonblocking I/O operation, parking on readiness whenever it
/// reports `WouldBlock`.
pub async fn io_wait<T, F>(fd: RawFd, interest: Interest, mut op: F) -> Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if interest.contains(Interest::WRITE) {
                    write_wait(fd).await?;
                } else {
                    read_wait(fd).await?;
                }
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

/// Move to the back of the ready queue, letting every other ready task run
/// once first.
pub async fn yield_now() -> Result<()> {
    YieldNow { yielded: false }.await
}

struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
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
            if this.yielded {
                return Poll::Ready(Ok(()));
            }
            if let Err(e) = core.yield_current() {
                return Poll::Ready(Err(e));
            }
            this.yielded = true;
            Poll::Pending
        });
        stepped.unwrap_or_else(|e| Poll::Ready(Err(e)))
    }
}
