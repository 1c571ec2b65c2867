use crate::errors::{Error, Result};
use crate::kernel::context;
use crate::kernel::waitq::WaitQueue;
use crate::task::record::State;
use crate::task::TaskId;
use crate::traps;
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

/// A counting semaphore with FIFO hand-off.
///
/// `release` with parked waiters grants the permit to the head of the queue
/// instead of incrementing the counter, so waiters are served in order.
/// [`Semaphore::bounded`] additionally caps the counter at its initial
/// value; releasing above that is an error.
#[derive(Clone)]
pub struct Semaphore {
    inner: Rc<SemInner>,
}

struct SemInner {
    value: Cell<usize>,
    bound: Option<usize>,
    waiting: Rc<WaitQueue>,
    /// Tasks holding an undelivered hand-off.
    granted: RefCell<HashSet<TaskId>>,
}

impl Semaphore {
    pub fn new(value: usize) -> Self {
        Self::build(value, None)
    }

    /// Over-releasing past `value` yields [`Error::SemaphoreOverflow`].
    pub fn bounded(value: usize) -> Self {
        Self::build(value, Some(value))
    }

    fn build(value: usize, bound: Option<usize>) -> Self {
        Self {
            inner: Rc::new(SemInner {
                value: Cell::new(value),
                bound,
                waiting: WaitQueue::new(),
                granted: RefCell::new(HashSet::new()),
            }),
        }
    }

    pub fn value(&self) -> usize {
        self.inner.value.get()
    }

    pub async fn acquire(&self) -> Result<()> {
        traps::check_pending()?;
        let me = context::current_id()?;

        if self.inner.value.get() > 0 {
            self.inner.value.set(self.inner.value.get() - 1);
            return Ok(());
        }

        loop {
            match traps::wait_on(Rc::clone(&self.inner.waiting), State::QueueWait).await {
                Ok(()) => {
                    if self.inner.granted.borrow_mut().remove(&me) {
                        return Ok(());
                    }
                    if self.inner.value.get() > 0 {
                        self.inner.value.set(self.inner.value.get() - 1);
                        return Ok(());
                    }
                }
                Err(e) => {
                    // A permit handed to a task being cancelled is forwarded
                    // rather than lost.
                    if self.inner.granted.borrow_mut().remove(&me) {
                        self.release_permit()?;
                    }
                    return Err(e);
                }
            }
        }
    }

    pub async fn release(&self) -> Result<()> {
        self.release_permit()
    }

    fn release_permit(&self) -> Result<()> {
        context::with_core(|core| {
            if let Some(next) = core.wake_one(&self.inner.waiting) {
                self.inner.granted.borrow_mut().insert(next.id);
                return Ok(());
            }
            if let Some(bound) = self.inner.bound {
                if self.inner.value.get() >= bound {
                    return Err(Error::SemaphoreOverflow);
                }
            }
            self.inner.value.set(self.inner.value.get() + 1);
            Ok(())
        })?
    }
}
