use crate::errors::{Error, Result};
use crate::kernel::context;
use crate::kernel::waitq::WaitQueue;
use crate::task::record::State;
use crate::task::TaskId;
use crate::traps;
use std::cell::Cell;
use std::rc::Rc;

/// A fair mutual-exclusion lock.
///
/// `release` with parked waiters hands the lock to the head of the queue
/// directly, without ever clearing the held flag, so a task that barges in
/// between release and the waiter's resume cannot steal it. Acquisition
/// order is therefore strictly FIFO.
#[derive(Clone, Default)]
pub struct Lock {
    inner: Rc<LockInner>,
}

#[derive(Default)]
struct LockInner {
    locked: Cell<bool>,
    owner: Cell<Option<TaskId>>,
    waiting: Rc<WaitQueue>,
}

impl Lock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn locked(&self) -> bool {
        self.inner.locked.get()
    }

    pub async fn acquire(&self) -> Result<()> {
        traps::check_pending()?;
        let me = context::current_id()?;

        if !self.inner.locked.get() {
            self.inner.locked.set(true);
            self.inner.owner.set(Some(me));
            return Ok(());
        }

        loop {
            match traps::wait_on(Rc::clone(&self.inner.waiting), State::QueueWait).await {
                Ok(()) => {
                    if self.inner.owner.get() == Some(me) {
                        // Ownership was handed to us by release.
                        return Ok(());
                    }
                    if !self.inner.locked.get() {
                        self.inner.locked.set(true);
                        self.inner.owner.set(Some(me));
                        return Ok(());
                    }
                }
                Err(e) => {
                    // Cancelled after the lock was already handed to us:
                    // pass it along so it is not stranded.
                    if self.inner.owner.get() == Some(me) {
                        self.pass_on()?;
                    }
                    return Err(e);
                }
            }
        }
    }

    pub async fn release(&self) -> Result<()> {
        let me = context::current_id()?;
        if !self.inner.locked.get() || self.inner.owner.get() != Some(me) {
            return Err(Error::NotHeld);
        }
        self.pass_on()
    }

    /// Hand the lock to the longest waiter, or unlock if nobody waits.
    pub(crate) fn pass_on(&self) -> Result<()> {
        context::with_core(|core| match core.wake_one(&self.inner.waiting) {
            Some(next) => self.inner.owner.set(Some(next.id)),
            None => {
                self.inner.locked.set(false);
                self.inner.owner.set(None);
            }
        })
    }

    pub(crate) fn held_by(&self, id: TaskId) -> bool {
        self.inner.locked.get() && self.inner.owner.get() == Some(id)
    }

    pub(crate) fn waiter_queue(&self) -> Rc<WaitQueue> {
        Rc::clone(&self.inner.waiting)
    }
}
