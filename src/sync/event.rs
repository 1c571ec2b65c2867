use crate::errors::Result;
use crate::kernel::context;
use crate::kernel::waitq::WaitQueue;
use crate::task::record::State;
use crate::traps;
use std::cell::Cell;
use std::rc::Rc;

/// A one-to-many flag: `set` wakes every waiter, `clear` re-arms.
#[derive(Clone, Default)]
pub struct Event {
    inner: Rc<EventInner>,
}

#[derive(Default)]
struct EventInner {
    set: Cell<bool>,
    waiting: Rc<WaitQueue>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.inner.set.get()
    }

    /// Re-arm the event. Purely synchronous; waiters that were already
    /// woken by a previous `set` stay woken.
    pub fn clear(&self) {
        self.inner.set.set(false);
    }

    /// Wait until the event is set. Returns immediately if it already is.
    pub async fn wait(&self) -> Result<()> {
        traps::check_pending()?;
        loop {
            if self.inner.set.get() {
                return Ok(());
            }
            traps::wait_on(Rc::clone(&self.inner.waiting), State::QueueWait).await?;
        }
    }

    /// Set the event and wake all current waiters.
    pub async fn set(&self) -> Result<()> {
        self.inner.set.set(true);
        context::with_core(|core| {
            core.wake_all(&self.inner.waiting);
        })?;
        Ok(())
    }
}
