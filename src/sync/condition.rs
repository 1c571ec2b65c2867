use crate::errors::{Error, Result};
use crate::kernel::context;
use crate::kernel::waitq::WaitQueue;
use crate::sync::Lock;
use crate::task::record::State;
use crate::traps;
use std::rc::Rc;

/// A condition variable composed with a [`Lock`].
///
/// `notify` does not wake anyone directly: it migrates waiters from the
/// condition queue into the lock's waiter queue, so each one re-acquires
/// the lock (in FIFO order) before it runs again.
#[derive(Clone, Default)]
pub struct Condition {
    lock: Lock,
    waiting: Rc<WaitQueue>,
}

impl Condition {
    /// A condition with its own fresh lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// A condition sharing an existing lock (several conditions can guard
    /// one protected region).
    pub fn with_lock(lock: Lock) -> Self {
        Self {
            lock,
            waiting: WaitQueue::new(),
        }
    }

    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    pub async fn acquire(&self) -> Result<()> {
        self.lock.acquire().await
    }

    pub async fn release(&self) -> Result<()> {
        self.lock.release().await
    }

    /// Release the lock, park until notified, return holding the lock
    /// again.
    ///
    /// On cancellation the error is returned *without* the lock held.
    pub async fn wait(&self) -> Result<()> {
        let me = context::current_id()?;
        if !self.lock.held_by(me) {
            return Err(Error::NotHeld);
        }
        self.lock.pass_on()?;

        match traps::wait_on(Rc::clone(&self.waiting), State::QueueWait).await {
            Ok(()) => {
                if self.lock.held_by(me) {
                    // Normal path: notify moved us into the lock queue and
                    // release handed the lock over.
                    Ok(())
                } else {
                    self.lock.acquire().await
                }
            }
            Err(e) => {
                if self.lock.held_by(me) {
                    self.lock.pass_on()?;
                }
                Err(e)
            }
        }
    }

    /// Re-check `pred` each time the condition is signalled; returns once
    /// it is true. The lock must be held.
    pub async fn wait_for<P>(&self, mut pred: P) -> Result<()>
    where
        P: FnMut() -> bool,
    {
        while !pred() {
            self.wait().await?;
        }
        Ok(())
    }

    /// Move up to `n` waiters into the lock's waiter queue. The lock must
    /// be held.
    pub async fn notify(&self, n: usize) -> Result<()> {
        let me = context::current_id()?;
        if !self.lock.held_by(me) {
            return Err(Error::NotHeld);
        }
        context::with_core(|core| {
            core.move_waiters(&self.waiting, &self.lock.waiter_queue(), n, State::QueueWait);
        })?;
        Ok(())
    }

    pub async fn notify_all(&self) -> Result<()> {
        self.notify(usize::MAX).await
    }
}
