use crate::errors::Result;
use crate::workers::{run_in_thread, run_in_thread_with_rollback};
use std::sync::Arc;

/// Route a foreign blocking callable to the thread pool so it can be
/// awaited without blocking the kernel.
pub async fn abide<F, R>(f: F) -> Result<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    run_in_thread(f).await
}

/// A foreign blocking lock that can be adapted into the cooperative world.
///
/// `acquire` must block until held, `release` must make it available again;
/// both are called from worker threads, never from the kernel thread.
pub trait SyncLock: Send + Sync + 'static {
    fn acquire(&self);
    fn release(&self);
}

/// Adapter exposing a [`SyncLock`] to tasks.
///
/// Each `acquire` runs on a fresh backing worker, so a reentrant foreign
/// lock behaves as non-reentrant here; acquiring one you already hold will
/// deadlock the worker, not the kernel.
///
/// If the awaiting task is cancelled while the worker is still blocked in
/// the foreign `acquire`, the task resumes with the cancellation at once
/// and the worker stays behind to finish the acquisition and immediately
/// release it. Without that, the foreign lock would be stranded held.
pub struct AbideLock<L: SyncLock> {
    lock: Arc<L>,
}

impl<L: SyncLock> Clone for AbideLock<L> {
    fn clone(&self) -> Self {
        Self {
            lock: Arc::clone(&self.lock),
        }
    }
}

impl<L: SyncLock> AbideLock<L> {
    pub fn new(lock: L) -> Self {
        Self {
            lock: Arc::new(lock),
        }
    }

    pub fn from_arc(lock: Arc<L>) -> Self {
        Self { lock }
    }

    pub async fn acquire(&self) -> Result<()> {
        let lock = Arc::clone(&self.lock);
        let compensate = {
            let lock = Arc::clone(&self.lock);
            Box::new(move |_: ()| lock.release())
        };
        run_in_thread_with_rollback(move || lock.acquire(), compensate).await
    }

    pub async fn release(&self) -> Result<()> {
        let lock = Arc::clone(&self.lock);
        run_in_thread(move || lock.release()).await
    }
}
