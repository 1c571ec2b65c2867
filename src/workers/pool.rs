use crate::kernel::waitq::WaitQueue;
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

/// Unit of work shipped to a worker thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Anything that can run a [`Job`] off the kernel thread. Implemented by the
/// built-in thread pool; `run_in_executor` accepts user implementations.
pub trait Executor {
    fn submit(&self, job: Job);
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Job>,
    idle: usize,
    total: usize,
    closing: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    work_ready: Condvar,
}

/// Lazily-grown pool of worker threads, capped at `max` workers.
///
/// A cancelled `run_in_thread` leaves its worker "set aside": the thread
/// keeps running the callable to completion, discards the result, and comes
/// back for the next job. Until then it counts against the cap, which is why
/// the cap is generous by default.
pub(crate) struct ThreadPool {
    shared: Arc<PoolShared>,
    max: usize,
}

impl ThreadPool {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState::default()),
                work_ready: Condvar::new(),
            }),
            max,
        }
    }

    pub(crate) fn submit_job(&self, job: Job) {
        let mut state = self.shared.state.lock();
        state.queue.push_back(job);

        if state.idle > 0 {
            drop(state);
            self.shared.work_ready.notify_one();
        } else if state.total < self.max {
            state.total += 1;
            let name = format!("corral-worker-{}", state.total);
            drop(state);
            let shared = Arc::clone(&self.shared);
            // Spawn failure would only surface under extreme resource
            // pressure; the job stays queued for an existing worker.
            let _ = thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(shared));
        }
        // All workers busy and at cap: the job waits in the queue.
    }

    /// Ask idle workers to exit. Workers "set aside" by a cancellation
    /// finish their callable first and then see the flag.
    pub(crate) fn close(&self) {
        self.shared.state.lock().closing = true;
        self.shared.work_ready.notify_all();
    }
}

impl Executor for ThreadPool {
    fn submit(&self, job: Job) {
        self.submit_job(job);
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    break job;
                }
                if state.closing {
                    state.total -= 1;
                    return;
                }
                state.idle += 1;
                shared.work_ready.wait(&mut state);
                state.idle -= 1;
            }
        };
        job();
    }
}

/// Accounting for `run_in_process`: at most `max` children at a time, with
/// overflow submitters parked FIFO on `waiting` until a reaper posts a
/// slot-freed message back through the kernel's wakeup pipe.
pub(crate) struct ProcessPool {
    max: usize,
    active: Cell<usize>,
    waiting: Rc<WaitQueue>,
}

impl ProcessPool {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            max,
            active: Cell::new(0),
            waiting: WaitQueue::new(),
        }
    }

    /// Claim a slot if one is free.
    pub(crate) fn try_acquire(&self) -> bool {
        if self.active.get() < self.max {
            self.active.set(self.active.get() + 1);
            true
        } else {
            false
        }
    }

    pub(crate) fn release_slot(&self) {
        debug_assert!(self.active.get() > 0);
        self.active.set(self.active.get().saturating_sub(1));
    }

    pub(crate) fn waiting(&self) -> &Rc<WaitQueue> {
        &self.waiting
    }

    #[cfg(test)]
    pub(crate) fn active(&self) -> usize {
        self.active.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_pool_runs_jobs_and_reuses_workers() {
        let pool = ThreadPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            pool.submit_job(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) < 8 {
            assert!(std::time::Instant::now() < deadline, "jobs did not finish");
            thread::sleep(Duration::from_millis(5));
        }

        // Never more workers than the cap.
        assert!(pool.shared.state.lock().total <= 2);
        pool.close();
    }

    #[test]
    fn test_process_pool_accounting() {
        let pool = ProcessPool::new(1);
        assert!(pool.try_acquire());
        assert!(!pool.try_acquire());
        pool.release_slot();
        assert!(pool.try_acquire());
        assert_eq!(pool.active(), 1);
    }
}
