use crate::errors::{Error, Result};
use crate::kernel::context;
use crate::kernel::waitq::WaitQueue;
use crate::task::record::State;
use crate::traps;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

/// A FIFO channel between tasks, optionally bounded.
///
/// `put` parks when a bounded queue is full, `get` parks when it is empty.
/// `task_done`/`join` track outstanding items the way work queues expect:
/// every `put` increments the counter, every `task_done` decrements it, and
/// `join` parks until it returns to zero.
pub struct Queue<T> {
    inner: Rc<QueueInner<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

struct QueueInner<T> {
    maxsize: usize,
    items: RefCell<VecDeque<T>>,
    getters: Rc<WaitQueue>,
    putters: Rc<WaitQueue>,
    join_waiting: Rc<WaitQueue>,
    unfinished: Cell<usize>,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    /// An unbounded queue.
    pub fn new() -> Self {
        Self::with_maxsize(0)
    }

    /// A queue holding at most `maxsize` items (0 = unbounded).
    pub fn with_maxsize(maxsize: usize) -> Self {
        Self {
            inner: Rc::new(QueueInner {
                maxsize,
                items: RefCell::new(VecDeque::new()),
                getters: WaitQueue::new(),
                putters: WaitQueue::new(),
                join_waiting: WaitQueue::new(),
                unfinished: Cell::new(0),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.borrow().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.maxsize > 0 && self.len() >= self.inner.maxsize
    }

    /// Append an item, parking while the queue is full.
    pub async fn put(&self, item: T) -> Result<()> {
        traps::check_pending()?;
        while self.is_full() {
            traps::wait_on(Rc::clone(&self.inner.putters), State::QueueWait).await?;
        }
        self.inner.items.borrow_mut().push_back(item);
        self.inner.unfinished.set(self.inner.unfinished.get() + 1);
        context::with_core(|core| {
            core.wake_one(&self.inner.getters);
        })?;
        Ok(())
    }

    /// Remove the oldest item, parking while the queue is empty.
    pub async fn get(&self) -> Result<T> {
        traps::check_pending()?;
        loop {
            let item = self.inner.items.borrow_mut().pop_front();
            if let Some(item) = item {
                context::with_core(|core| {
                    core.wake_one(&self.inner.putters);
                })?;
                return Ok(item);
            }
            traps::wait_on(Rc::clone(&self.inner.getters), State::QueueWait).await?;
        }
    }

    /// Mark one previously-gotten item as processed.
    pub async fn task_done(&self) -> Result<()> {
        let unfinished = self.inner.unfinished.get();
        if unfinished == 0 {
            return Err(Error::TooManyTaskDone);
        }
        self.inner.unfinished.set(unfinished - 1);
        if unfinished == 1 {
            context::with_core(|core| {
                core.wake_all(&self.inner.join_waiting);
            })?;
        }
        Ok(())
    }

    /// Park until every item ever put has been matched by a `task_done`.
    pub async fn join(&self) -> Result<()> {
        traps::check_pending()?;
        while self.inner.unfinished.get() > 0 {
            traps::wait_on(Rc::clone(&self.inner.join_waiting), State::QueueWait).await?;
        }
        Ok(())
    }
}
