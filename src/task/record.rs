use crate::errors::Error;
use crate::kernel::selector::Interest;
use crate::kernel::timers::TimerKey;
use crate::kernel::waitq::WaitQueue;
use crate::task::TaskId;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;

/// Scheduling state of a task. A task is in exactly one of these at any
/// moment; the blocking states each correspond to one wait structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Ready,
    Running,
    ReadWait,
    WriteWait,
    FutureWait,
    TimeSleep,
    QueueWait,
    JoinWait,
    SignalWait,
    Terminated,
}

impl State {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            State::Ready => "READY",
            State::Running => "RUNNING",
            State::ReadWait => "READ_WAIT",
            State::WriteWait => "WRITE_WAIT",
            State::FutureWait => "FUTURE_WAIT",
            State::TimeSleep => "TIME_SLEEP",
            State::QueueWait => "QUEUE_WAIT",
            State::JoinWait => "JOIN_WAIT",
            State::SignalWait => "SIGNAL_WAIT",
            State::Terminated => "TERMINATED",
        }
    }

    /// True for every state in which the task is linked into a wait
    /// structure (or, for `FutureWait`, holds out a waker).
    pub(crate) fn is_blocked(&self) -> bool {
        !matches!(self, State::Ready | State::Running | State::Terminated)
    }
}

/// Back-pointer from a parked task into the one wait structure holding it.
///
/// This is the eviction half of the suspension protocol: cancelling a
/// blocked task takes this link and undoes exactly the registration that the
/// park transition made. Park and link-set happen in the same kernel call,
/// as do dequeue and link-clear, so a cancel racing a natural wakeup can
/// never double-remove.
pub(crate) enum WaitLink {
    /// Parked on fd readiness; eviction deregisters selector interest.
    Io { fd: RawFd, interest: Interest },
    /// Parked on the timer heap; eviction clears the record's sleep key,
    /// tombstoning the heap entry.
    Timer,
    /// Parked on a wait queue (sync primitive, joiners, signal set);
    /// eviction splices the task out of the queue.
    Queue(Rc<WaitQueue>),
}

impl fmt::Debug for WaitLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitLink::Io { fd, interest } => {
                f.debug_struct("Io").field("fd", fd).field("interest", interest).finish()
            }
            WaitLink::Timer => f.write_str("Timer"),
            WaitLink::Queue(q) => f.debug_tuple("Queue").field(&q.len()).finish(),
        }
    }
}

/// Per-coroutine bookkeeping, mutated by the scheduler only. Observers
/// (joiners, handles) read the `Cell` fields freely: there is a single
/// kernel thread and no preemption.
pub(crate) struct TaskRecord {
    pub(crate) id: TaskId,
    /// Key into the kernel's task slab.
    pub(crate) slot: Cell<usize>,
    pub(crate) daemon: bool,

    state: Cell<State>,
    cycles: Cell<u64>,

    /// Set at any time; causes `Error::Cancelled` to be delivered at the
    /// next trap, and re-delivered on every trap after that until the task
    /// terminates.
    cancel_pending: Cell<bool>,
    /// Error waiting to be injected at the next resume (timeout expiry, or
    /// the cancellation put in place when the task was evicted).
    pending_error: RefCell<Option<Error>>,

    /// The single wait-structure link (invariant: at most one).
    waiting: RefCell<Option<WaitLink>>,
    /// Live sleep entry in the timer heap, if any.
    sleep: Cell<Option<TimerKey>>,
    /// Current timeout deadline, if any. Heap entries whose key no longer
    /// matches this are stale and discarded when they surface.
    timeout: Cell<Option<TimerKey>>,

    /// Latch for a waker fired while the task is being polled.
    notified: Cell<bool>,

    pub(crate) terminated: Cell<bool>,
    pub(crate) cancelled: Cell<bool>,
    /// Error outcome, set exactly once at termination (None = clean return).
    outcome: RefCell<Option<Arc<Error>>>,

    /// Tasks parked waiting for this task to terminate.
    pub(crate) joiners: Rc<WaitQueue>,
}

impl TaskRecord {
    pub(crate) fn new(daemon: bool) -> Rc<Self> {
        Rc::new(Self {
            id: TaskId::next(),
            slot: Cell::new(usize::MAX),
            daemon,
            state: Cell::new(State::Ready),
            cycles: Cell::new(0),
            cancel_pending: Cell::new(false),
            pending_error: RefCell::new(None),
            waiting: RefCell::new(None),
            sleep: Cell::new(None),
            timeout: Cell::new(None),
            notified: Cell::new(false),
            terminated: Cell::new(false),
            cancelled: Cell::new(false),
            outcome: RefCell::new(None),
            joiners: WaitQueue::new(),
        })
    }

    pub(crate) fn state(&self) -> State {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.set(state);
    }

    pub(crate) fn cycles(&self) -> u64 {
        self.cycles.get()
    }

    pub(crate) fn bump_cycles(&self) {
        self.cycles.set(self.cycles.get() + 1);
    }

    pub(crate) fn set_cancel_pending(&self) {
        self.cancel_pending.set(true);
    }

    pub(crate) fn set_pending_error(&self, err: Error) {
        self.pending_error.borrow_mut().replace(err);
    }

    /// Take whatever error is due for injection at this resume.
    ///
    /// A pending cancellation takes precedence over a pending timeout, and
    /// stays armed: a task that catches the error and blocks again is
    /// re-cancelled at its next trap.
    pub(crate) fn take_pending(&self) -> Option<Error> {
        if self.cancel_pending.get() {
            self.pending_error.borrow_mut().take();
            return Some(Error::Cancelled);
        }
        self.pending_error.borrow_mut().take()
    }

    /// Discard a delivered-but-unconsumed timeout, e.g. when its
    /// `timeout_after` scope completes before the task reaches a trap.
    pub(crate) fn clear_pending_timeout(&self) {
        let mut pending = self.pending_error.borrow_mut();
        if matches!(pending.as_ref(), Some(Error::Timeout)) {
            pending.take();
        }
    }

    pub(crate) fn set_waiting(&self, link: WaitLink) {
        debug_assert!(self.waiting.borrow().is_none());
        self.waiting.borrow_mut().replace(link);
    }

    pub(crate) fn take_waiting(&self) -> Option<WaitLink> {
        self.waiting.borrow_mut().take()
    }

    pub(crate) fn sleep_key(&self) -> Option<TimerKey> {
        self.sleep.get()
    }

    pub(crate) fn set_sleep_key(&self, key: Option<TimerKey>) {
        self.sleep.set(key);
    }

    pub(crate) fn timeout_key(&self) -> Option<TimerKey> {
        self.timeout.get()
    }

    pub(crate) fn set_timeout_key(&self, key: Option<TimerKey>) {
        self.timeout.set(key);
    }

    pub(crate) fn set_notified(&self) {
        self.notified.set(true);
    }

    pub(crate) fn take_notified(&self) -> bool {
        self.notified.replace(false)
    }

    pub(crate) fn set_outcome(&self, err: Arc<Error>) {
        self.outcome.borrow_mut().get_or_insert(err);
    }

    pub(crate) fn outcome(&self) -> Option<Arc<Error>> {
        self.outcome.borrow().clone()
    }
}

impl fmt::Debug for TaskRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRecord")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("cycles", &self.cycles.get())
            .field("daemon", &self.daemon)
            .field("terminated", &self.terminated.get())
            .field("cancelled", &self.cancelled.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_takes_precedence_over_timeout() {
        let record = TaskRecord::new(false);
        record.set_pending_error(Error::Timeout);
        record.set_cancel_pending();

        assert!(matches!(record.take_pending(), Some(Error::Cancelled)));
        // The timeout was discarded, cancellation stays armed.
        assert!(matches!(record.take_pending(), Some(Error::Cancelled)));
    }

    #[test]
    fn test_pending_timeout_is_cleared_once(){
        let record = TaskRecord::new(false);
        record.set_pending_error(Error::Timeout);
        record.clear_pending_timeout();
        assert!(record.take_pending().is_none());
    }

    #[test]
    fn test_blocked_states() {
        assert!(State::ReadWait.is_blocked());
        assert!(State::TimeSleep.is_blocked());
        assert!(!State::Ready.is_blocked());
        assert!(!State::Terminated.is_blocked());
    }
}
