use crate::errors::{Error, Result};
use crate::kernel::notify::{Notifier, RemoteMsg, SIGNAL_PIPE_WR};
use crate::kernel::selector::{Interest, Selector};
use crate::kernel::timers::{TimerHeap, TimerKey, TimerKind};
use crate::kernel::waitq::WaitQueue;
use crate::kernel::KernelConfig;
use crate::signals::SigSetShared;
use crate::task::handle::Task;
use crate::task::record::{State, TaskRecord, WaitLink};
use crate::workers::pool::{ProcessPool, ThreadPool};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

type LocalFuture = Pin<Box<dyn Future<Output = ()>>>;

struct TaskEntry {
    record: Rc<TaskRecord>,
    /// Taken out of the slab while the task is being polled.
    future: Option<LocalFuture>,
}

/// All kernel state. Every field has interior mutability so trap futures can
/// reach back in through the thread-local context while a task is being
/// polled; no borrow is ever held across a poll.
pub(crate) struct Core {
    pub(crate) config: KernelConfig,

    tasks: RefCell<Slab<TaskEntry>>,
    ready: RefCell<VecDeque<Rc<TaskRecord>>>,
    timers: RefCell<TimerHeap>,
    selector: RefCell<Selector>,
    notifier: Notifier,

    current: RefCell<Option<Rc<TaskRecord>>>,
    non_daemon: Cell<usize>,

    /// signo -> subscribed signal sets; a handler is installed while the
    /// list is non-empty and the displaced disposition is kept for restore.
    signal_subs: RefCell<HashMap<i32, Vec<Weak<SigSetShared>>>>,
    saved_actions: RefCell<HashMap<i32, SigAction>>,

    thread_pool: ThreadPool,
    process_pool: ProcessPool,
}

impl Core {
    pub(crate) fn try_new(config: KernelConfig) -> Result<Self> {
        let mut selector = Selector::try_new()?;
        let notifier = Notifier::try_new()
            .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))?;
        selector.register_notify(notifier.read_fd())?;

        Ok(Self {
            thread_pool: ThreadPool::new(config.max_worker_threads),
            process_pool: ProcessPool::new(config.max_worker_processes),
            config,
            tasks: RefCell::new(Slab::new()),
            ready: RefCell::new(VecDeque::new()),
            timers: RefCell::new(TimerHeap::new()),
            selector: RefCell::new(selector),
            notifier,
            current: RefCell::new(None),
            non_daemon: Cell::new(0),
            signal_subs: RefCell::new(HashMap::new()),
            saved_actions: RefCell::new(HashMap::new()),
        })
    }

    // --- Task creation & lookup -------------------------------------------

    pub(crate) fn spawn_task<F, T>(self: &Rc<Self>, fut: F, daemon: bool) -> Task<T>
    where
        F: Future<Output = Result<T>> + 'static,
        T: 'static,
    {
        let record = TaskRecord::new(daemon);
        let value = Rc::new(RefCell::new(None));

        let slot = self.tasks.borrow_mut().insert(TaskEntry {
            record: record.clone(),
            future: None,
        });
        record.slot.set(slot);

        // The wrapper erases T: a clean return lands in the typed value
        // slot, a failure lands in the record for joiners to classify.
        let wrapper = {
            let record = record.clone();
            let value = Rc::clone(&value);
            async move {
                match fut.await {
                    Ok(v) => {
                        value.borrow_mut().replace(v);
                    }
                    Err(e) => record.set_outcome(Arc::new(e)),
                }
            }
        };
        self.tasks.borrow_mut()[slot].future = Some(Box::pin(wrapper));

        if !daemon {
            self.non_daemon.set(self.non_daemon.get() + 1);
        }
        log::trace!("spawned task {} (daemon={})", record.id, daemon);
        self.make_ready(&record, None);

        Task::new(record, value)
    }

    pub(crate) fn current(&self) -> Option<Rc<TaskRecord>> {
        self.current.borrow().clone()
    }

    // --- Ready queue & transitions ----------------------------------------

    /// Put a task on the ready queue, optionally arming an error to inject
    /// at its resume. Idempotent for tasks already queued or terminated.
    pub(crate) fn make_ready(&self, record: &Rc<TaskRecord>, err: Option<Error>) {
        if record.state() == State::Terminated {
            return;
        }
        if let Some(e) = err {
            record.set_pending_error(e);
        }
        if record.state() == State::Ready {
            return;
        }
        record.set_state(State::Ready);
        self.ready.borrow_mut().push_back(record.clone());
    }

    /// `sleep(0)`: back of the ready queue, giving every other ready task a
    /// turn first.
    pub(crate) fn yield_current(&self) -> Result<()> {
        let record = self.current().ok_or(Error::NoKernel)?;
        record.set_state(State::Ready);
        self.ready.borrow_mut().push_back(record);
        Ok(())
    }

    pub(crate) fn park_current_on_queue(&self, q: &Rc<WaitQueue>, state: State) -> Result<()> {
        let record = self.current().ok_or(Error::NoKernel)?;
        record.set_state(state);
        record.set_waiting(WaitLink::Queue(Rc::clone(q)));
        q.push_back(record);
        Ok(())
    }

    pub(crate) fn park_current_io(&self, fd: RawFd, interest: Interest) -> Result<()> {
        let record = self.current().ok_or(Error::NoKernel)?;
        self.selector
            .borrow_mut()
            .register_waiter(fd, interest, record.clone())?;
        record.set_state(if interest == Interest::READ {
            State::ReadWait
        } else {
            State::WriteWait
        });
        record.set_waiting(WaitLink::Io { fd, interest });
        Ok(())
    }

    pub(crate) fn park_current_timer(&self, deadline: Instant) -> Result<()> {
        let record = self.current().ok_or(Error::NoKernel)?;
        let key = self
            .timers
            .borrow_mut()
            .push(deadline, record.clone(), TimerKind::Sleep);
        record.set_sleep_key(Some(key));
        record.set_state(State::TimeSleep);
        record.set_waiting(WaitLink::Timer);
        Ok(())
    }

    /// Park with no kernel-side wait structure: the task handed its waker to
    /// a foreign future or a worker completion.
    pub(crate) fn park_current_future(&self) -> Result<()> {
        let record = self.current().ok_or(Error::NoKernel)?;
        record.set_state(State::FutureWait);
        Ok(())
    }

    /// The single eviction path: undo whatever registration parked the task
    /// and reschedule it, optionally with an error injection. This is the
    /// `cancel_func` of every wait kind.
    pub(crate) fn unpark(&self, record: &Rc<TaskRecord>, err: Option<Error>) {
        match record.take_waiting() {
            Some(WaitLink::Io { fd, interest }) => {
                self.selector.borrow_mut().remove_waiter(fd, interest);
            }
            Some(WaitLink::Timer) => record.set_sleep_key(None),
            Some(WaitLink::Queue(q)) => {
                q.remove(record.id);
            }
            None => {}
        }
        self.make_ready(record, err);
    }

    // --- Wait queue service -----------------------------------------------

    pub(crate) fn wake_one(&self, q: &WaitQueue) -> Option<Rc<TaskRecord>> {
        let record = q.pop_front()?;
        record.take_waiting();
        self.make_ready(&record, None);
        Some(record)
    }

    /// Wake up to `n` tasks in FIFO order; returns how many were woken.
    pub(crate) fn wake_n(&self, q: &WaitQueue, n: usize) -> usize {
        let mut woken = 0;
        while woken < n && self.wake_one(q).is_some() {
            woken += 1;
        }
        woken
    }

    pub(crate) fn wake_all(&self, q: &WaitQueue) -> usize {
        self.wake_n(q, usize::MAX)
    }

    /// Migrate up to `n` parked tasks from one queue to another without
    /// waking them (condition-variable notify).
    pub(crate) fn move_waiters(
        &self,
        from: &WaitQueue,
        to: &Rc<WaitQueue>,
        n: usize,
        state: State,
    ) -> usize {
        let mut moved = 0;
        while moved < n {
            let Some(record) = from.pop_front() else { break };
            record.take_waiting();
            record.set_waiting(WaitLink::Queue(Rc::clone(to)));
            record.set_state(state);
            to.push_back(record);
            moved += 1;
        }
        moved
    }

    // --- Cancellation & timeouts ------------------------------------------

    /// Request cancellation of `target`. Returns false if it already
    /// terminated. A blocked target is evicted immediately; a ready or
    /// running target gets the error at its next trap.
    pub(crate) fn cancel(&self, target: &Rc<TaskRecord>) -> bool {
        if target.terminated.get() {
            return false;
        }
        target.set_cancel_pending();
        if target.state().is_blocked() {
            self.unpark(target, Some(Error::Cancelled));
        }
        true
    }

    /// Install a timeout deadline for the current task; returns the
    /// previous deadline key for restore.
    pub(crate) fn set_timeout(&self, deadline: Instant) -> Result<Option<TimerKey>> {
        let record = self.current().ok_or(Error::NoKernel)?;
        let key = self
            .timers
            .borrow_mut()
            .push(deadline, record.clone(), TimerKind::Timeout);
        let prev = record.timeout_key();
        record.set_timeout_key(Some(key));
        Ok(prev)
    }

    /// Restore the previous deadline. The replaced heap entry is left to
    /// tombstone out. If the restored deadline already passed while it was
    /// masked, the timeout is delivered here.
    pub(crate) fn unset_timeout(&self, prev: Option<TimerKey>) -> Result<()> {
        let record = self.current().ok_or(Error::NoKernel)?;
        record.set_timeout_key(prev);
        record.clear_pending_timeout();
        if let Some((deadline, _)) = prev {
            if deadline <= Instant::now() {
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }

    /// Restore without expiry delivery; used when a timeout scope is
    /// dropped mid-flight instead of polled to completion.
    pub(crate) fn restore_timeout(&self, prev: Option<TimerKey>) {
        if let Some(record) = self.current() {
            record.set_timeout_key(prev);
            record.clear_pending_timeout();
        }
    }

    // --- Signals ----------------------------------------------------------

    pub(crate) fn sigwatch(&self, shared: &Rc<SigSetShared>) -> Result<()> {
        for &signal in &shared.signals {
            let signo = signal as i32;
            let mut subs = self.signal_subs.borrow_mut();
            let list = subs.entry(signo).or_default();
            if list.is_empty() {
                self.install_handler(signal)?;
            }
            if !list.iter().any(|w| w.ptr_eq(&Rc::downgrade(shared))) {
                list.push(Rc::downgrade(shared));
            }
        }
        shared.watching.set(true);
        Ok(())
    }

    pub(crate) fn sigunwatch(&self, shared: &Rc<SigSetShared>) {
        for &signal in &shared.signals {
            let signo = signal as i32;
            let mut subs = self.signal_subs.borrow_mut();
            if let Some(list) = subs.get_mut(&signo) {
                list.retain(|w| !w.ptr_eq(&Rc::downgrade(shared)) && w.strong_count() > 0);
                if list.is_empty() {
                    subs.remove(&signo);
                    self.restore_handler(signo);
                }
            }
        }
        shared.watching.set(false);
    }

    fn install_handler(&self, signal: Signal) -> Result<()> {
        SIGNAL_PIPE_WR.store(self.notifier.injector.write_fd(), Ordering::Relaxed);
        let action = SigAction::new(
            SigHandler::Handler(signal_trampoline),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // Safety: the trampoline only does an async-signal-safe write to
        // the wakeup pipe.
        let old = unsafe { sigaction(signal, &action) }
            .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))?;
        self.saved_actions.borrow_mut().insert(signal as i32, old);
        Ok(())
    }

    fn restore_handler(&self, signo: i32) {
        if let Some(old) = self.saved_actions.borrow_mut().remove(&signo) {
            if let Ok(signal) = Signal::try_from(signo) {
                // Safety: restoring the disposition we displaced.
                let _ = unsafe { sigaction(signal, &old) };
            }
        }
    }

    /// A signal arrived through the wakeup pipe: append it to every
    /// subscribed set and wake one waiter per set.
    fn dispatch_signal(&self, signo: i32) {
        let Ok(signal) = Signal::try_from(signo) else {
            return;
        };
        let subs: Vec<Rc<SigSetShared>> = {
            let mut map = self.signal_subs.borrow_mut();
            let Some(list) = map.get_mut(&signo) else {
                return;
            };
            list.retain(|w| w.strong_count() > 0);
            list.iter().filter_map(|w| w.upgrade()).collect()
        };
        for set in subs {
            set.pending.borrow_mut().push_back(signal);
            self.wake_one(&set.waiting);
        }
    }

    // --- Worker bridge ----------------------------------------------------

    pub(crate) fn thread_pool(&self) -> &ThreadPool {
        &self.thread_pool
    }

    pub(crate) fn process_pool(&self) -> &ProcessPool {
        &self.process_pool
    }

    /// Build a thread-safe waker for a task, for worker completions and
    /// foreign futures.
    pub(crate) fn remote_waker(&self, record: &TaskRecord) -> Waker {
        crate::kernel::notify::waker_for(
            record.slot.get(),
            record.id,
            Arc::clone(&self.notifier.injector),
        )
    }

    pub(crate) fn injector(&self) -> Arc<crate::kernel::notify::Injector> {
        Arc::clone(&self.notifier.injector)
    }

    // --- The run loop -----------------------------------------------------

    /// Run until every non-daemon task has terminated (I5).
    pub(crate) fn run_loop(self: &Rc<Self>) -> Result<()> {
        while self.non_daemon.get() > 0 {
            self.tick()?;
        }
        Ok(())
    }

    /// Run until the task table is empty; shutdown path.
    pub(crate) fn run_until_empty(self: &Rc<Self>) -> Result<()> {
        while !self.tasks.borrow().is_empty() {
            self.tick()?;
        }
        Ok(())
    }

    fn tick(self: &Rc<Self>) -> Result<()> {
        // Ready work pending: poll the selector without blocking. Otherwise
        // block until the earliest deadline (or an event, whichever first).
        let timeout = if self.ready.borrow().is_empty() {
            self.timers
                .borrow()
                .next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()))
        } else {
            Some(Duration::ZERO)
        };

        let events = self.selector.borrow_mut().wait(timeout)?;
        for (fd, readiness) in events {
            let is_notify = self.selector.borrow().is_notify(fd);
            if is_notify {
                self.drain_notifications();
            } else {
                self.wake_io(fd, readiness);
            }
        }

        self.fire_timers(Instant::now());

        // Drain ready tasks in FIFO order. Tasks readied while draining
        // (spawns, yields) run within the same batch.
        loop {
            let next = self.ready.borrow_mut().pop_front();
            match next {
                Some(record) => self.run_task(record),
                None => break,
            }
        }
        Ok(())
    }

    fn wake_io(&self, fd: RawFd, readiness: Interest) {
        for interest in [Interest::READ, Interest::WRITE] {
            if !readiness.contains(interest) {
                continue;
            }
            let woken = self.selector.borrow_mut().remove_waiter(fd, interest);
            if let Some(record) = woken {
                record.take_waiting();
                self.make_ready(&record, None);
            }
        }
    }

    fn fire_timers(&self, now: Instant) {
        let mut still_armed = Vec::new();
        loop {
            let entry = self.timers.borrow_mut().pop_due(now);
            let Some(entry) = entry else { break };
            let record = entry.record.clone();

            match entry.kind {
                TimerKind::Sleep => {
                    // Stale unless the record still owns this exact entry.
                    if record.sleep_key() == Some(entry.key())
                        && record.state() == State::TimeSleep
                    {
                        record.set_sleep_key(None);
                        record.take_waiting();
                        self.make_ready(&record, None);
                    }
                }
                TimerKind::Timeout => {
                    if record.timeout_key() == Some(entry.key()) && !record.terminated.get() {
                        if record.state().is_blocked() {
                            self.unpark(&record, Some(Error::Timeout));
                        } else {
                            // The task was already rescheduled for another
                            // reason (an I/O wakeup earlier this tick, say):
                            // that resume keeps its result and this fire is
                            // discarded. The entry goes back in case the
                            // scope blocks again before restoring.
                            still_armed.push(entry);
                        }
                    }
                }
            }
        }
        // Outside the pop loop, or a past-deadline entry would cycle
        // forever within one tick.
        let mut timers = self.timers.borrow_mut();
        for entry in still_armed {
            timers.reinsert(entry);
        }
    }

    fn drain_notifications(&self) {
        for signo in self.notifier.drain_pipe() {
            self.dispatch_signal(signo);
        }
        for msg in self.notifier.injector.drain() {
            match msg {
                RemoteMsg::Wake { slot, id } => {
                    let record = self
                        .tasks
                        .borrow()
                        .get(slot)
                        .filter(|e| e.record.id == id)
                        .map(|e| e.record.clone());
                    let Some(record) = record else { continue };
                    match record.state() {
                        State::FutureWait => self.make_ready(&record, None),
                        State::Running => record.set_notified(),
                        // A stale waker must not disturb a task parked on a
                        // kernel structure.
                        _ => {}
                    }
                }
                RemoteMsg::ProcessSlotFreed => {
                    self.process_pool.release_slot();
                    self.wake_one(self.process_pool.waiting());
                }
            }
        }
    }

    fn run_task(self: &Rc<Self>, record: Rc<TaskRecord>) {
        // Stale queue entries are skipped; I1 holds for live ones.
        if record.state() != State::Ready {
            return;
        }
        record.set_state(State::Running);
        record.bump_cycles();
        // Discard wakes latched before this poll; only a wake arriving
        // *during* the poll may re-ready the task afterwards.
        record.take_notified();

        let slot = record.slot.get();
        let future = self
            .tasks
            .borrow_mut()
            .get_mut(slot)
            .and_then(|e| e.future.take());
        let Some(mut future) = future else { return };

        self.current.borrow_mut().replace(record.clone());
        let waker = self.remote_waker(&record);
        let mut cx = Context::from_waker(&waker);

        let poll = catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));
        self.current.borrow_mut().take();

        match poll {
            Ok(Poll::Pending) => {
                if let Some(entry) = self.tasks.borrow_mut().get_mut(slot) {
                    entry.future = Some(future);
                }
                // Pending without a kernel park: the task is waiting on a
                // foreign future holding our waker.
                if record.state() == State::Running {
                    record.set_state(State::FutureWait);
                }
                if record.take_notified() {
                    self.make_ready(&record, None);
                }
            }
            Ok(Poll::Ready(())) => {
                drop(future);
                self.finalize(&record);
            }
            Err(payload) => {
                drop(future);
                record.set_outcome(Arc::new(Error::Panicked(panic_message(payload))));
                self.finalize(&record);
            }
        }
    }

    fn finalize(&self, record: &Rc<TaskRecord>) {
        record.set_state(State::Terminated);
        record.terminated.set(true);
        record.set_sleep_key(None);
        record.set_timeout_key(None);

        if let Some(err) = record.outcome() {
            if err.is_cancellation() {
                record.cancelled.set(true);
            } else if self.config.log_errors {
                log::error!("task {} crashed: {:#}", record.id, err);
            }
        }

        // Terminal state is visible before any joiner runs.
        self.wake_all(&record.joiners);

        self.tasks.borrow_mut().try_remove(record.slot.get());
        if !record.daemon {
            self.non_daemon.set(self.non_daemon.get() - 1);
        }
        log::trace!(
            "task {} terminated (cancelled={})",
            record.id,
            record.cancelled.get()
        );
    }

    // --- Shutdown ---------------------------------------------------------

    pub(crate) fn cancel_all(&self) {
        let records: Vec<Rc<TaskRecord>> = self
            .tasks
            .borrow()
            .iter()
            .map(|(_, e)| e.record.clone())
            .collect();
        for record in records {
            self.cancel(&record);
        }
    }

    pub(crate) fn release_resources(&self) {
        let signos: Vec<i32> = self.saved_actions.borrow().keys().copied().collect();
        for signo in signos {
            self.restore_handler(signo);
        }
        self.signal_subs.borrow_mut().clear();
        SIGNAL_PIPE_WR.store(-1, Ordering::Relaxed);
        self.thread_pool.close();
    }

    // --- Introspection (tests, monitor collaborators) ---------------------

    pub(crate) fn registered_fds(&self) -> usize {
        self.selector.borrow().registered_fds()
    }

    #[cfg(test)]
    pub(crate) fn live_tasks(&self) -> usize {
        self.tasks.borrow().len()
    }
}

extern "C" fn signal_trampoline(signo: libc::c_int) {
    let fd = SIGNAL_PIPE_WR.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signo as u8;
        // Async-signal-safe: a single write syscall, errors ignored.
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}
