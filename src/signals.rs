//! Signal delivery integrated with the event loop.
//!
//! A process-wide handler (installed while any set watches a signal number)
//! writes the number to the kernel's wakeup pipe; the selector tick drains
//! it and appends the signal to every subscribed set, waking one waiter per
//! set. Nothing signal-related runs outside the kernel thread except the
//! one async-signal-safe `write`.

use crate::errors::Result;
use crate::kernel::context;
use crate::kernel::waitq::WaitQueue;
use crate::task::record::State;
use crate::traps;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

pub use nix::sys::signal::Signal;

/// Shared state between a [`SignalSet`] handle and the kernel's dispatch
/// table.
pub(crate) struct SigSetShared {
    pub(crate) signals: Vec<Signal>,
    pub(crate) pending: RefCell<VecDeque<Signal>>,
    pub(crate) waiting: Rc<WaitQueue>,
    pub(crate) watching: Cell<bool>,
}

/// A subscription to a set of signal numbers.
///
/// Received signals queue up in arrival order; `wait` pops them one at a
/// time, parking when none are pending.
pub struct SignalSet {
    shared: Rc<SigSetShared>,
}

impl SignalSet {
    pub fn new(signals: &[Signal]) -> Self {
        Self {
            shared: Rc::new(SigSetShared {
                signals: signals.to_vec(),
                pending: RefCell::new(VecDeque::new()),
                waiting: WaitQueue::new(),
                watching: Cell::new(false),
            }),
        }
    }

    /// Subscribe this set; installs process handlers for any of its numbers
    /// not yet watched.
    pub async fn watch(&self) -> Result<()> {
        context::with_core(|core| core.sigwatch(&self.shared))?
    }

    /// Unsubscribe; restores displaced dispositions for numbers nobody
    /// watches anymore.
    pub async fn unwatch(&self) -> Result<()> {
        context::with_core(|core| core.sigunwatch(&self.shared))?;
        Ok(())
    }

    /// Wait for the next signal in the set. Subscribes first if needed.
    pub async fn wait(&self) -> Result<Signal> {
        traps::check_pending()?;
        if !self.shared.watching.get() {
            self.watch().await?;
        }
        loop {
            let next = self.shared.pending.borrow_mut().pop_front();
            if let Some(signal) = next {
                return Ok(signal);
            }
            traps::wait_on(Rc::clone(&self.shared.waiting), State::SignalWait).await?;
        }
    }

    /// Signals received but not yet consumed by `wait`.
    pub fn pending(&self) -> usize {
        self.shared.pending.borrow().len()
    }

    /// Set every signal in the set to `SIG_IGN` until the returned guard is
    /// dropped.
    pub fn ignore(&self) -> Result<IgnoreGuard> {
        let mut saved = Vec::with_capacity(self.shared.signals.len());
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        for &signal in &self.shared.signals {
            // Safety: installing SIG_IGN, keeping the old action to restore.
            let old = unsafe { sigaction(signal, &ignore) }
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            saved.push((signal, old));
        }
        Ok(IgnoreGuard { saved })
    }
}

impl Drop for SignalSet {
    fn drop(&mut self) {
        if self.shared.watching.get() {
            let _ = context::with_core(|core| core.sigunwatch(&self.shared));
        }
    }
}

/// Restores the dispositions displaced by [`SignalSet::ignore`] on drop.
pub struct IgnoreGuard {
    saved: Vec<(Signal, SigAction)>,
}

impl Drop for IgnoreGuard {
    fn drop(&mut self) {
        for (signal, old) in self.saved.drain(..) {
            // Safety: restoring what we displaced.
            let _ = unsafe { sigaction(signal, &old) };
        }
    }
}
