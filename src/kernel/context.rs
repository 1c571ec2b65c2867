use crate::errors::{Error, Result};
use crate::kernel::core::Core;
use crate::task::record::TaskRecord;
use crate::task::TaskId;
use std::cell::RefCell;
use std::rc::Rc;

// The kernel owns every shared structure; traps reach it through this
// thread-local for the duration of `Kernel::run`. One kernel per thread at a
// time.
thread_local! {
    static KERNEL: RefCell<Option<Rc<Core>>> = const { RefCell::new(None) };
}

/// Install `core` as the running kernel of this thread.
pub(crate) fn install(core: Rc<Core>) -> Result<()> {
    KERNEL.with(|k| {
        let mut slot = k.borrow_mut();
        if slot.is_some() {
            return Err(Error::Other(anyhow::anyhow!(
                "a kernel is already running on this thread"
            )));
        }
        slot.replace(core);
        Ok(())
    })
}

pub(crate) fn uninstall() {
    KERNEL.with(|k| k.borrow_mut().take());
}

/// Run `f` against the current kernel. Fails with [`Error::NoKernel`] when
/// called outside of `Kernel::run`.
pub(crate) fn with_core<F, R>(f: F) -> Result<R>
where
    F: FnOnce(&Rc<Core>) -> R,
{
    KERNEL.with(|k| match &*k.borrow() {
        Some(core) => Ok(f(core)),
        None => Err(Error::NoKernel),
    })
}

/// The record of the task currently being polled.
pub(crate) fn current_record() -> Result<Rc<TaskRecord>> {
    with_core(|c| c.current())?.ok_or(Error::NoKernel)
}

pub(crate) fn current_id() -> Result<TaskId> {
    current_record().map(|r| r.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_kernel_outside_run() {
        assert!(matches!(with_core(|_| ()), Err(Error::NoKernel)));
        assert!(matches!(current_record(), Err(Error::NoKernel)));
    }
}
