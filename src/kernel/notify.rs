use crate::task::TaskId;
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::os::fd::AsRawFd;
use std::os::unix::io::{OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::task::{Wake, Waker};

/// Byte written to the wakeup pipe for "check the injector queue". All
/// other byte values are signal numbers written by the signal handler.
const WAKE_BYTE: u8 = 0;

/// Write end of the wakeup pipe, published for the process-wide signal
/// handler. -1 while no kernel is dispatching signals.
pub(crate) static SIGNAL_PIPE_WR: AtomicI32 = AtomicI32::new(-1);

/// Message posted to the kernel from outside the kernel thread.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RemoteMsg {
    /// A waker fired for the task in `slot` (validated against `id`).
    Wake { slot: usize, id: TaskId },
    /// A worker finished reaping a child process; its pool slot is free.
    ProcessSlotFreed,
}

/// Thread-safe half of the wakeup mechanism: worker threads and foreign
/// wakers push a message here and poke the pipe so the selector tick
/// returns.
pub(crate) struct Injector {
    queue: Mutex<Vec<RemoteMsg>>,
    pipe_wr: OwnedFd,
}

impl Injector {
    pub(crate) fn post(&self, msg: RemoteMsg) {
        self.queue.lock().push(msg);
        // A full pipe already guarantees a pending wakeup; EAGAIN is fine.
        let _ = nix::unistd::write(&self.pipe_wr, &[WAKE_BYTE]);
    }

    pub(crate) fn drain(&self) -> Vec<RemoteMsg> {
        std::mem::take(&mut *self.queue.lock())
    }

    pub(crate) fn write_fd(&self) -> RawFd {
        self.pipe_wr.as_raw_fd()
    }
}

/// Kernel-side owner of the wakeup pipe.
pub(crate) struct Notifier {
    pipe_rd: OwnedFd,
    pub(crate) injector: Arc<Injector>,
}

impl Notifier {
    pub(crate) fn try_new() -> nix::Result<Self> {
        let (pipe_rd, pipe_wr) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        Ok(Self {
            pipe_rd,
            injector: Arc::new(Injector {
                queue: Mutex::new(Vec::new()),
                pipe_wr,
            }),
        })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.pipe_rd.as_raw_fd()
    }

    /// Drain the pipe. Returns the raw signal numbers received since the
    /// last drain; injector messages are fetched separately.
    pub(crate) fn drain_pipe(&self) -> SmallVec<[i32; 8]> {
        let mut signals = SmallVec::new();
        let mut buf = [0u8; 64];
        loop {
            // The pipe is nonblocking; libc::read is used directly because
            // the signal-handler counterpart writes through libc as well.
            let n = unsafe {
                libc::read(
                    self.pipe_rd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
            for &byte in &buf[..n as usize] {
                if byte != WAKE_BYTE {
                    signals.push(byte as i32);
                }
            }
        }
        signals
    }
}

/// The `Waker` handed to task polls. Our own traps never use it (they talk
/// to the kernel directly), but any foreign future that stores it parks the
/// task in `FUTURE_WAIT`; waking routes through the injector and the pipe,
/// so it is safe from any thread.
pub(crate) struct RemoteWaker {
    pub(crate) slot: usize,
    pub(crate) id: TaskId,
    pub(crate) injector: Arc<Injector>,
}

impl Wake for RemoteWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.injector.post(RemoteMsg::Wake {
            slot: self.slot,
            id: self.id,
        });
    }
}

pub(crate) fn waker_for(slot: usize, id: TaskId, injector: Arc<Injector>) -> Waker {
    Waker::from(Arc::new(RemoteWaker { slot, id, injector }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    // Worker threads hold the injector across the pool boundary.
    assert_impl_all!(Injector: Send, Sync);
    assert_impl_all!(RemoteWaker: Send, Sync);

    #[test]
    fn test_post_and_drain_round_trip() -> anyhow::Result<()> {
        let notifier = Notifier::try_new()?;
        let id = TaskId::next();

        notifier.injector.post(RemoteMsg::Wake { slot: 3, id });
        notifier.injector.post(RemoteMsg::ProcessSlotFreed);

        let signals = notifier.drain_pipe();
        assert!(signals.is_empty());

        let msgs = notifier.injector.drain();
        assert_eq!(msgs.len(), 2);
        assert!(matches!(msgs[0], RemoteMsg::Wake { slot: 3, .. }));
        assert!(matches!(msgs[1], RemoteMsg::ProcessSlotFreed));
        Ok(())
    }

    #[test]
    fn test_signal_bytes_come_back_out() -> anyhow::Result<()> {
        let notifier = Notifier::try_new()?;
        let fd = notifier.injector.write_fd();

        // What the signal handler does, minus the handler.
        let byte = [libc::SIGUSR1 as u8];
        let n = unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);

        let signals = notifier.drain_pipe();
        assert_eq!(signals.as_slice(), &[libc::SIGUSR1]);
        Ok(())
    }
}
