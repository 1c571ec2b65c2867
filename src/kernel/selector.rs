use crate::errors::{Error, Result};
use crate::task::record::TaskRecord;
use bitflags::bitflags;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

bitflags! {
    /// Readiness directions a task can wait on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Interest: u8 {
        const READ = 1;
        const WRITE = 2;
    }
}

impl Interest {
    fn epoll_flags(self) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if self.contains(Interest::READ) {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.contains(Interest::WRITE) {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }
}

/// Kernel-side view of one registered descriptor.
struct FdEntry {
    reader: Option<Rc<TaskRecord>>,
    writer: Option<Rc<TaskRecord>>,
    /// Mask currently installed in the OS selector.
    mask: Interest,
}

impl FdEntry {
    fn wanted(&self) -> Interest {
        let mut wanted = Interest::empty();
        if self.reader.is_some() {
            wanted |= Interest::READ;
        }
        if self.writer.is_some() {
            wanted |= Interest::WRITE;
        }
        wanted
    }
}

/// Readiness demultiplexer: a level-triggered epoll instance plus a lazy
/// registration cache.
///
/// The cache is the performance-relevant part: the OS selector is
/// reconfigured only when the effective event mask for an fd actually
/// changes, so a task doing repeated waits on the same descriptor while the
/// other direction stays parked costs no syscall.
pub(crate) struct Selector {
    epoll: Epoll,
    fds: HashMap<RawFd, FdEntry>,
    /// Always-registered wakeup fd (signals, worker completions).
    notify_fd: Option<RawFd>,
}

const EVENT_BATCH: usize = 64;

impl Selector {
    pub(crate) fn try_new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(io_err)?;
        Ok(Self {
            epoll,
            fds: HashMap::new(),
            notify_fd: None,
        })
    }

    /// Register the kernel's wakeup pipe; it stays readable-registered for
    /// the lifetime of the selector.
    pub(crate) fn register_notify(&mut self, fd: RawFd) -> Result<()> {
        let event = EpollEvent::new(EpollFlags::EPOLLIN, fd as u64);
        self.epoll.add(borrow_fd(fd), event).map_err(io_err)?;
        self.notify_fd = Some(fd);
        Ok(())
    }

    /// Park `record` as the reader or writer of `fd`, reconfiguring the OS
    /// selector only if the effective mask changed.
    pub(crate) fn register_waiter(
        &mut self,
        fd: RawFd,
        interest: Interest,
        record: Rc<TaskRecord>,
    ) -> Result<()> {
        let entry = self.fds.entry(fd).or_insert(FdEntry {
            reader: None,
            writer: None,
            mask: Interest::empty(),
        });

        let slot = if interest == Interest::READ {
            &mut entry.reader
        } else {
            &mut entry.writer
        };
        if slot.is_some() {
            return Err(Error::ResourceBusy(fd));
        }
        *slot = Some(record);

        if let Err(e) = self.sync_fd(fd) {
            // Roll the slot back so a bad fd does not poison the cache.
            if let Some(entry) = self.fds.get_mut(&fd) {
                if interest == Interest::READ {
                    entry.reader = None;
                } else {
                    entry.writer = None;
                }
                if entry.wanted().is_empty() && entry.mask.is_empty() {
                    self.fds.remove(&fd);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Drop one direction of interest, returning the task that was waiting
    /// on it (natural wakeup and cancellation both come through here).
    pub(crate) fn remove_waiter(
        &mut self,
        fd: RawFd,
        interest: Interest,
    ) -> Option<Rc<TaskRecord>> {
        let entry = self.fds.get_mut(&fd)?;
        let removed = if interest == Interest::READ {
            entry.reader.take()
        } else {
            entry.writer.take()
        };
        // Deregistration failures are not actionable mid-wakeup: the fd may
        // simply have been closed by the task already.
        let _ = self.sync_fd(fd);
        removed
    }

    /// Reconcile the OS registration of `fd` with the wanted mask.
    fn sync_fd(&mut self, fd: RawFd) -> Result<()> {
        let (wanted, mask) = match self.fds.get(&fd) {
            Some(entry) => (entry.wanted(), entry.mask),
            None => return Ok(()),
        };
        if wanted == mask {
            return Ok(());
        }

        if wanted.is_empty() {
            // A closed fd was already dropped by the OS; either way the
            // cache entry goes.
            let _ = self.epoll.delete(borrow_fd(fd));
            self.fds.remove(&fd);
            return Ok(());
        }

        let mut event = EpollEvent::new(wanted.epoll_flags(), fd as u64);
        let result = if mask.is_empty() {
            self.epoll.add(borrow_fd(fd), event)
        } else {
            self.epoll.modify(borrow_fd(fd), &mut event)
        };
        result.map_err(io_err)?;

        if let Some(entry) = self.fds.get_mut(&fd) {
            entry.mask = wanted;
        }
        Ok(())
    }

    /// One selector tick. Returns `(fd, readiness)` pairs; the caller wakes
    /// the matching reader/writer tasks. `None` blocks until an event.
    pub(crate) fn wait(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<SmallVec<[(RawFd, Interest); EVENT_BATCH]>> {
        let timeout = match timeout {
            Some(d) if d.is_zero() => EpollTimeout::ZERO,
            // Round up so a timer never fires before its deadline; waking a
            // hair late just means one extra heap peek.
            Some(d) => {
                let ms = d.as_millis().saturating_add(1).min(u16::MAX as u128);
                EpollTimeout::from(ms as u16)
            }
            None => EpollTimeout::NONE,
        };

        let mut events = [EpollEvent::empty(); EVENT_BATCH];
        let n = loop {
            match self.epoll.wait(&mut events, timeout) {
                Ok(n) => break n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io_err(e)),
            }
        };

        let mut ready = SmallVec::new();
        for event in &events[..n] {
            let fd = event.data() as RawFd;
            let flags = event.events();

            if Some(fd) == self.notify_fd {
                ready.push((fd, Interest::READ));
                continue;
            }

            let mut readiness = Interest::empty();
            if flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP)
            {
                readiness |= Interest::READ;
            }
            if flags.intersects(EpollFlags::EPOLLOUT | EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP)
            {
                readiness |= Interest::WRITE;
            }
            if !readiness.is_empty() {
                ready.push((fd, readiness));
            }
        }
        Ok(ready)
    }

    pub(crate) fn is_notify(&self, fd: RawFd) -> bool {
        Some(fd) == self.notify_fd
    }

    /// Number of descriptors with live task interest (the notify pipe is
    /// not counted).
    pub(crate) fn registered_fds(&self) -> usize {
        self.fds.len()
    }

    pub(crate) fn has_waiter(&self, fd: RawFd, interest: Interest) -> bool {
        self.fds.get(&fd).is_some_and(|e| {
            if interest == Interest::READ {
                e.reader.is_some()
            } else {
                e.writer.is_some()
            }
        })
    }
}

fn borrow_fd<'a>(fd: RawFd) -> BorrowedFd<'a> {
    // Safety: registrations are removed when the waiting task is woken or
    // cancelled; the kernel never holds an fd past the trap that parked on
    // it.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

fn io_err(errno: nix::errno::Errno) -> Error {
    Error::Io(std::io::Error::from_raw_os_error(errno as i32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::OFlag;
    use nix::unistd::pipe2;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_lazy_registration_tracks_both_directions() -> anyhow::Result<()> {
        let mut selector = Selector::try_new()?;
        let (rd, wr) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        let fd = rd.as_raw_fd();

        let reader = TaskRecord::new(false);
        let writer = TaskRecord::new(false);

        selector.register_waiter(fd, Interest::READ, reader.clone())?;
        assert!(selector.has_waiter(fd, Interest::READ));

        // Second reader on the same fd is rejected.
        assert!(matches!(
            selector.register_waiter(fd, Interest::READ, writer.clone()),
            Err(Error::ResourceBusy(_))
        ));

        selector.register_waiter(fd, Interest::WRITE, writer)?;
        // Dropping the read side keeps the fd registered for write.
        let evicted = selector.remove_waiter(fd, Interest::READ);
        assert_eq!(evicted.unwrap().id, reader.id);
        assert!(selector.has_waiter(fd, Interest::WRITE));
        assert_eq!(selector.registered_fds(), 1);

        selector.remove_waiter(fd, Interest::WRITE);
        assert_eq!(selector.registered_fds(), 0);

        drop(wr);
        Ok(())
    }

    #[test]
    fn test_wait_reports_readable_pipe() -> anyhow::Result<()> {
        let mut selector = Selector::try_new()?;
        let (rd, wr) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        let fd = rd.as_raw_fd();

        let reader = TaskRecord::new(false);
        selector.register_waiter(fd, Interest::READ, reader)?;

        // Nothing to read yet.
        let ready = selector.wait(Some(Duration::from_millis(0)))?;
        assert!(ready.is_empty());

        nix::unistd::write(&wr, b"x")?;
        let ready = selector.wait(Some(Duration::from_millis(100)))?;
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, fd);
        assert!(ready[0].1.contains(Interest::READ));
        Ok(())
    }
}
