//! Synchronization primitives for tasks.
//!
//! All of these are thin layers over kernel wait queues: blocking parks the
//! task FIFO, waking goes through the scheduler. None of them are safe to
//! share across OS threads; tasks on the one kernel thread share them
//! through cheap handle clones.

mod condition;
mod event;
mod lock;
mod queue;
mod semaphore;

pub use condition::Condition;
pub use event::Event;
pub use lock::Lock;
pub use queue::Queue;
pub use semaphore::Semaphore;
