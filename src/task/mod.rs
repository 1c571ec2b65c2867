// Public API
mod id;
pub use id::TaskId;

pub(crate) mod handle;
pub use handle::{current_task, spawn, spawn_daemon, Task, TaskRef};

// Kernel-internal
pub(crate) mod record;
