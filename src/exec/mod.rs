//! Scheduler, tasks, and the executor protocol.
//!
//! # Executor affinity
//!
//! Every task is spawned onto exactly one scheduler and carries that
//! binding in its waker: waking posts the task back onto its own
//! scheduler's completion queue. Awaitables never resume a task
//! directly; they store the waker captured at suspension and wake it
//! from the completion handler, so resumption always happens on a
//! thread servicing the task's own executor. Crossing executors is
//! explicit, via [`run_on`].

pub(crate) mod frame;
pub(crate) mod queue;
pub(crate) mod scheduler;
pub(crate) mod task;

pub use frame::{FrameAllocator, FramePool, FramePoolStats};
pub use scheduler::Scheduler;
pub use task::{async_run, async_run_in, run_on, Executor, RunOn};
