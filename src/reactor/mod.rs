//! Reactor abstraction for I/O event multiplexing.
//!
//! The reactor monitors registered file descriptors and reports which
//! pending operations became runnable. The scheduler owns one reactor
//! and drives it from `do_one`; everything above the [`Reactor`] trait
//! is backend-agnostic.
//!
//! # Key Types
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`Reactor`] | Trait for I/O readiness backends |
//! | [`Interest`] | Which readiness (read or write) an op waits for |
//! | [`PollReactor`] | The poller-backed implementation |
//!
//! # Registration model
//!
//! Registrations are **oneshot**: delivering an event disarms the
//! descriptor, and the remaining interest (if the fd still has the
//! other op kind pending) is re-armed before the next wait. One fd
//! holds at most one read-waiting op and one write-waiting op at a
//! time; the per-kind exclusivity is the impl's invariant, the
//! reactor just refuses to overwrite a live slot.
//!
//! # Claim discipline
//!
//! The reactor never completes operations. `wait` hands back the ops
//! whose readiness fired; the caller must win the atomic claim on
//! each before performing I/O, because a concurrent cancel may have
//! claimed the op already (see `io::op`).

mod poller;

pub(crate) use poller::PollReactor;

use crate::io::op::OpState;
use smallvec::SmallVec;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Interest flags indicating what readiness an operation waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// Interest in readable events.
    pub const READABLE: Interest = Interest(0b01);
    /// Interest in writable events.
    pub const WRITABLE: Interest = Interest(0b10);

    /// Returns true if readable interest is set.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// Returns true if writable interest is set.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }
}

/// Ops whose readiness fired during one wait.
pub(crate) type ReadyOps = SmallVec<[Arc<OpState>; 16]>;

/// Platform-agnostic readiness backend.
pub(crate) trait Reactor: Send + Sync {
    /// Registers `op` to be reported when `fd` has `interest` readiness.
    fn register(&self, fd: RawFd, op: &Arc<OpState>, interest: Interest) -> io::Result<()>;

    /// Removes the registration of the given kind, if present.
    ///
    /// Used to clear a stale registration when the claim handshake is
    /// lost; missing registrations are not an error.
    fn deregister(&self, fd: RawFd, interest: Interest);

    /// Drops every registration for `fd` and forgets the descriptor.
    /// Called before the fd is closed.
    fn remove_fd(&self, fd: RawFd);

    /// Registers an auxiliary wake descriptor (an eventfd). Readiness
    /// on it interrupts `wait`, is drained and re-armed internally,
    /// and produces no ready op.
    fn add_wake_source(&self, fd: RawFd) -> io::Result<()>;

    /// Unregisters an auxiliary wake descriptor.
    fn remove_wake_source(&self, fd: RawFd);

    /// Blocks until readiness, wakeup, or timeout.
    ///
    /// `None` blocks indefinitely, `Some(Duration::ZERO)` polls.
    /// Ready ops are appended to `ready` unclaimed.
    fn wait(&self, timeout: Option<Duration>, ready: &mut ReadyOps) -> io::Result<()>;

    /// Interrupts a concurrent [`wait`](Self::wait) from any thread.
    fn wake(&self);
}
