//! Poller-backed reactor implementation.
//!
//! Wraps one [`polling::Poller`] (epoll on Linux, kqueue on BSD and
//! macOS) behind the [`Reactor`] trait. The poller delivers oneshot
//! notifications: an event disarms the descriptor, and remaining
//! interest is re-armed via `modify` while the event is processed.
//!
//! # Registration table
//!
//! The table maps each descriptor to at most two op slots (one read,
//! one write). The event key is the descriptor itself, so lookup on
//! delivery is a single map probe. The table mutex is the per-backend
//! synchronization the registration handshake relies on; the op state
//! atomics stay lock-free on the hot path.

use super::{Interest, Reactor, ReadyOps};
use crate::io::op::OpState;
use parking_lot::Mutex;
use polling::{Event, Poller};
use std::collections::{HashMap, HashSet};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct FdSlots {
    read: Option<Arc<OpState>>,
    write: Option<Arc<OpState>>,
}

impl FdSlots {
    fn armed(&self, fd: RawFd) -> Event {
        Event {
            key: fd as usize,
            readable: self.read.is_some(),
            writable: self.write.is_some(),
        }
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

/// Reactor built on the `polling` crate.
pub(crate) struct PollReactor {
    poller: Poller,
    slots: Mutex<HashMap<RawFd, FdSlots>>,
    wake_sources: Mutex<HashSet<RawFd>>,
}

impl PollReactor {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            slots: Mutex::new(HashMap::new()),
            wake_sources: Mutex::new(HashSet::new()),
        })
    }
}

impl Reactor for PollReactor {
    fn register(&self, fd: RawFd, op: &Arc<OpState>, interest: Interest) -> io::Result<()> {
        let mut slots = self.slots.lock();
        let fresh = !slots.contains_key(&fd);
        let slot = slots.entry(fd).or_default();

        if interest.is_readable() {
            debug_assert!(slot.read.is_none(), "read op already in flight");
            slot.read = Some(op.clone());
        } else {
            debug_assert!(slot.write.is_none(), "write op already in flight");
            slot.write = Some(op.clone());
        }

        let ev = slot.armed(fd);
        let result = if fresh {
            self.poller.add(fd, ev)
        } else {
            self.poller.modify(fd, ev)
        };
        if let Err(err) = result {
            // Roll the slot back so the failed op is not reported.
            if interest.is_readable() {
                slot.read = None;
            } else {
                slot.write = None;
            }
            if fresh {
                slots.remove(&fd);
            }
            return Err(err);
        }
        tracing::trace!(fd, ?interest, "registered op with reactor");
        Ok(())
    }

    fn deregister(&self, fd: RawFd, interest: Interest) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&fd) else {
            return;
        };
        if interest.is_readable() {
            slot.read = None;
        } else {
            slot.write = None;
        }
        let ev = slot.armed(fd);
        // Leave the descriptor added but disarmed when no interest
        // remains; remove_fd deletes it on close.
        let _ = self.poller.modify(fd, ev);
    }

    fn remove_fd(&self, fd: RawFd) {
        let removed = self.slots.lock().remove(&fd);
        if removed.is_some() {
            let _ = self.poller.delete(fd);
        }
    }

    fn add_wake_source(&self, fd: RawFd) -> io::Result<()> {
        self.poller.add(fd, Event::readable(fd as usize))?;
        self.wake_sources.lock().insert(fd);
        Ok(())
    }

    fn remove_wake_source(&self, fd: RawFd) {
        if self.wake_sources.lock().remove(&fd) {
            let _ = self.poller.delete(fd);
        }
    }

    fn wait(&self, timeout: Option<Duration>, ready: &mut ReadyOps) -> io::Result<()> {
        let mut events: Vec<Event> = Vec::with_capacity(64);
        self.poller.wait(&mut events, timeout)?;

        for ev in &events {
            let fd = ev.key as RawFd;

            if self.wake_sources.lock().contains(&fd) {
                // Drain the eventfd counter and re-arm; wake sources
                // never carry ops.
                let mut buf = [0u8; 8];
                unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
                let _ = self.poller.modify(fd, Event::readable(fd as usize));
                continue;
            }

            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(&fd) else {
                continue;
            };
            // Error and hangup conditions surface as combined
            // readiness; taking both slots lets each op observe the
            // condition through its own syscall.
            if ev.readable {
                if let Some(op) = slot.read.take() {
                    ready.push(op);
                }
            }
            if ev.writable {
                if let Some(op) = slot.write.take() {
                    ready.push(op);
                }
            }
            // The oneshot delivery disarmed the descriptor; re-arm
            // whatever interest is still pending.
            if !slot.is_empty() {
                let ev = slot.armed(fd);
                let _ = self.poller.modify(fd, ev);
            }
        }
        Ok(())
    }

    fn wake(&self) {
        let _ = self.poller.notify();
    }
}

impl std::fmt::Debug for PollReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollReactor")
            .field("registrations", &self.slots.lock().len())
            .finish_non_exhaustive()
    }
}
