//! Min-heap timer service.

use crate::error::{Error, ErrorKind};
use crate::service::{DefaultService, RegisteredService, Service, ServiceRegistry};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Instant;

const WAITING: u8 = 0;
const CLAIMED: u8 = 1;

/// One pending timer wait; op-shaped so the scheduler can queue and
/// deliver it like any other work item.
pub(crate) struct TimerWait {
    state: AtomicU8,
    cancelled: AtomicBool,
    finished: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl TimerWait {
    pub(crate) fn new(waker: Waker) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(WAITING),
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            waker: Mutex::new(Some(waker)),
        })
    }

    /// Exactly one claimant (expiry or cancel) wins.
    pub(crate) fn claim(&self) -> bool {
        self.state
            .compare_exchange(WAITING, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn deliver(self: &Arc<Self>) {
        self.finished.store(true, Ordering::Release);
        let waker = self.waker.lock().take();
        if let Some(w) = waker {
            w.wake();
        }
    }

    pub(crate) fn discard(self: &Arc<Self>) {
        self.waker.lock().take();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn result(&self) -> Result<(), Error> {
        if self.cancelled.load(Ordering::Acquire) {
            Err(Error::new(ErrorKind::Canceled))
        } else {
            Ok(())
        }
    }

    pub(crate) fn poll_finished(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut waker = self.waker.lock();
        if self.finished.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        *waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl std::fmt::Debug for TimerWait {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerWait")
            .field("claimed", &(self.state.load(Ordering::Relaxed) == CLAIMED))
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

struct TimerEntry {
    deadline: Instant,
    generation: u64,
    wait: Arc<TimerWait>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse ordering for min-heap (earliest deadline first).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct HeapState {
    heap: BinaryHeap<TimerEntry>,
    next_generation: u64,
}

/// Per-context deadline registry.
///
/// Entries claimed by cancellation stay in the heap and are skipped
/// lazily when they surface at the top.
pub struct TimerService {
    state: Mutex<HeapState>,
    on_earliest_changed: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl TimerService {
    /// Installs the callback fired when a newly scheduled deadline
    /// becomes the earliest. The scheduler points this at its reactor
    /// wakeup so a blocking wait re-evaluates its timeout.
    pub(crate) fn set_on_earliest_changed(&self, callback: Box<dyn Fn() + Send + Sync>) {
        *self.on_earliest_changed.lock() = Some(callback);
    }

    /// Adds a wait with the given deadline.
    pub(crate) fn schedule(&self, deadline: Instant, wait: Arc<TimerWait>) {
        let became_earliest = {
            let mut state = self.state.lock();
            let earliest = state.heap.peek().map(|e| e.deadline);
            let generation = state.next_generation;
            state.next_generation += 1;
            state.heap.push(TimerEntry {
                deadline,
                generation,
                wait,
            });
            earliest.map_or(true, |e| deadline < e)
        };
        if became_earliest {
            let cb = self.on_earliest_changed.lock();
            if let Some(cb) = cb.as_ref() {
                cb();
            }
        }
    }

    /// Earliest pending deadline, if any.
    #[must_use]
    pub fn nearest_expiry(&self) -> Option<Instant> {
        self.state.lock().heap.peek().map(|e| e.deadline)
    }

    /// Number of entries in the heap (including lazily dead ones).
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// True when the heap holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().heap.is_empty()
    }

    /// Pops and claims every wait with deadline `<= now`. Claims lost
    /// to a concurrent cancel are dropped silently.
    pub(crate) fn take_expired(&self, now: Instant) -> SmallVec<[Arc<TimerWait>; 8]> {
        let mut expired = SmallVec::new();
        let mut state = self.state.lock();
        while let Some(entry) = state.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = state.heap.pop().expect("peeked entry");
            if entry.wait.claim() {
                expired.push(entry.wait);
            }
        }
        expired
    }
}

impl Service for TimerService {
    fn shutdown(&self) {
        self.state.lock().heap.clear();
    }
}

impl RegisteredService for TimerService {
    type Key = TimerService;
}

impl DefaultService for TimerService {
    fn create(_registry: &Arc<ServiceRegistry>) -> Self {
        Self {
            state: Mutex::new(HeapState::default()),
            on_earliest_changed: Mutex::new(None),
        }
    }
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService")
            .field("pending", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Wake;
    use std::time::Duration;

    struct Noop;
    impl Wake for Noop {
        fn wake(self: Arc<Self>) {}
    }

    fn service() -> TimerService {
        TimerService::create(&Arc::new(ServiceRegistry::new()))
    }

    fn wait() -> Arc<TimerWait> {
        TimerWait::new(Waker::from(Arc::new(Noop)))
    }

    #[test]
    fn empty_heap_has_no_deadline() {
        let svc = service();
        assert!(svc.is_empty());
        assert!(svc.nearest_expiry().is_none());
    }

    #[test]
    fn nearest_is_minimum() {
        let svc = service();
        let base = Instant::now();
        svc.schedule(base + Duration::from_millis(200), wait());
        svc.schedule(base + Duration::from_millis(100), wait());
        svc.schedule(base + Duration::from_millis(150), wait());
        assert_eq!(svc.nearest_expiry(), Some(base + Duration::from_millis(100)));
    }

    #[test]
    fn earliest_changed_fires_only_for_new_minimum() {
        let svc = service();
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let f = fired.clone();
        svc.set_on_earliest_changed(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        let base = Instant::now();
        svc.schedule(base + Duration::from_millis(100), wait());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        svc.schedule(base + Duration::from_millis(200), wait());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        svc.schedule(base + Duration::from_millis(50), wait());
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn take_expired_pops_all_due() {
        let svc = service();
        let base = Instant::now();
        let w1 = wait();
        let w2 = wait();
        let w3 = wait();
        svc.schedule(base + Duration::from_millis(50), w1.clone());
        svc.schedule(base + Duration::from_millis(100), w2.clone());
        svc.schedule(base + Duration::from_millis(200), w3.clone());

        let expired = svc.take_expired(base + Duration::from_millis(125));
        assert_eq!(expired.len(), 2);
        assert!(Arc::ptr_eq(&expired[0], &w1));
        assert!(Arc::ptr_eq(&expired[1], &w2));
        assert_eq!(svc.nearest_expiry(), Some(base + Duration::from_millis(200)));
    }

    #[test]
    fn cancelled_entries_are_skipped() {
        let svc = service();
        let base = Instant::now();
        let w = wait();
        svc.schedule(base + Duration::from_millis(10), w.clone());

        assert!(w.claim());
        w.mark_cancelled();

        let expired = svc.take_expired(base + Duration::from_millis(50));
        assert!(expired.is_empty());
        assert!(svc.is_empty());
    }

    #[test]
    fn past_deadline_expires_immediately() {
        let svc = service();
        let w = wait();
        svc.schedule(Instant::now() - Duration::from_millis(10), w.clone());
        let expired = svc.take_expired(Instant::now());
        assert_eq!(expired.len(), 1);
    }

    #[test]
    fn claim_is_exclusive() {
        let w = wait();
        assert!(w.claim());
        assert!(!w.claim());
    }
}
