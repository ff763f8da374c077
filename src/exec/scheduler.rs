//! The scheduler: completion queue, reactor integration, run family.
//!
//! The scheduler is the heart of the event loop. It multiplexes I/O
//! readiness from the reactor with a completion queue of operations
//! that finished synchronously, were cancelled, or were posted.
//!
//! # Event loop structure (`do_one`)
//!
//! 1. Check the completion queue first (mutex-protected)
//! 2. If empty and work remains, block in the reactor with a timeout
//!    clamped to the nearest timer expiry
//! 3. Process expired timers
//! 4. For each ready descriptor, claim the operation and perform I/O
//! 5. Push completed operations onto the completion queue
//! 6. Pop one and execute it
//!
//! The completion queue exists because handlers must run outside the
//! readiness-processing loop: a resumed task may immediately start a
//! new operation on the same descriptor.
//!
//! # Work counting
//!
//! `outstanding_work` tracks pending operations; `run()` returns when
//! it reaches zero. Posted items carry a count from post to execute;
//! a reactor registration carries its count from registration through
//! the queue to execution. [`Scheduler::on_work_started`] and
//! [`Scheduler::on_work_finished`] let application code hold the loop
//! open across idle periods.

use crate::exec::queue::{Work, WorkQueue};
use crate::exec::task::Task;
use crate::io::op::OpState;
use crate::reactor::{PollReactor, Reactor, ReadyOps};
use crate::service::{RegisteredService, Service, ServiceRegistry};
use crate::signal::SignalWait;
use crate::time::{TimerService, TimerWait};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

thread_local! {
    /// Stack of schedulers currently running on this thread.
    static CONTEXT_STACK: RefCell<Vec<(usize, Weak<Scheduler>)>> =
        const { RefCell::new(Vec::new()) };
}

struct ThreadContextGuard;

impl ThreadContextGuard {
    fn enter(sched: &Arc<Scheduler>) -> Self {
        CONTEXT_STACK.with(|s| {
            s.borrow_mut()
                .push((sched.ident(), Arc::downgrade(sched)));
        });
        ThreadContextGuard
    }
}

impl Drop for ThreadContextGuard {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|s| {
            s.borrow_mut().pop();
        });
    }
}

/// Decrements the work count when an executed item goes out of scope,
/// even if the handler panics.
struct WorkGuard<'a>(&'a Scheduler);

impl Drop for WorkGuard<'_> {
    fn drop(&mut self) {
        self.0.work_finished();
    }
}

/// The per-context scheduler service.
pub struct Scheduler {
    reactor: Arc<dyn Reactor>,
    completed: Mutex<WorkQueue>,
    /// Signals followers that the queue changed or the loop should be
    /// re-evaluated (see `do_one`).
    queue_cv: Condvar,
    /// Held by the one thread currently blocked in the reactor; the
    /// poller admits a single waiter, so other runners park on the
    /// condvar until work or leadership is handed to them.
    reactor_busy: Mutex<()>,
    outstanding: AtomicIsize,
    stopped: AtomicBool,
    timers: Arc<TimerService>,
    /// Hooks invoked after every reactor wait (signal delivery).
    wait_hooks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl Scheduler {
    /// Builds the scheduler and wires the timer service's
    /// earliest-changed callback to the reactor wakeup.
    pub(crate) fn new(registry: &Arc<ServiceRegistry>) -> io::Result<Self> {
        let reactor: Arc<dyn Reactor> = Arc::new(PollReactor::new()?);
        let timers = registry.use_service::<TimerService>();
        let wake = reactor.clone();
        timers.set_on_earliest_changed(Box::new(move || wake.wake()));
        Ok(Self {
            reactor,
            completed: Mutex::new(WorkQueue::new()),
            queue_cv: Condvar::new(),
            reactor_busy: Mutex::new(()),
            outstanding: AtomicIsize::new(0),
            stopped: AtomicBool::new(false),
            timers,
            wait_hooks: Mutex::new(Vec::new()),
        })
    }

    fn ident(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    pub(crate) fn reactor(&self) -> &Arc<dyn Reactor> {
        &self.reactor
    }

    /// Registers a hook invoked on the scheduler thread after each
    /// reactor wait.
    pub(crate) fn add_wait_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        self.wait_hooks.lock().push(hook);
    }

    /// Returns true if the calling thread is inside this scheduler's
    /// run family.
    #[must_use]
    pub fn running_in_this_thread(&self) -> bool {
        let id = self.ident();
        CONTEXT_STACK.with(|s| s.borrow().iter().any(|(e, _)| *e == id))
    }

    /// The scheduler the calling thread is currently running, if any.
    pub(crate) fn current() -> Option<Arc<Scheduler>> {
        CONTEXT_STACK.with(|s| s.borrow().last().and_then(|(_, w)| w.upgrade()))
    }

    // --- posting -----------------------------------------------------

    pub(crate) fn post(&self, item: Work) {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        self.completed.lock().push(item);
        self.queue_cv.notify_one();
        self.reactor.wake();
    }

    pub(crate) fn post_task(&self, task: Arc<Task>) {
        self.post(Work::Task(task));
    }

    pub(crate) fn post_op(&self, op: Arc<OpState>) {
        self.post(Work::Io(op));
    }

    pub(crate) fn post_timer(&self, wait: Arc<TimerWait>) {
        self.post(Work::Timer(wait));
    }

    pub(crate) fn post_signal(&self, wait: Arc<SignalWait>) {
        self.post(Work::Signal(wait));
    }

    // --- work counting ----------------------------------------------

    /// Notes one unit of outstanding work. Pair with
    /// [`on_work_finished`](Self::on_work_finished).
    pub fn on_work_started(&self) {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
    }

    /// Releases one unit of outstanding work; stopping the context
    /// when the count reaches zero.
    pub fn on_work_finished(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.stop();
        }
    }

    /// Internal count increment without the stop-at-zero behavior.
    pub(crate) fn work_started(&self) {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
    }

    /// Internal count decrement without the stop-at-zero behavior.
    /// Hitting zero still wakes every runner so they observe the
    /// exhaustion.
    pub(crate) fn work_finished(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.queue_cv.notify_all();
            self.reactor.wake();
        }
    }

    pub(crate) fn outstanding(&self) -> isize {
        self.outstanding.load(Ordering::Acquire)
    }

    // --- stop / restart ----------------------------------------------

    /// Stops the scheduler: all run-family calls return as soon as
    /// possible, on every thread.
    pub fn stop(&self) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!("scheduler stopped");
            self.queue_cv.notify_all();
            self.reactor.wake();
        }
    }

    /// Returns true if the scheduler is stopped.
    #[must_use]
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Clears the stopped state so the run family may be called again.
    pub fn restart(&self) {
        self.stopped.store(false, Ordering::Release);
    }

    // --- run family --------------------------------------------------

    /// Runs handlers until stopped or out of work. Returns the number
    /// of handlers executed.
    pub fn run(self: &Arc<Self>) -> usize {
        if self.enter_run() {
            return 0;
        }
        let _ctx = ThreadContextGuard::enter(self);
        let mut n = 0usize;
        while self.do_one(None) != 0 {
            n = n.saturating_add(1);
        }
        n
    }

    /// Runs at most one handler, blocking until one is ready.
    pub fn run_one(self: &Arc<Self>) -> usize {
        if self.enter_run() {
            return 0;
        }
        let _ctx = ThreadContextGuard::enter(self);
        self.do_one(None)
    }

    /// Runs at most one handler, blocking no longer than `timeout`.
    pub fn wait_one(self: &Arc<Self>, timeout: Duration) -> usize {
        if self.enter_run() {
            return 0;
        }
        let _ctx = ThreadContextGuard::enter(self);
        self.do_one(Some(timeout))
    }

    /// Runs all immediately-ready handlers without blocking.
    pub fn poll(self: &Arc<Self>) -> usize {
        if self.enter_run() {
            return 0;
        }
        let _ctx = ThreadContextGuard::enter(self);
        let mut n = 0usize;
        while self.do_one(Some(Duration::ZERO)) != 0 {
            n = n.saturating_add(1);
        }
        n
    }

    /// Runs at most one immediately-ready handler.
    pub fn poll_one(self: &Arc<Self>) -> usize {
        if self.enter_run() {
            return 0;
        }
        let _ctx = ThreadContextGuard::enter(self);
        self.do_one(Some(Duration::ZERO))
    }

    /// Shared run-family entry check: stopped contexts and contexts
    /// with no outstanding work return zero without blocking.
    fn enter_run(&self) -> bool {
        if self.stopped() {
            return true;
        }
        if self.outstanding.load(Ordering::Acquire) == 0 {
            self.stop();
            return true;
        }
        false
    }

    fn do_one(&self, timeout: Option<Duration>) -> usize {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.stopped() {
                self.notify_exit();
                return 0;
            }

            if let Some(item) = self.pop_ready() {
                let _guard = WorkGuard(self);
                item.execute();
                return 1;
            }

            if self.outstanding.load(Ordering::Acquire) == 0 {
                self.notify_exit();
                return 0;
            }

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));

            // The poller admits one waiter; the thread that takes the
            // lease drives the reactor while the rest park on the
            // completion queue.
            let lease = self.reactor_busy.try_lock();
            let Some(lease) = lease else {
                if self.follow(remaining) {
                    continue;
                }
                return 0;
            };

            let effective = self.calculate_timeout(remaining);
            let mut ready = ReadyOps::new();
            match self.reactor.wait(effective, &mut ready) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    drop(lease);
                    if timeout.is_none() {
                        continue;
                    }
                    return 0;
                }
                Err(err) => {
                    drop(lease);
                    tracing::error!(error = %err, "reactor wait failed");
                    return 0;
                }
            }

            for wait in self.timers.take_expired(Instant::now()) {
                self.completed.lock().push(Work::Timer(wait));
            }

            for op in ready {
                // Only the thread that wins the claim may perform the
                // syscall; a concurrent cancel already posted the op.
                if op.claim_ready() {
                    op.install_keep_alive();
                    op.perform_io();
                    op.settle();
                    self.completed.lock().push(Work::Io(op));
                }
            }

            {
                let hooks = self.wait_hooks.lock();
                for hook in hooks.iter() {
                    hook();
                }
            }

            // Hand the reactor (or freshly queued work) to a parked
            // runner before taking an item ourselves.
            drop(lease);
            self.queue_cv.notify_one();

            if self.stopped() {
                self.notify_exit();
                return 0;
            }

            if let Some(item) = self.pop_ready() {
                let _guard = WorkGuard(self);
                item.execute();
                return 1;
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return 0;
            }
        }
    }

    /// Pops one queued item, waking another runner if more remain.
    fn pop_ready(&self) -> Option<Work> {
        let mut queue = self.completed.lock();
        let item = queue.pop();
        if item.is_some() && !queue.is_empty() {
            self.queue_cv.notify_one();
        }
        item
    }

    /// Parks a non-leader runner until the queue changes or the bound
    /// elapses. Returns false when the caller should give up.
    fn follow(&self, remaining: Option<Duration>) -> bool {
        let mut queue = self.completed.lock();
        if !queue.is_empty() {
            return true;
        }
        match remaining {
            Some(bound) if bound.is_zero() => false,
            Some(bound) => {
                let _ = self.queue_cv.wait_for(&mut queue, bound);
                true
            }
            None => {
                self.queue_cv.wait(&mut queue);
                true
            }
        }
    }

    /// Wakes every other runner so a stop or work exhaustion is
    /// observed by all threads in the run family.
    fn notify_exit(&self) {
        self.queue_cv.notify_all();
        self.reactor.wake();
    }

    /// Effective reactor timeout: the requested bound clamped by the
    /// time to the nearest timer expiry.
    fn calculate_timeout(&self, requested: Option<Duration>) -> Option<Duration> {
        if requested == Some(Duration::ZERO) {
            return requested;
        }
        let Some(nearest) = self.timers.nearest_expiry() else {
            return requested;
        };
        let until = nearest.saturating_duration_since(Instant::now());
        Some(match requested {
            Some(bound) => bound.min(until),
            None => until,
        })
    }
}

impl Service for Scheduler {
    /// Drains the completion queue, destroying unexecuted items, and
    /// zeroes the work count.
    fn shutdown(&self) {
        let mut drained = WorkQueue::new();
        drained.splice(&mut self.completed.lock());
        drop(drained);
        self.outstanding.store(0, Ordering::Release);
    }
}

impl RegisteredService for Scheduler {
    type Key = Scheduler;
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("outstanding", &self.outstanding())
            .field("stopped", &self.stopped())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> (Arc<ServiceRegistry>, Arc<Scheduler>) {
        let registry = Arc::new(ServiceRegistry::new());
        let sched = registry
            .make_service(|| Scheduler::new(&registry))
            .expect("scheduler");
        (registry, sched)
    }

    #[test]
    fn run_returns_immediately_with_no_work() {
        let (_reg, sched) = scheduler();
        assert_eq!(sched.run(), 0);
        // Running out of work stops the context.
        assert!(sched.stopped());
    }

    #[test]
    fn restart_clears_stop() {
        let (_reg, sched) = scheduler();
        sched.stop();
        assert!(sched.stopped());
        sched.restart();
        assert!(!sched.stopped());
    }

    #[test]
    fn stop_is_sticky_until_restart() {
        let (_reg, sched) = scheduler();
        sched.on_work_started();
        sched.stop();
        assert_eq!(sched.run(), 0);
        assert_eq!(sched.run_one(), 0);
        assert_eq!(sched.poll(), 0);
        sched.on_work_finished();
    }

    #[test]
    fn on_work_finished_reaching_zero_stops() {
        let (_reg, sched) = scheduler();
        sched.on_work_started();
        sched.on_work_started();
        sched.on_work_finished();
        assert!(!sched.stopped());
        sched.on_work_finished();
        assert!(sched.stopped());
    }

    #[test]
    fn running_in_this_thread_reflects_run() {
        let (_reg, sched) = scheduler();
        assert!(!sched.running_in_this_thread());
        // Entered only while inside the run family; verified through a
        // posted task in the exec::task tests.
    }

    #[test]
    fn wait_one_respects_timeout() {
        let (_reg, sched) = scheduler();
        sched.on_work_started();
        let start = Instant::now();
        let n = sched.wait_one(Duration::from_millis(50));
        assert_eq!(n, 0);
        assert!(start.elapsed() >= Duration::from_millis(40));
        sched.on_work_finished();
    }

    #[test]
    fn shutdown_clears_queue_and_work() {
        let (_reg, sched) = scheduler();
        let op = crate::io::op::OpState::new(crate::io::op::OpKind::Read);
        sched.post_op(op);
        assert_eq!(sched.outstanding(), 1);
        sched.shutdown();
        assert_eq!(sched.outstanding(), 0);
        assert!(sched.completed.lock().is_empty());
    }
}
