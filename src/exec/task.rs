//! Task records, spawning, and executor rebinding.
//!
//! A spawned task is a reference-counted record holding its future in
//! a pooled [`TaskFrame`](crate::exec::frame::TaskFrame). The record
//! doubles as the task's waker: waking re-posts the task onto the
//! scheduler it was spawned on. Resumption therefore always happens
//! on a thread running that scheduler: the waker *is* the captured
//! dispatcher, and every awaitable that stores it resumes its task
//! through the executor it suspended on.
//!
//! [`async_run`] is fire-and-forget: there is no join handle and no
//! result channel. A task reports its effects through the objects it
//! touches; a panic unwinds out of the servicing `run()` call.

use crate::exec::frame::{FrameAllocator, FramePool, TaskFrame};
use crate::exec::scheduler::Scheduler;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

/// A cloneable handle for launching work onto a context's scheduler.
#[derive(Clone)]
pub struct Executor {
    sched: Arc<Scheduler>,
}

impl Executor {
    pub(crate) fn new(sched: Arc<Scheduler>) -> Self {
        Self { sched }
    }

    /// Returns true if the calling thread is running this executor.
    #[must_use]
    pub fn running_in_this_thread(&self) -> bool {
        self.sched.running_in_this_thread()
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor").finish_non_exhaustive()
    }
}

/// A spawned task: the frame plus the scheduler that owns it.
pub(crate) struct Task {
    sched: Arc<Scheduler>,
    frame: Mutex<Option<TaskFrame>>,
}

impl Task {
    /// Polls the task's future once. Completion drops the frame, and
    /// with it the future's frame allocation.
    pub(crate) fn run(self: Arc<Self>) {
        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        let mut frame = self.frame.lock();
        let Some(active) = frame.as_mut() else {
            // Spurious wake after completion.
            return;
        };
        if active.poll(&mut cx).is_ready() {
            *frame = None;
        }
    }

    /// Discards the task without polling (scheduler shutdown).
    pub(crate) fn abandon(self: Arc<Self>) {
        *self.frame.lock() = None;
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        let sched = self.sched.clone();
        sched.post_task(self);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.sched.post_task(self.clone());
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").finish_non_exhaustive()
    }
}

/// Starts a task for execution on an executor.
///
/// The task is posted to the executor's scheduler and begins running
/// when the scheduler processes the post. It is fire-and-forget: the
/// frame self-destructs on completion, and there is no mechanism to
/// retrieve a result. Report errors through the task's effects.
///
/// # Example
///
/// ```ignore
/// let ctx = IoContext::new()?;
/// async_run(&ctx.executor(), async move {
///     // ...
/// });
/// ctx.run();
/// ```
pub fn async_run<F>(ex: &Executor, future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    async_run_in(ex, future, FramePool::shared().clone());
}

/// [`async_run`] with an explicit frame allocator.
///
/// The allocator is captured by the task and used for the frame's
/// entire lifetime; the default is the shared [`FramePool`].
pub fn async_run_in<F>(ex: &Executor, future: F, alloc: Arc<dyn FrameAllocator>)
where
    F: Future<Output = ()> + Send + 'static,
{
    let task = Arc::new(Task {
        sched: ex.sched.clone(),
        frame: Mutex::new(Some(TaskFrame::new(future, alloc))),
    });
    ex.sched.post_task(task);
}

enum RelaySlot<T> {
    Pending(Option<Waker>),
    Done(T),
    Taken,
}

struct Relay<T> {
    slot: Mutex<RelaySlot<T>>,
}

impl<T> Relay<T> {
    fn complete(&self, value: T) {
        let waker = {
            let mut slot = self.slot.lock();
            let prev = std::mem::replace(&mut *slot, RelaySlot::Done(value));
            match prev {
                RelaySlot::Pending(waker) => waker,
                _ => None,
            }
        };
        if let Some(w) = waker {
            w.wake();
        }
    }
}

/// Rebinds a future to run on another executor.
///
/// The inner future executes entirely on `ex`; the awaiting task
/// resumes on its own executor once the inner future finishes. The
/// caller's context is held open while the inner future runs.
///
/// # Example
///
/// ```ignore
/// let value = run_on(&other.executor(), async move { compute().await }).await;
/// ```
pub fn run_on<F>(ex: &Executor, future: F) -> RunOn<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    RunOn {
        ex: ex.clone(),
        future: Some(future),
        relay: None,
        hold: None,
    }
}

/// Future returned by [`run_on`].
pub struct RunOn<F: Future> {
    ex: Executor,
    future: Option<F>,
    relay: Option<Arc<Relay<F::Output>>>,
    hold: Option<WorkHold>,
}

/// Keeps the caller's scheduler alive while a cross-executor hop is
/// outstanding.
struct WorkHold {
    sched: Arc<Scheduler>,
}

impl WorkHold {
    fn current() -> Option<Self> {
        Scheduler::current().map(|sched| {
            sched.on_work_started();
            WorkHold { sched }
        })
    }
}

impl Drop for WorkHold {
    fn drop(&mut self) {
        self.sched.on_work_finished();
    }
}

impl<F> Future for RunOn<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: `future` is only ever moved out via `take()`, never polled
        // in place through this `Pin`, so no field requires structural
        // pinning and projecting to `&mut Self` is sound regardless of `F`.
        let this = unsafe { self.get_unchecked_mut() };

        if let Some(future) = this.future.take() {
            this.hold = WorkHold::current();
            let relay = Arc::new(Relay {
                slot: Mutex::new(RelaySlot::Pending(Some(cx.waker().clone()))),
            });
            this.relay = Some(relay.clone());
            async_run(&this.ex, async move {
                relay.complete(future.await);
            });
            return Poll::Pending;
        }

        let relay = this.relay.as_ref().expect("polled after completion");
        let mut slot = relay.slot.lock();
        match &mut *slot {
            RelaySlot::Pending(waker) => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
            done @ RelaySlot::Done(_) => {
                let RelaySlot::Done(value) = std::mem::replace(done, RelaySlot::Taken) else {
                    unreachable!()
                };
                drop(slot);
                this.hold = None;
                Poll::Ready(value)
            }
            RelaySlot::Taken => panic!("polled after completion"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceRegistry;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn context() -> (Arc<ServiceRegistry>, Arc<Scheduler>, Executor) {
        let registry = Arc::new(ServiceRegistry::new());
        let sched = registry
            .make_service(|| Scheduler::new(&registry))
            .expect("scheduler");
        let ex = Executor::new(sched.clone());
        (registry, sched, ex)
    }

    #[test]
    fn spawned_task_runs() {
        let (_reg, sched, ex) = context();
        let hit = Arc::new(AtomicBool::new(false));
        let h = hit.clone();
        async_run(&ex, async move {
            h.store(true, Ordering::SeqCst);
        });
        assert!(!hit.load(Ordering::SeqCst));
        let n = sched.run();
        assert_eq!(n, 1);
        assert!(hit.load(Ordering::SeqCst));
    }

    #[test]
    fn multiple_tasks_all_run() {
        let (_reg, sched, ex) = context();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let c = count.clone();
            async_run(&ex, async move {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.run();
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn task_observes_running_in_this_thread() {
        let (_reg, sched, ex) = context();
        let observed = Arc::new(AtomicBool::new(false));
        let o = observed.clone();
        let probe = ex.clone();
        async_run(&ex, async move {
            o.store(probe.running_in_this_thread(), Ordering::SeqCst);
        });
        sched.run();
        assert!(observed.load(Ordering::SeqCst));
    }

    #[test]
    fn yielded_task_resumes_after_wake() {
        struct YieldOnce(bool);
        impl Future for YieldOnce {
            type Output = ();
            fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
                if self.0 {
                    Poll::Ready(())
                } else {
                    self.0 = true;
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
            }
        }

        let (_reg, sched, ex) = context();
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        async_run(&ex, async move {
            YieldOnce(false).await;
            d.store(true, Ordering::SeqCst);
        });
        sched.run();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn run_on_executes_on_target_and_resumes_home() {
        let (_reg_a, sched_a, ex_a) = context();
        let (_reg_b, sched_b, ex_b) = context();

        let inner_on_b = Arc::new(AtomicBool::new(false));
        let resumed_on_a = Arc::new(AtomicBool::new(false));

        // Hold context B open until the hop has round-tripped.
        sched_b.on_work_started();

        let flag_b = inner_on_b.clone();
        let flag_a = resumed_on_a.clone();
        let probe_a = ex_a.clone();
        let probe_b = ex_b.clone();
        let hop = ex_b.clone();
        let release_b = sched_b.clone();
        async_run(&ex_a, async move {
            let value = run_on(&hop, async move {
                flag_b.store(probe_b.running_in_this_thread(), Ordering::SeqCst);
                41 + 1
            })
            .await;
            assert_eq!(value, 42);
            flag_a.store(probe_a.running_in_this_thread(), Ordering::SeqCst);
            release_b.on_work_finished();
        });

        let runner_b = sched_b.clone();
        let b_thread = std::thread::spawn(move || {
            runner_b.run();
        });
        sched_a.run();
        b_thread.join().expect("context b thread");

        assert!(inner_on_b.load(Ordering::SeqCst));
        assert!(resumed_on_a.load(Ordering::SeqCst));
    }
}
