//! The user-facing deadline timer.

use super::service::{TimerService, TimerWait};
use crate::cancel::{StopRegistration, StopToken};
use crate::context::IoContext;
use crate::error::Error;
use crate::exec::scheduler::Scheduler;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// A steady-clock deadline timer.
///
/// At most one wait may be in flight at a time. [`Timer::cancel`]
/// resolves a pending wait with `Canceled`; a deadline already in the
/// past expires on the very next run iteration.
pub struct Timer {
    sched: Arc<Scheduler>,
    service: Arc<TimerService>,
    deadline: Mutex<Instant>,
    pending: Mutex<Option<Arc<TimerWait>>>,
}

impl Timer {
    /// Creates a timer on the context, with the deadline set to now.
    #[must_use]
    pub fn new(ctx: &IoContext) -> Self {
        Self {
            sched: ctx.scheduler().clone(),
            service: ctx.services().use_service::<TimerService>(),
            deadline: Mutex::new(Instant::now()),
            pending: Mutex::new(None),
        }
    }

    /// Sets the deadline to `duration` from now.
    pub fn expires_after(&self, duration: Duration) {
        *self.deadline.lock() = Instant::now() + duration;
    }

    /// Sets the deadline to an absolute time point.
    pub fn expires_at(&self, deadline: Instant) {
        *self.deadline.lock() = deadline;
    }

    /// The currently configured deadline.
    #[must_use]
    pub fn expiry(&self) -> Instant {
        *self.deadline.lock()
    }

    /// Waits until the deadline.
    ///
    /// Resolves with `Ok(())` on expiry or `Err(Canceled)` if the
    /// wait is cancelled first.
    #[must_use]
    pub fn wait(&self) -> TimerWaitFuture<'_> {
        TimerWaitFuture {
            timer: self,
            token: None,
            wait: None,
            stop_reg: None,
        }
    }

    /// Cancels a pending wait, if any.
    pub fn cancel(&self) {
        let wait = self.pending.lock().take();
        if let Some(wait) = wait {
            cancel_wait(&self.sched, &wait);
        }
    }
}

fn cancel_wait(sched: &Arc<Scheduler>, wait: &Arc<TimerWait>) {
    if wait.claim() {
        wait.mark_cancelled();
        sched.post_timer(wait.clone());
        sched.work_finished();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("expiry", &self.expiry())
            .finish_non_exhaustive()
    }
}

/// Future returned by [`Timer::wait`].
pub struct TimerWaitFuture<'a> {
    timer: &'a Timer,
    token: Option<StopToken>,
    wait: Option<Arc<TimerWait>>,
    stop_reg: Option<StopRegistration>,
}

impl TimerWaitFuture<'_> {
    /// Attaches a stop token; firing it cancels the wait.
    #[must_use]
    pub fn stop_token(mut self, token: StopToken) -> Self {
        self.token = Some(token);
        self
    }
}

impl Future for TimerWaitFuture<'_> {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let Some(wait) = this.wait.as_ref() else {
            if let Some(token) = &this.token {
                if token.stop_requested() {
                    return Poll::Ready(Err(Error::new(crate::error::ErrorKind::Canceled)));
                }
            }
            let timer = this.timer;
            let wait = TimerWait::new(cx.waker().clone());
            *timer.pending.lock() = Some(wait.clone());
            timer.sched.work_started();
            timer.service.schedule(timer.expiry(), wait.clone());

            if let Some(token) = &this.token {
                let sched = timer.sched.clone();
                let target = wait.clone();
                this.stop_reg = token.register(move || cancel_wait(&sched, &target));
            }
            this.wait = Some(wait);
            return Poll::Pending;
        };

        match wait.poll_finished(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(()) => {
                this.stop_reg = None;
                this.timer.pending.lock().take();
                Poll::Ready(wait.result())
            }
        }
    }
}

impl Drop for TimerWaitFuture<'_> {
    fn drop(&mut self) {
        let Some(wait) = self.wait.take() else {
            return;
        };
        if wait.is_finished() {
            return;
        }
        // Dropped mid-wait: claim the entry so the heap's copy is dead
        // and the work count balances without a delivery.
        if wait.claim() {
            self.timer.sched.work_finished();
        }
        wait.discard();
        self.timer.pending.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::async_run;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn timer_expires() {
        let ctx = IoContext::new().expect("context");
        let done = Arc::new(AtomicBool::new(false));

        let timer = Arc::new(Timer::new(&ctx));
        timer.expires_after(Duration::from_millis(20));

        let d = done.clone();
        let t = timer.clone();
        async_run(&ctx.executor(), async move {
            t.wait().await.expect("timer wait");
            d.store(true, Ordering::SeqCst);
        });

        let start = Instant::now();
        ctx.run();
        assert!(done.load(Ordering::SeqCst));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn past_deadline_fires_immediately() {
        let ctx = IoContext::new().expect("context");
        let done = Arc::new(AtomicBool::new(false));

        let timer = Arc::new(Timer::new(&ctx));
        timer.expires_at(Instant::now() - Duration::from_millis(5));

        let d = done.clone();
        let t = timer.clone();
        async_run(&ctx.executor(), async move {
            t.wait().await.expect("timer wait");
            d.store(true, Ordering::SeqCst);
        });

        let start = Instant::now();
        ctx.run();
        assert!(done.load(Ordering::SeqCst));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn cancel_resolves_wait_with_canceled() {
        let ctx = IoContext::new().expect("context");
        let outcome = Arc::new(Mutex::new(None));

        let timer = Arc::new(Timer::new(&ctx));
        timer.expires_after(Duration::from_secs(60));

        let o = outcome.clone();
        let waiter = timer.clone();
        async_run(&ctx.executor(), async move {
            *o.lock() = Some(waiter.wait().await);
        });

        let canceller = timer.clone();
        let trigger = Timer::new(&ctx);
        trigger.expires_after(Duration::from_millis(20));
        let trigger = Arc::new(trigger);
        let t = trigger.clone();
        async_run(&ctx.executor(), async move {
            t.wait().await.expect("trigger wait");
            canceller.cancel();
        });

        let start = Instant::now();
        ctx.run();
        let result = outcome.lock().take().expect("wait resolved");
        assert!(result.expect_err("cancelled").is_canceled());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn stop_token_cancels_wait() {
        let ctx = IoContext::new().expect("context");
        let outcome = Arc::new(Mutex::new(None));
        let source = Arc::new(crate::cancel::StopSource::new());

        let timer = Arc::new(Timer::new(&ctx));
        timer.expires_after(Duration::from_secs(60));

        let o = outcome.clone();
        let waiter = timer.clone();
        let token = source.token();
        async_run(&ctx.executor(), async move {
            *o.lock() = Some(waiter.wait().stop_token(token).await);
        });

        let trigger = Arc::new(Timer::new(&ctx));
        trigger.expires_after(Duration::from_millis(20));
        let t = trigger.clone();
        let src = source.clone();
        async_run(&ctx.executor(), async move {
            t.wait().await.expect("trigger wait");
            src.request_stop();
        });

        ctx.run();
        let result = outcome.lock().take().expect("wait resolved");
        assert!(result.expect_err("cancelled").is_canceled());
    }
}
