//! POSIX signal delivery into execution contexts.
//!
//! A [`SignalSet`] subscribes to signal numbers and awaits deliveries.
//! One process-wide handler is installed with `sigaction` on the
//! first registration of each signal number across all contexts and
//! removed (default disposition restored) on the last.
//!
//! # Handler discipline
//!
//! The C handler must be async-signal-safe, so it does exactly two
//! things: increments a per-context pending counter on a lock-free
//! static node list, and writes one byte to each live context's wake
//! descriptor. That descriptor is registered with the context's
//! reactor as a wake source, so a blocked scheduler returns from its
//! wait. Actual delivery (completing waiting ops, queueing
//! undelivered counts) happens on the scheduler thread through a
//! post-wait hook, with ordinary locks.
//!
//! Nodes (and their wake descriptors) are allocated once and never
//! freed; a context tearing down marks its node free for reuse, so
//! the handler can walk the list without synchronizing with service
//! lifetimes.

use crate::cancel::{StopRegistration, StopToken};
use crate::context::IoContext;
use crate::error::{Error, ErrorKind, Result};
use crate::exec::scheduler::Scheduler;
use crate::service::{DefaultService, RegisteredService, Service, ServiceRegistry};
use parking_lot::Mutex;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

/// Highest representable signal number (exclusive).
pub const MAX_SIGNALS: usize = 64;

/// Behavior flags for a signal registration.
///
/// Registrations for the same signal number across all sets must
/// agree on their flags unless they opt out with
/// [`DONT_CARE`](SignalFlags::DONT_CARE); a disagreement is rejected
/// with *invalid-argument*.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalFlags(u8);

impl SignalFlags {
    /// Default behavior: deliveries with no waiter are queued.
    pub const NONE: SignalFlags = SignalFlags(0);
    /// Accept whatever flags other registrations chose.
    pub const DONT_CARE: SignalFlags = SignalFlags(0b01);
    /// Drop deliveries that arrive while no wait is pending.
    pub const NO_QUEUE: SignalFlags = SignalFlags(0b10);

    const fn contains(self, other: SignalFlags) -> bool {
        self.0 & other.0 == other.0
    }

    const fn without(self, other: SignalFlags) -> SignalFlags {
        SignalFlags(self.0 & !other.0)
    }
}

impl std::ops::BitOr for SignalFlags {
    type Output = SignalFlags;
    fn bitor(self, rhs: SignalFlags) -> SignalFlags {
        SignalFlags(self.0 | rhs.0)
    }
}

// --- process-wide state ------------------------------------------------

/// One node per live signal service; leaked and reused, never freed.
struct SignalNode {
    in_use: AtomicBool,
    /// Written by the handler; -1 while the node is free.
    notify_fd: AtomicI32,
    /// The write side backing `notify_fd`, kept for node reuse.
    write_fd: RawFd,
    /// The descriptor the owning reactor waits on (equals `write_fd`
    /// for an eventfd, the read end for a pipe).
    wait_fd: RawFd,
    pending: [AtomicU32; MAX_SIGNALS],
    next: *const SignalNode,
}

unsafe impl Sync for SignalNode {}
unsafe impl Send for SignalNode {}

static NODE_LIST: AtomicPtr<SignalNode> = AtomicPtr::new(std::ptr::null_mut());

/// Handler install refcounts per signal number, across all contexts.
static INSTALL_COUNTS: Mutex<[usize; MAX_SIGNALS]> = Mutex::new([0; MAX_SIGNALS]);

#[cfg(target_os = "linux")]
fn new_wake_fds() -> std::io::Result<(RawFd, RawFd)> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok((fd, fd))
}

#[cfg(not(target_os = "linux"))]
fn new_wake_fds() -> std::io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    for fd in fds {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            let flags = libc::fcntl(fd, libc::F_GETFD, 0);
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
    Ok((fds[0], fds[1]))
}

/// Claims a free node or leaks a fresh one.
fn claim_node() -> std::io::Result<&'static SignalNode> {
    let mut cur = NODE_LIST.load(Ordering::Acquire);
    while !cur.is_null() {
        let node = unsafe { &*cur };
        if node
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Ok(node);
        }
        cur = node.next.cast_mut();
    }

    let (wait_fd, notify_fd) = new_wake_fds()?;
    let node_ptr = Box::into_raw(Box::new(SignalNode {
        in_use: AtomicBool::new(true),
        notify_fd: AtomicI32::new(notify_fd),
        write_fd: notify_fd,
        wait_fd,
        pending: std::array::from_fn(|_| AtomicU32::new(0)),
        next: std::ptr::null(),
    }));
    loop {
        let head = NODE_LIST.load(Ordering::Acquire);
        // The node is unpublished until the exchange succeeds; no
        // reader can observe the next pointer being set.
        unsafe { (*node_ptr).next = head };
        if NODE_LIST
            .compare_exchange(head, node_ptr, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Ok(unsafe { &*node_ptr });
        }
    }
}

/// The process signal handler. Async-signal-safe: atomic stores and
/// `write(2)` only.
extern "C" fn signal_entry(signo: libc::c_int) {
    if signo < 0 || signo as usize >= MAX_SIGNALS {
        return;
    }
    let mut cur = NODE_LIST.load(Ordering::Acquire);
    while !cur.is_null() {
        let node = unsafe { &*cur };
        if node.in_use.load(Ordering::Acquire) {
            node.pending[signo as usize].fetch_add(1, Ordering::AcqRel);
            let fd = node.notify_fd.load(Ordering::Acquire);
            if fd >= 0 {
                let one: u64 = 1;
                unsafe {
                    libc::write(fd, std::ptr::addr_of!(one).cast(), 8);
                }
            }
        }
        cur = node.next.cast_mut();
    }
}

/// Installs the process handler for `signo` (refcounted).
fn install_handler(signo: i32) -> Result<()> {
    let mut counts = INSTALL_COUNTS.lock();
    if counts[signo as usize] == 0 {
        let mut act: libc::sigaction = unsafe { std::mem::zeroed() };
        act.sa_sigaction = signal_entry as usize;
        act.sa_flags = libc::SA_RESTART;
        unsafe { libc::sigemptyset(&mut act.sa_mask) };
        if unsafe { libc::sigaction(signo, &act, std::ptr::null_mut()) } < 0 {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_context(format!("cannot install handler for signal {signo}")));
        }
    }
    counts[signo as usize] += 1;
    Ok(())
}

/// Releases one handler reference; restores the default disposition
/// on the last.
fn remove_handler(signo: i32) {
    let mut counts = INSTALL_COUNTS.lock();
    if counts[signo as usize] == 0 {
        return;
    }
    counts[signo as usize] -= 1;
    if counts[signo as usize] == 0 {
        let mut act: libc::sigaction = unsafe { std::mem::zeroed() };
        act.sa_sigaction = libc::SIG_DFL;
        unsafe {
            libc::sigemptyset(&mut act.sa_mask);
            libc::sigaction(signo, &act, std::ptr::null_mut());
        }
    }
}

// --- per-context service ----------------------------------------------

/// One pending signal wait.
pub(crate) struct SignalWait {
    sched: Arc<Scheduler>,
    cancelled: AtomicBool,
    finished: AtomicBool,
    signo: AtomicI32,
    /// True while this wait holds a unit of outstanding work.
    counted: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl SignalWait {
    fn new(sched: Arc<Scheduler>, waker: Waker) -> Arc<Self> {
        Arc::new(Self {
            sched,
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            signo: AtomicI32::new(0),
            counted: AtomicBool::new(false),
            waker: Mutex::new(Some(waker)),
        })
    }

    pub(crate) fn deliver(self: &Arc<Self>) {
        self.finished.store(true, Ordering::Release);
        let waker = self.waker.lock().take();
        if let Some(w) = waker {
            w.wake();
        }
        if self.counted.swap(false, Ordering::AcqRel) {
            self.sched.work_finished();
        }
    }

    pub(crate) fn discard(self: &Arc<Self>) {
        self.waker.lock().take();
        self.counted.store(false, Ordering::Release);
    }

    fn result(&self) -> Result<i32> {
        if self.cancelled.load(Ordering::Acquire) {
            Err(Error::new(ErrorKind::Canceled))
        } else {
            Ok(self.signo.load(Ordering::Acquire))
        }
    }

    fn poll_finished(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut waker = self.waker.lock();
        if self.finished.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        *waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl std::fmt::Debug for SignalWait {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalWait")
            .field("finished", &self.finished.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// The impl behind one [`SignalSet`].
pub(crate) struct SignalImpl {
    waiting: Mutex<Option<Arc<SignalWait>>>,
}

struct Registration {
    signo: i32,
    flags: SignalFlags,
    owner: Arc<SignalImpl>,
    undelivered: u32,
}

struct SignalInner {
    sched: Arc<Scheduler>,
    node: &'static SignalNode,
    regs: Mutex<Vec<Registration>>,
}

impl SignalInner {
    /// Drains the node's pending counters and routes deliveries to
    /// this context's registrations. Runs on the scheduler thread.
    fn process_pending(&self) {
        for signo in 0..MAX_SIGNALS {
            let n = self.node.pending[signo].swap(0, Ordering::AcqRel);
            for _ in 0..n {
                self.deliver_one(signo as i32);
            }
        }
    }

    fn deliver_one(&self, signo: i32) {
        let mut regs = self.regs.lock();
        for reg in regs.iter_mut().filter(|r| r.signo == signo) {
            let wait = reg.owner.waiting.lock().take();
            if let Some(wait) = wait {
                wait.signo.store(signo, Ordering::Release);
                self.sched.post_signal(wait);
            } else if !reg.flags.contains(SignalFlags::NO_QUEUE) {
                reg.undelivered += 1;
            }
        }
    }

    fn cancel_wait(&self, imp: &SignalImpl) {
        let wait = imp.waiting.lock().take();
        if let Some(wait) = wait {
            wait.cancelled.store(true, Ordering::Release);
            // The wait's outstanding-work unit is handed back here;
            // the post below carries its own.
            if wait.counted.swap(false, Ordering::AcqRel) {
                self.sched.post_signal(wait);
                self.sched.on_work_finished();
            } else {
                self.sched.post_signal(wait);
            }
        }
    }
}

/// Per-context signal delivery service.
pub struct SignalService {
    inner: Arc<SignalInner>,
}

impl SignalService {
    pub(crate) fn create_impl(&self) -> Arc<SignalImpl> {
        Arc::new(SignalImpl {
            waiting: Mutex::new(None),
        })
    }

    fn add(&self, imp: &Arc<SignalImpl>, signo: i32, flags: SignalFlags) -> Result<()> {
        if !(1..MAX_SIGNALS as i32).contains(&signo) {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_context(format!("signal number {signo} out of range")));
        }

        let mut regs = self.inner.regs.lock();
        if regs
            .iter()
            .any(|r| r.signo == signo && Arc::ptr_eq(&r.owner, imp))
        {
            return Ok(());
        }

        // Registrations for one signal must agree on flags unless a
        // side declared indifference.
        if let Some(existing) = regs.iter().find(|r| r.signo == signo) {
            let this_dont_care = flags.contains(SignalFlags::DONT_CARE);
            let other_dont_care = existing.flags.contains(SignalFlags::DONT_CARE);
            if !this_dont_care
                && !other_dont_care
                && flags.without(SignalFlags::DONT_CARE)
                    != existing.flags.without(SignalFlags::DONT_CARE)
            {
                return Err(Error::new(ErrorKind::InvalidArgument)
                    .with_context("conflicting flags for signal registration"));
            }
        }

        install_handler(signo)?;
        regs.push(Registration {
            signo,
            flags,
            owner: imp.clone(),
            undelivered: 0,
        });
        Ok(())
    }

    fn remove(&self, imp: &Arc<SignalImpl>, signo: i32) -> Result<()> {
        if !(1..MAX_SIGNALS as i32).contains(&signo) {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_context(format!("signal number {signo} out of range")));
        }
        let mut regs = self.inner.regs.lock();
        if let Some(pos) = regs
            .iter()
            .position(|r| r.signo == signo && Arc::ptr_eq(&r.owner, imp))
        {
            regs.swap_remove(pos);
            remove_handler(signo);
        }
        Ok(())
    }

    fn clear(&self, imp: &Arc<SignalImpl>) {
        let mut regs = self.inner.regs.lock();
        let mut i = 0;
        while i < regs.len() {
            if Arc::ptr_eq(&regs[i].owner, imp) {
                let signo = regs[i].signo;
                regs.swap_remove(i);
                remove_handler(signo);
            } else {
                i += 1;
            }
        }
    }

    fn start_wait(&self, imp: &Arc<SignalImpl>, wait: Arc<SignalWait>) {
        let mut regs = self.inner.regs.lock();
        // A queued delivery completes the wait immediately.
        for reg in regs.iter_mut() {
            if Arc::ptr_eq(&reg.owner, imp) && reg.undelivered > 0 {
                reg.undelivered -= 1;
                wait.signo.store(reg.signo, Ordering::Release);
                self.inner.sched.post_signal(wait);
                return;
            }
        }
        wait.counted.store(true, Ordering::Release);
        self.inner.sched.on_work_started();
        *imp.waiting.lock() = Some(wait);
    }
}

impl Service for SignalService {
    fn shutdown(&self) {
        let mut regs = self.inner.regs.lock();
        for reg in regs.drain(..) {
            remove_handler(reg.signo);
            if let Some(wait) = reg.owner.waiting.lock().take() {
                wait.discard();
            }
        }
        drop(regs);
        self.inner.node.notify_fd.store(-1, Ordering::Release);
        self.inner
            .sched
            .reactor()
            .remove_wake_source(self.inner.node.wait_fd);
        self.inner.node.in_use.store(false, Ordering::Release);
    }
}

impl RegisteredService for SignalService {
    type Key = SignalService;
}

impl DefaultService for SignalService {
    fn create(registry: &Arc<ServiceRegistry>) -> Self {
        let sched = registry
            .find_service::<Scheduler>()
            .expect("signal service requires the context scheduler");
        let node = claim_node().expect("signal wake descriptor");
        // Clear state a previous owner may have left behind.
        for pending in &node.pending {
            pending.store(0, Ordering::Release);
        }
        node.notify_fd.store(node.write_fd, Ordering::Release);
        sched
            .reactor()
            .add_wake_source(node.wait_fd)
            .expect("register signal wake descriptor");

        let inner = Arc::new(SignalInner {
            sched: sched.clone(),
            node,
            regs: Mutex::new(Vec::new()),
        });
        let hook: Weak<SignalInner> = Arc::downgrade(&inner);
        sched.add_wait_hook(Box::new(move || {
            if let Some(inner) = hook.upgrade() {
                inner.process_pending();
            }
        }));
        Self { inner }
    }
}

impl std::fmt::Debug for SignalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalService")
            .field("registrations", &self.inner.regs.lock().len())
            .finish_non_exhaustive()
    }
}

/// A set of subscribed signal numbers with an awaitable delivery.
///
/// # Example
///
/// ```ignore
/// let signals = SignalSet::new(&ctx);
/// signals.add(libc::SIGUSR1)?;
/// let signo = signals.wait().await?;
/// ```
pub struct SignalSet {
    svc: Arc<SignalService>,
    imp: Arc<SignalImpl>,
}

impl SignalSet {
    /// Creates an empty set on the context.
    #[must_use]
    pub fn new(ctx: &IoContext) -> Self {
        let svc = ctx.use_service::<SignalService>();
        let imp = svc.create_impl();
        Self { svc, imp }
    }

    /// Subscribes to a signal number with default flags.
    pub fn add(&self, signo: i32) -> Result<()> {
        self.svc.add(&self.imp, signo, SignalFlags::NONE)
    }

    /// Subscribes with explicit flags.
    pub fn add_with_flags(&self, signo: i32, flags: SignalFlags) -> Result<()> {
        self.svc.add(&self.imp, signo, flags)
    }

    /// Unsubscribes from a signal number.
    pub fn remove(&self, signo: i32) -> Result<()> {
        self.svc.remove(&self.imp, signo)
    }

    /// Unsubscribes from everything.
    pub fn clear(&self) {
        self.svc.clear(&self.imp);
    }

    /// Cancels a pending wait with `Canceled`.
    pub fn cancel(&self) {
        self.svc.inner.cancel_wait(&self.imp);
    }

    /// Waits for the next delivery to this set, resolving with the
    /// signal number.
    #[must_use]
    pub fn wait(&self) -> SignalWaitFuture<'_> {
        SignalWaitFuture {
            set: self,
            token: None,
            wait: None,
            stop_reg: None,
        }
    }
}

impl Drop for SignalSet {
    fn drop(&mut self) {
        self.clear();
        self.svc.inner.cancel_wait(&self.imp);
    }
}

impl std::fmt::Debug for SignalSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalSet").finish_non_exhaustive()
    }
}

/// Future returned by [`SignalSet::wait`].
pub struct SignalWaitFuture<'a> {
    set: &'a SignalSet,
    token: Option<StopToken>,
    wait: Option<Arc<SignalWait>>,
    stop_reg: Option<StopRegistration>,
}

impl SignalWaitFuture<'_> {
    /// Attaches a stop token; firing it cancels the wait.
    #[must_use]
    pub fn stop_token(mut self, token: StopToken) -> Self {
        self.token = Some(token);
        self
    }
}

impl Future for SignalWaitFuture<'_> {
    type Output = Result<i32>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let Some(wait) = this.wait.as_ref() else {
            if let Some(token) = &this.token {
                if token.stop_requested() {
                    return Poll::Ready(Err(Error::new(ErrorKind::Canceled)));
                }
            }
            let wait = SignalWait::new(this.set.svc.inner.sched.clone(), cx.waker().clone());
            this.set.svc.start_wait(&this.set.imp, wait.clone());
            if let Some(token) = &this.token {
                let inner = this.set.svc.inner.clone();
                let imp = this.set.imp.clone();
                this.stop_reg = token.register(move || inner.cancel_wait(&imp));
            }
            this.wait = Some(wait);
            return Poll::Pending;
        };

        match wait.poll_finished(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(()) => {
                this.stop_reg = None;
                Poll::Ready(wait.result())
            }
        }
    }
}

impl Drop for SignalWaitFuture<'_> {
    fn drop(&mut self) {
        let Some(wait) = self.wait.take() else {
            return;
        };
        if wait.finished.load(Ordering::Acquire) {
            return;
        }
        // Withdraw the wait if it is still parked on the impl.
        let parked = {
            let mut slot = self.set.imp.waiting.lock();
            match &*slot {
                Some(current) if Arc::ptr_eq(current, &wait) => slot.take(),
                _ => None,
            }
        };
        if let Some(wait) = parked {
            if wait.counted.swap(false, Ordering::AcqRel) {
                self.set.svc.inner.sched.on_work_finished();
            }
            wait.discard();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_operations() {
        let combined = SignalFlags::DONT_CARE | SignalFlags::NO_QUEUE;
        assert!(combined.contains(SignalFlags::DONT_CARE));
        assert!(combined.contains(SignalFlags::NO_QUEUE));
        assert_eq!(
            combined.without(SignalFlags::DONT_CARE),
            SignalFlags::NO_QUEUE
        );
    }

    #[test]
    fn out_of_range_signal_rejected() {
        let ctx = IoContext::new().expect("context");
        let set = SignalSet::new(&ctx);
        assert_eq!(
            set.add(0).expect_err("zero invalid").kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            set.add(MAX_SIGNALS as i32).expect_err("too big").kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            set.remove(-3).expect_err("negative").kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn conflicting_flags_rejected() {
        let ctx = IoContext::new().expect("context");
        let a = SignalSet::new(&ctx);
        let b = SignalSet::new(&ctx);

        a.add_with_flags(libc::SIGUSR2, SignalFlags::NO_QUEUE)
            .expect("first registration");
        let err = b
            .add_with_flags(libc::SIGUSR2, SignalFlags::NONE)
            .expect_err("conflict");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        // Indifferent registrations are accepted.
        b.add_with_flags(libc::SIGUSR2, SignalFlags::DONT_CARE)
            .expect("dont-care registration");
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let ctx = IoContext::new().expect("context");
        let set = SignalSet::new(&ctx);
        set.add(libc::SIGWINCH).expect("add");
        set.add(libc::SIGWINCH).expect("add again");
        set.remove(libc::SIGWINCH).expect("remove");
    }
}
