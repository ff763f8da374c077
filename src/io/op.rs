//! Per-operation state and the completion/cancellation race.
//!
//! Every async I/O operation owns one [`OpState`], a fixed slot
//! embedded in the impl behind the user-facing object (one slot per
//! op kind: connect, read, write, accept). The slot holds the waker
//! captured at suspension, the out-values for errno and transferred
//! bytes, and the two atomics that resolve the completion race.
//!
//! # Start protocol ("try first")
//!
//! The initiating thread attempts the syscall once on the non-blocking
//! descriptor. Immediate success or a real error posts the op straight
//! to the scheduler's completion queue. On `EAGAIN` the op registers
//! with the reactor through a three-state handshake:
//!
//! ```text
//! unregistered --store--> registering --CAS--> registered
//! ```
//!
//! A canceller may interleave anywhere in the handshake. Whoever
//! atomically exchanges the state back to `unregistered` *claims* the
//! op and is solely responsible for completing it; the loser observes
//! the failed exchange and does nothing, except that the initiating
//! thread, on losing its CAS, must clear the now-stale reactor
//! registration. The reactor only claims ops it observes fully
//! `registered`; if it catches the window where the state is still
//! `registering`, the initiator is mid-handshake and will settle the
//! state within a few instructions, so the reactor spins briefly.
//!
//! # Impl lifetime
//!
//! An op posted to the completion queue may outlive the user's last
//! reference to the I/O object. Whoever claims the op installs a
//! strong keep-alive reference to the owning impl; the delivery step
//! clears it after waking the task, so the impl is destroyed only
//! once every settled op has been drained.
//!
//! # Dropped-in-flight futures
//!
//! The buffers an op points at live in the awaiting future's caller.
//! If the future is dropped mid-flight, [`OpState::detach`] either
//! wins the claim (nobody else will touch the buffers) or waits for
//! the `settled` flag, which a claimant raises only after its syscall
//! returned. Either way the borrow ends strictly after the last use
//! of the raw descriptors.

use crate::buffer::BufferArray;
use crate::cancel::{StopRegistration, StopToken};
use crate::error::{Error, ErrorKind};
use crate::exec::scheduler::Scheduler;
use crate::reactor::{Interest, Reactor};
use parking_lot::Mutex;
use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

pub(crate) const UNREGISTERED: u8 = 0;
pub(crate) const REGISTERING: u8 = 1;
pub(crate) const REGISTERED: u8 = 2;

/// What operation a slot performs when its readiness fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Connect,
    Read,
    Write,
    Accept,
}

/// Everything a claimant needs to finish an op without the future.
pub(crate) struct OpCtx {
    pub reactor: Arc<dyn Reactor>,
    pub sched: Arc<Scheduler>,
    pub keep_alive_src: Weak<dyn Any + Send + Sync>,
    pub fd: RawFd,
}

/// Snapshot of an op's result, read by the awaiting future.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpOutcome {
    pub cancelled: bool,
    pub errno: i32,
    pub bytes: usize,
    pub empty_read: bool,
}

/// Fixed-size state record for one pending operation.
pub(crate) struct OpState {
    kind: OpKind,
    registered: AtomicU8,
    cancelled: AtomicBool,
    /// Raised by a claimant once it is done touching the buffers.
    settled: AtomicBool,
    /// Raised by delivery; the future may complete.
    finished: AtomicBool,
    errno: AtomicI32,
    bytes: AtomicUsize,
    empty_read: AtomicBool,
    accepted_fd: AtomicI32,
    bufs: Mutex<BufferArray>,
    waker: Mutex<Option<Waker>>,
    keep_alive: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    stop_reg: Mutex<Option<StopRegistration>>,
    ctx: Mutex<Option<OpCtx>>,
}

impl OpState {
    pub(crate) fn new(kind: OpKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            registered: AtomicU8::new(UNREGISTERED),
            cancelled: AtomicBool::new(false),
            settled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            errno: AtomicI32::new(0),
            bytes: AtomicUsize::new(0),
            empty_read: AtomicBool::new(false),
            accepted_fd: AtomicI32::new(-1),
            bufs: Mutex::new(BufferArray::new()),
            waker: Mutex::new(None),
            keep_alive: Mutex::new(None),
            stop_reg: Mutex::new(None),
            ctx: Mutex::new(None),
        })
    }

    /// The readiness this op waits for.
    pub(crate) fn interest(&self) -> Interest {
        match self.kind {
            OpKind::Read | OpKind::Accept => Interest::READABLE,
            OpKind::Connect | OpKind::Write => Interest::WRITABLE,
        }
    }

    /// Resets the slot and captures the suspension state: waker,
    /// claim context, and the optional stop callback.
    ///
    /// Must be called before the try-first syscall. The previous
    /// operation on this slot must have fully settled (invariant: at
    /// most one op of a given kind in flight per impl).
    pub(crate) fn begin(self: &Arc<Self>, waker: Waker, ctx: OpCtx, token: Option<&StopToken>) {
        debug_assert_eq!(self.registered.load(Ordering::Relaxed), UNREGISTERED);
        self.cancelled.store(false, Ordering::Relaxed);
        self.settled.store(false, Ordering::Relaxed);
        self.finished.store(false, Ordering::Relaxed);
        self.errno.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
        self.empty_read.store(false, Ordering::Relaxed);
        self.accepted_fd.store(-1, Ordering::Relaxed);
        *self.bufs.lock() = BufferArray::new();
        *self.waker.lock() = Some(waker);
        *self.ctx.lock() = Some(ctx);
        *self.stop_reg.lock() = token.and_then(|t| {
            let op = self.clone();
            t.register(move || op.cancel_one())
        });
    }

    pub(crate) fn set_buffers(&self, bufs: BufferArray) {
        *self.bufs.lock() = bufs;
    }

    pub(crate) fn set_empty_read(&self) {
        self.empty_read.store(true, Ordering::Relaxed);
    }

    /// Records the syscall result.
    pub(crate) fn complete(&self, errno: i32, bytes: usize) {
        self.errno.store(errno, Ordering::Relaxed);
        self.bytes.store(bytes, Ordering::Relaxed);
    }

    /// Marks the claimant done with the op's buffers.
    pub(crate) fn settle(&self) {
        self.settled.store(true, Ordering::Release);
    }

    pub(crate) fn outcome(&self) -> OpOutcome {
        OpOutcome {
            cancelled: self.cancelled.load(Ordering::Acquire),
            errno: self.errno.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            empty_read: self.empty_read.load(Ordering::Relaxed),
        }
    }

    /// Takes ownership of an accepted descriptor, if one is stored.
    pub(crate) fn take_accepted_fd(&self) -> RawFd {
        self.accepted_fd.swap(-1, Ordering::AcqRel)
    }

    /// Maps the outcome onto the read/write result contract.
    pub(crate) fn io_result(&self) -> Result<usize, Error> {
        let o = self.outcome();
        if o.cancelled {
            Err(Error::new(ErrorKind::Canceled))
        } else if o.errno != 0 {
            Err(Error::from_errno(o.errno))
        } else if self.kind == OpKind::Read && !o.empty_read && o.bytes == 0 {
            Err(Error::new(ErrorKind::Eof))
        } else {
            Ok(o.bytes)
        }
    }

    /// Parks the current waker unless the op already finished.
    pub(crate) fn poll_finished(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut waker = self.waker.lock();
        if self.finished.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        *waker = Some(cx.waker().clone());
        Poll::Pending
    }

    /// The reactor-side claim: only an op observed fully `registered`
    /// may be completed by the reactor thread. A `registering`
    /// observation means the initiator is mid-handshake; spin until
    /// the state resolves.
    pub(crate) fn claim_ready(&self) -> bool {
        loop {
            match self.registered.compare_exchange(
                REGISTERED,
                UNREGISTERED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(REGISTERING) => std::hint::spin_loop(),
                Err(_) => return false,
            }
        }
    }

    /// Cancels this op: sets the flag and, if the op was registered,
    /// claims it and posts it so its awaiter resumes with `Canceled`.
    ///
    /// Safe to call from any thread at any time, including from a
    /// stop-token callback.
    pub(crate) fn cancel_one(self: &Arc<Self>) {
        self.cancelled.store(true, Ordering::Release);
        let prev = self.registered.swap(UNREGISTERED, Ordering::AcqRel);
        if prev == UNREGISTERED {
            return;
        }
        let Some((reactor, sched, fd)) = self.ctx_parts() else {
            return;
        };
        if prev == REGISTERED {
            reactor.deregister(fd, self.interest());
        }
        // prev == REGISTERING: the initiator loses its CAS and clears
        // the stale registration itself.
        self.install_keep_alive();
        self.settle();
        sched.post_op(self.clone());
        sched.work_finished();
    }

    /// Registers with the reactor after an `EAGAIN`, running the
    /// three-state handshake against concurrent cancellation.
    pub(crate) fn register_with_reactor(self: &Arc<Self>) {
        let Some((reactor, sched, fd)) = self.ctx_parts() else {
            return;
        };
        let interest = self.interest();
        sched.work_started();
        self.registered.store(REGISTERING, Ordering::Release);

        if let Err(err) = reactor.register(fd, self, interest) {
            self.registered.store(UNREGISTERED, Ordering::Release);
            sched.work_finished();
            self.complete(err.raw_os_error().unwrap_or(libc::EINVAL), 0);
            self.settle();
            sched.post_op(self.clone());
            return;
        }

        match self.registered.compare_exchange(
            REGISTERING,
            REGISTERED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Err(_) => {
                // A canceller claimed mid-handshake and already posted
                // the op; close the window where the reactor holds a
                // stale registration.
                reactor.deregister(fd, interest);
            }
            Ok(_) => {
                if self.cancelled.load(Ordering::Acquire) {
                    let prev = self.registered.swap(UNREGISTERED, Ordering::AcqRel);
                    if prev != UNREGISTERED {
                        reactor.deregister(fd, interest);
                        self.install_keep_alive();
                        self.settle();
                        sched.post_op(self.clone());
                        sched.work_finished();
                    }
                }
            }
        }
    }

    /// Installs the strong keep-alive for the owning impl. Called by
    /// whoever claims the op.
    pub(crate) fn install_keep_alive(&self) {
        let upgraded = self
            .ctx
            .lock()
            .as_ref()
            .and_then(|c| c.keep_alive_src.upgrade());
        if let Some(strong) = upgraded {
            *self.keep_alive.lock() = Some(strong);
        }
    }

    /// Performs the operation's syscall. Runs on the claiming thread
    /// with exclusive access to the op's buffers.
    pub(crate) fn perform_io(&self) {
        let fd = match &*self.ctx.lock() {
            Some(c) => c.fd,
            None => return,
        };
        match self.kind {
            OpKind::Connect => {
                // Completion status of a non-blocking connect arrives
                // via SO_ERROR, not a syscall return value.
                let mut err: libc::c_int = 0;
                let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
                let rc = unsafe {
                    libc::getsockopt(
                        fd,
                        libc::SOL_SOCKET,
                        libc::SO_ERROR,
                        std::ptr::addr_of_mut!(err).cast(),
                        &mut len,
                    )
                };
                if rc < 0 {
                    err = last_errno();
                }
                self.complete(err, 0);
            }
            OpKind::Read => {
                let bufs = self.bufs.lock();
                let (iov, cnt) = iovecs(&bufs);
                let n = unsafe { libc::readv(fd, iov.as_ptr(), cnt) };
                if n >= 0 {
                    self.complete(0, n as usize);
                } else {
                    self.complete(last_errno(), 0);
                }
            }
            OpKind::Write => {
                let bufs = self.bufs.lock();
                let n = write_bufs(fd, &bufs);
                if n >= 0 {
                    self.complete(0, n as usize);
                } else {
                    self.complete(last_errno(), 0);
                }
            }
            OpKind::Accept => {
                let fd_new = accept_fd(fd);
                if fd_new >= 0 {
                    self.accepted_fd.store(fd_new, Ordering::Release);
                    self.complete(0, 0);
                } else {
                    self.complete(last_errno(), 0);
                }
            }
        }
    }

    /// Executes the completion handler on the scheduler thread: drop
    /// the stop callback, publish the result, release the keep-alive,
    /// and wake the awaiter.
    pub(crate) fn deliver(self: &Arc<Self>) {
        self.stop_reg.lock().take();
        self.close_stray_accept();
        self.finished.store(true, Ordering::Release);
        let waker = self.waker.lock().take();
        self.keep_alive.lock().take();
        self.ctx.lock().take();
        if let Some(w) = waker {
            w.wake();
        }
    }

    /// Discards an unexecuted op during scheduler shutdown.
    pub(crate) fn discard(self: &Arc<Self>) {
        self.stop_reg.lock().take();
        let fd = self.accepted_fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
        self.keep_alive.lock().take();
        self.ctx.lock().take();
    }

    /// Severs an op from a future being dropped mid-flight. On return
    /// no thread will touch the buffers the op pointed at.
    pub(crate) fn detach(self: &Arc<Self>) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        self.cancelled.store(true, Ordering::Release);
        let prev = self.registered.swap(UNREGISTERED, Ordering::AcqRel);
        if prev != UNREGISTERED {
            // We own completion now; balance the registration exactly
            // like a cancel would.
            if let Some((reactor, sched, fd)) = self.ctx_parts() {
                if prev == REGISTERED {
                    reactor.deregister(fd, self.interest());
                }
                self.install_keep_alive();
                self.settle();
                sched.post_op(self.clone());
                sched.work_finished();
            }
        } else {
            // A claimant may still be inside its syscall; wait for the
            // settle fence before letting the buffer borrow end. The
            // wait is bounded by one syscall on another thread.
            while !self.settled.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
        }
        self.waker.lock().take();
    }

    fn close_stray_accept(&self) {
        if self.kind != OpKind::Accept {
            return;
        }
        let o = self.outcome();
        if o.cancelled || o.errno != 0 {
            let fd = self.accepted_fd.swap(-1, Ordering::AcqRel);
            if fd >= 0 {
                unsafe { libc::close(fd) };
            }
        }
    }

    fn ctx_parts(&self) -> Option<(Arc<dyn Reactor>, Arc<Scheduler>, RawFd)> {
        let ctx = self.ctx.lock();
        ctx.as_ref()
            .map(|c| (c.reactor.clone(), c.sched.clone(), c.fd))
    }
}

impl std::fmt::Debug for OpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpState")
            .field("kind", &self.kind)
            .field("registered", &self.registered.load(Ordering::Relaxed))
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .field("finished", &self.finished.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn iovecs(bufs: &BufferArray) -> ([libc::iovec; crate::buffer::MAX_BUFFERS], libc::c_int) {
    let mut iov = [libc::iovec {
        iov_base: std::ptr::null_mut(),
        iov_len: 0,
    }; crate::buffer::MAX_BUFFERS];
    let descs = bufs.descriptors();
    for (slot, desc) in iov.iter_mut().zip(descs) {
        slot.iov_base = desc.ptr.cast();
        slot.iov_len = desc.len;
    }
    (iov, descs.len() as libc::c_int)
}

#[cfg(target_os = "linux")]
fn write_bufs(fd: RawFd, bufs: &BufferArray) -> isize {
    // MSG_NOSIGNAL suppresses SIGPIPE on writes to a closed peer.
    let (mut iov, cnt) = iovecs(bufs);
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = cnt as usize;
    unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) }
}

#[cfg(not(target_os = "linux"))]
fn write_bufs(fd: RawFd, bufs: &BufferArray) -> isize {
    // SO_NOSIGPIPE is set on the socket at open time.
    let (iov, cnt) = iovecs(bufs);
    unsafe { libc::writev(fd, iov.as_ptr(), cnt) }
}

#[cfg(target_os = "linux")]
fn accept_fd(fd: RawFd) -> RawFd {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    unsafe {
        libc::accept4(
            fd,
            std::ptr::addr_of_mut!(addr).cast(),
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    }
}

#[cfg(not(target_os = "linux"))]
fn accept_fd(fd: RawFd) -> RawFd {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let new_fd = unsafe { libc::accept(fd, std::ptr::addr_of_mut!(addr).cast(), &mut len) };
    if new_fd >= 0 {
        unsafe {
            let flags = libc::fcntl(new_fd, libc::F_GETFL, 0);
            if flags >= 0 {
                libc::fcntl(new_fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
            let flags = libc::fcntl(new_fd, libc::F_GETFD, 0);
            if flags >= 0 {
                libc::fcntl(new_fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
            }
            let nosigpipe: libc::c_int = 1;
            libc::setsockopt(
                new_fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                std::ptr::addr_of!(nosigpipe).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
    new_fd
}
