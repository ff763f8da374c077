//! Asynchronous TCP sockets and the socket service.
//!
//! Every I/O operation follows the same pattern:
//!
//! 1. Try the syscall immediately (the socket is non-blocking)
//! 2. On success or a real error, post the op to the completion queue
//! 3. On `EAGAIN`, register with the reactor and wait
//!
//! The try-first approach avoids a reactor round-trip for operations
//! that can complete immediately, which is common for small transfers
//! on fast local connections.
//!
//! # Impl lifetime
//!
//! Socket impls are shared-ownership: the service's registry holds
//! one strong reference, and any op in flight through the completion
//! queue holds a keep-alive. Closing the socket drops the registry
//! reference; the impl is destroyed once the last op settles, so a
//! close with pending operations never leaves the scheduler holding a
//! dangling op.

use crate::buffer::{BufferArray, ConstBufferSequence, MutableBufferSequence};
use crate::cancel::StopToken;
use crate::context::IoContext;
use crate::error::{Error, ErrorKind};
use crate::exec::scheduler::Scheduler;
use crate::io::op::{OpCtx, OpKind, OpState};
use crate::net::endpoint::Endpoint;
use crate::reactor::Reactor;
use crate::service::{DefaultService, RegisteredService, Service, ServiceRegistry};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Type};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

/// Which direction [`Socket::shutdown`] closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    /// Further receives are disallowed.
    Receive,
    /// Further sends are disallowed.
    Send,
    /// Both directions.
    Both,
}

impl From<ShutdownKind> for Shutdown {
    fn from(kind: ShutdownKind) -> Self {
        match kind {
            ShutdownKind::Receive => Shutdown::Read,
            ShutdownKind::Send => Shutdown::Write,
            ShutdownKind::Both => Shutdown::Both,
        }
    }
}

/// The handle-carrying object behind a [`Socket`].
pub(crate) struct SocketImpl {
    sched: Arc<Scheduler>,
    reactor: Arc<dyn Reactor>,
    fd: Mutex<Option<socket2::Socket>>,
    pub(crate) conn: Arc<OpState>,
    pub(crate) rd: Arc<OpState>,
    pub(crate) wr: Arc<OpState>,
    local: Mutex<Option<Endpoint>>,
    remote: Mutex<Option<Endpoint>>,
}

impl SocketImpl {
    fn new(sched: Arc<Scheduler>, reactor: Arc<dyn Reactor>) -> Arc<Self> {
        Arc::new(Self {
            sched,
            reactor,
            fd: Mutex::new(None),
            conn: OpState::new(OpKind::Connect),
            rd: OpState::new(OpKind::Read),
            wr: OpState::new(OpKind::Write),
            local: Mutex::new(None),
            remote: Mutex::new(None),
        })
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.lock().as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.fd.lock().is_some()
    }

    fn keep_alive(self: &Arc<Self>) -> Weak<dyn Any + Send + Sync> {
        let strong: Arc<dyn Any + Send + Sync> = self.clone();
        Arc::downgrade(&strong)
    }

    fn op_ctx(self: &Arc<Self>, fd: RawFd) -> OpCtx {
        OpCtx {
            reactor: self.reactor.clone(),
            sched: self.sched.clone(),
            keep_alive_src: self.keep_alive(),
            fd,
        }
    }

    /// Opens a fresh non-blocking, close-on-exec TCP socket, closing
    /// any previous descriptor first.
    pub(crate) fn open(self: &Arc<Self>) -> Result<(), Error> {
        self.close_socket();
        let sock = socket2::Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        sock.set_nonblocking(true)?;
        #[cfg(target_vendor = "apple")]
        sock.set_nosigpipe(true)?;
        *self.fd.lock() = Some(sock);
        Ok(())
    }

    /// Installs an already-configured descriptor (accepted peers).
    pub(crate) fn adopt(self: &Arc<Self>, fd: RawFd) {
        // Safety: the accept path created this descriptor and hands
        // over sole ownership.
        let sock = unsafe { socket2::Socket::from_raw_fd(fd) };
        *self.fd.lock() = Some(sock);
        self.refresh_endpoints();
    }

    pub(crate) fn refresh_endpoints(&self) {
        let fd = self.fd.lock();
        if let Some(sock) = fd.as_ref() {
            *self.local.lock() = sock.local_addr().ok().as_ref().and_then(Endpoint::from_sock_addr);
            *self.remote.lock() = sock.peer_addr().ok().as_ref().and_then(Endpoint::from_sock_addr);
        }
    }

    fn post_immediate(self: &Arc<Self>, op: &Arc<OpState>) {
        op.settle();
        self.sched.post_op(op.clone());
    }

    /// Common try-first tail for read/write/accept: the op's own
    /// syscall already ran once; route by its errno.
    fn finish_start(self: &Arc<Self>, op: &Arc<OpState>) {
        let errno = op.outcome().errno;
        if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
            op.complete(0, 0);
            op.register_with_reactor();
        } else {
            self.post_immediate(op);
        }
    }

    pub(crate) fn start_connect(
        self: &Arc<Self>,
        endpoint: Endpoint,
        waker: Waker,
        token: Option<&StopToken>,
    ) {
        let fd = self.raw_fd();
        let op = &self.conn;
        op.begin(waker, self.op_ctx(fd), token);

        if fd < 0 {
            op.complete(libc::EBADF, 0);
            self.post_immediate(op);
            return;
        }

        let result = {
            let guard = self.fd.lock();
            match guard.as_ref() {
                Some(sock) => sock.connect(&endpoint.to_sock_addr()),
                None => Err(std::io::Error::from_raw_os_error(libc::EBADF)),
            }
        };

        match result {
            Ok(()) => {
                op.complete(0, 0);
                self.post_immediate(op);
            }
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {
                op.register_with_reactor();
            }
            Err(err) => {
                op.complete(err.raw_os_error().unwrap_or(libc::EIO), 0);
                self.post_immediate(op);
            }
        }
    }

    pub(crate) fn start_read(
        self: &Arc<Self>,
        bufs: BufferArray,
        waker: Waker,
        token: Option<&StopToken>,
    ) {
        let fd = self.raw_fd();
        let op = &self.rd;
        op.begin(waker, self.op_ctx(fd), token);

        if fd < 0 {
            op.complete(libc::EBADF, 0);
            self.post_immediate(op);
            return;
        }
        if bufs.total_len() == 0 {
            // A zero-byte readv is indistinguishable from EOF by its
            // return value alone; record that the buffer was empty.
            op.set_empty_read();
            op.complete(0, 0);
            self.post_immediate(op);
            return;
        }

        op.set_buffers(bufs);
        op.perform_io();
        self.finish_start(op);
    }

    pub(crate) fn start_write(
        self: &Arc<Self>,
        bufs: BufferArray,
        waker: Waker,
        token: Option<&StopToken>,
    ) {
        let fd = self.raw_fd();
        let op = &self.wr;
        op.begin(waker, self.op_ctx(fd), token);

        if fd < 0 {
            op.complete(libc::EBADF, 0);
            self.post_immediate(op);
            return;
        }
        if bufs.total_len() == 0 {
            op.complete(0, 0);
            self.post_immediate(op);
            return;
        }

        op.set_buffers(bufs);
        op.perform_io();
        self.finish_start(op);
    }

    /// Claims and posts every in-flight op with the cancelled flag.
    pub(crate) fn cancel(&self) {
        self.conn.cancel_one();
        self.rd.cancel_one();
        self.wr.cancel_one();
    }

    /// Cancels pending ops, unregisters, and closes the descriptor.
    pub(crate) fn close_socket(&self) {
        self.cancel();
        let sock = self.fd.lock().take();
        if let Some(sock) = sock {
            self.reactor.remove_fd(sock.as_raw_fd());
            drop(sock);
        }
        self.local.lock().take();
        self.remote.lock().take();
    }

    pub(crate) fn local_endpoint(&self) -> Option<Endpoint> {
        *self.local.lock()
    }

    pub(crate) fn remote_endpoint(&self) -> Option<Endpoint> {
        *self.remote.lock()
    }

    fn with_socket<R>(
        &self,
        f: impl FnOnce(&socket2::Socket) -> std::io::Result<R>,
    ) -> Result<R, Error> {
        let guard = self.fd.lock();
        match guard.as_ref() {
            Some(sock) => f(sock).map_err(Error::from),
            None => Err(Error::from_errno(libc::EBADF)),
        }
    }
}

impl std::fmt::Debug for SocketImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketImpl")
            .field("fd", &self.raw_fd())
            .finish_non_exhaustive()
    }
}

/// Maintains the shared-ownership registry of live socket impls.
pub struct SocketService {
    sched: Arc<Scheduler>,
    reactor: Arc<dyn Reactor>,
    impls: Mutex<HashMap<usize, Arc<SocketImpl>>>,
}

impl SocketService {
    pub(crate) fn create_impl(self: &Arc<Self>) -> Arc<SocketImpl> {
        let imp = SocketImpl::new(self.sched.clone(), self.reactor.clone());
        self.impls
            .lock()
            .insert(Arc::as_ptr(&imp) as usize, imp.clone());
        imp
    }

    /// Drops the registry's strong reference. The impl outlives this
    /// while pending ops hold keep-alives.
    pub(crate) fn destroy_impl(&self, imp: &Arc<SocketImpl>) {
        self.impls.lock().remove(&(Arc::as_ptr(imp) as usize));
    }

    /// Number of impls currently owned by the registry.
    #[must_use]
    pub fn live_impls(&self) -> usize {
        self.impls.lock().len()
    }
}

impl Service for SocketService {
    fn shutdown(&self) {
        let impls: Vec<_> = {
            let mut map = self.impls.lock();
            map.drain().map(|(_, imp)| imp).collect()
        };
        for imp in impls {
            imp.close_socket();
        }
    }
}

impl RegisteredService for SocketService {
    type Key = SocketService;
}

impl DefaultService for SocketService {
    fn create(registry: &Arc<ServiceRegistry>) -> Self {
        let sched = registry
            .find_service::<Scheduler>()
            .expect("socket service requires the context scheduler");
        let reactor = sched.reactor().clone();
        Self {
            sched,
            reactor,
            impls: Mutex::new(HashMap::new()),
        }
    }
}

impl std::fmt::Debug for SocketService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketService")
            .field("live_impls", &self.impls.lock().len())
            .finish_non_exhaustive()
    }
}

/// An asynchronous TCP socket.
///
/// The socket must be opened (or produced by an accept) before I/O.
/// At most one operation of each kind may be in flight at a time; one
/// read and one write may overlap.
///
/// Dropping the socket closes it: pending operations complete with
/// `Canceled` before the native handle is released.
pub struct Socket {
    svc: Arc<SocketService>,
    imp: Arc<SocketImpl>,
}

impl Socket {
    /// Creates a closed socket on the context.
    #[must_use]
    pub fn new(ctx: &IoContext) -> Self {
        let svc = ctx.services().use_service::<SocketService>();
        let imp = svc.create_impl();
        Self { svc, imp }
    }

    pub(crate) fn from_impl(svc: Arc<SocketService>, imp: Arc<SocketImpl>) -> Self {
        Self { svc, imp }
    }

    /// Opens the native socket (non-blocking, close-on-exec).
    pub fn open(&self) -> Result<(), Error> {
        self.imp.open()
    }

    /// Returns true if the native socket is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.imp.is_open()
    }

    /// Connects to the endpoint.
    #[must_use]
    pub fn connect(&self, endpoint: Endpoint) -> Connect<'_> {
        Connect {
            socket: self,
            endpoint,
            token: None,
            started: false,
        }
    }

    /// Reads into the buffer sequence, resolving after one transfer.
    ///
    /// Resolves `Ok(n)` for `n > 0` bytes (or `n == 0` only for an
    /// empty buffer), `Err(Eof)` when the peer finished sending, or
    /// the mapped transport error.
    #[must_use]
    pub fn read_some<'a, B>(&'a self, bufs: &'a mut B) -> ReadSome<'a, B>
    where
        B: MutableBufferSequence + ?Sized,
    {
        ReadSome {
            socket: self,
            bufs,
            token: None,
            started: false,
        }
    }

    /// Writes from the buffer sequence, resolving after one transfer.
    #[must_use]
    pub fn write_some<'a, B>(&'a self, bufs: &'a B) -> WriteSome<'a, B>
    where
        B: ConstBufferSequence + ?Sized,
    {
        WriteSome {
            socket: self,
            bufs,
            token: None,
            started: false,
        }
    }

    /// Completes every in-flight operation with `Canceled`.
    pub fn cancel(&self) {
        self.imp.cancel();
    }

    /// Cancels pending operations and closes the native socket.
    /// Starting new operations afterwards reports an error.
    pub fn close(&self) {
        self.imp.close_socket();
    }

    /// Disallows further sends and/or receives.
    pub fn shutdown(&self, what: ShutdownKind) -> Result<(), Error> {
        self.imp.with_socket(|s| s.shutdown(what.into()))
    }

    /// The cached local endpoint, if known.
    #[must_use]
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.imp.local_endpoint()
    }

    /// The cached remote endpoint, if known.
    #[must_use]
    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        self.imp.remote_endpoint()
    }

    // --- options -------------------------------------------------------

    /// Enables or disables `TCP_NODELAY`.
    pub fn set_nodelay(&self, enable: bool) -> Result<(), Error> {
        self.imp.with_socket(|s| s.set_nodelay(enable))
    }

    /// Returns the `TCP_NODELAY` setting.
    pub fn nodelay(&self) -> Result<bool, Error> {
        self.imp.with_socket(socket2::Socket::nodelay)
    }

    /// Configures `SO_KEEPALIVE`; `None` disables keepalive.
    pub fn set_keepalive(&self, keepalive: Option<Duration>) -> Result<(), Error> {
        self.imp.with_socket(|s| match keepalive {
            Some(interval) => {
                let params = socket2::TcpKeepalive::new().with_time(interval);
                s.set_tcp_keepalive(&params)
            }
            None => s.set_keepalive(false),
        })
    }

    /// Sets `SO_SNDBUF`.
    pub fn set_send_buffer_size(&self, bytes: usize) -> Result<(), Error> {
        self.imp.with_socket(|s| s.set_send_buffer_size(bytes))
    }

    /// Sets `SO_RCVBUF`.
    pub fn set_recv_buffer_size(&self, bytes: usize) -> Result<(), Error> {
        self.imp.with_socket(|s| s.set_recv_buffer_size(bytes))
    }

    /// Configures `SO_LINGER`; `None` disables lingering.
    pub fn set_linger(&self, linger: Option<Duration>) -> Result<(), Error> {
        self.imp.with_socket(|s| s.set_linger(linger))
    }

    #[cfg(test)]
    pub(crate) fn impl_weak(&self) -> Weak<SocketImpl> {
        Arc::downgrade(&self.imp)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.imp.close_socket();
        self.svc.destroy_impl(&self.imp);
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("open", &self.is_open())
            .field("local", &self.local_endpoint())
            .field("remote", &self.remote_endpoint())
            .finish_non_exhaustive()
    }
}

/// Future returned by [`Socket::connect`].
pub struct Connect<'a> {
    socket: &'a Socket,
    endpoint: Endpoint,
    token: Option<StopToken>,
    started: bool,
}

impl Connect<'_> {
    /// Attaches a stop token; firing it cancels the connect.
    #[must_use]
    pub fn stop_token(mut self, token: StopToken) -> Self {
        self.token = Some(token);
        self
    }
}

impl Future for Connect<'_> {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let op = &this.socket.imp.conn;

        if !this.started {
            if let Some(token) = &this.token {
                if token.stop_requested() {
                    return Poll::Ready(Err(Error::new(ErrorKind::Canceled)));
                }
            }
            this.socket.imp.start_connect(
                this.endpoint,
                cx.waker().clone(),
                this.token.as_ref(),
            );
            this.started = true;
            return Poll::Pending;
        }

        match op.poll_finished(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(()) => {
                let outcome = op.outcome();
                if outcome.cancelled {
                    Poll::Ready(Err(Error::new(ErrorKind::Canceled)))
                } else if outcome.errno != 0 {
                    Poll::Ready(Err(Error::from_errno(outcome.errno)))
                } else {
                    this.socket.imp.refresh_endpoints();
                    Poll::Ready(Ok(()))
                }
            }
        }
    }
}

impl Drop for Connect<'_> {
    fn drop(&mut self) {
        if self.started {
            self.socket.imp.conn.detach();
        }
    }
}

/// Future returned by [`Socket::read_some`].
pub struct ReadSome<'a, B: ?Sized> {
    socket: &'a Socket,
    bufs: &'a mut B,
    token: Option<StopToken>,
    started: bool,
}

impl<B: ?Sized> ReadSome<'_, B> {
    /// Attaches a stop token; firing it cancels the read.
    #[must_use]
    pub fn stop_token(mut self, token: StopToken) -> Self {
        self.token = Some(token);
        self
    }
}

impl<B> Future for ReadSome<'_, B>
where
    B: MutableBufferSequence + ?Sized,
{
    type Output = Result<usize, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let op = &this.socket.imp.rd;

        if !this.started {
            if let Some(token) = &this.token {
                if token.stop_requested() {
                    return Poll::Ready(Err(Error::new(ErrorKind::Canceled)));
                }
            }
            let mut arr = BufferArray::new();
            this.bufs.copy_to(&mut arr);
            this.socket
                .imp
                .start_read(arr, cx.waker().clone(), this.token.as_ref());
            this.started = true;
            return Poll::Pending;
        }

        match op.poll_finished(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(()) => Poll::Ready(op.io_result()),
        }
    }
}

impl<B: ?Sized> Drop for ReadSome<'_, B> {
    fn drop(&mut self) {
        if self.started {
            self.socket.imp.rd.detach();
        }
    }
}

/// Future returned by [`Socket::write_some`].
pub struct WriteSome<'a, B: ?Sized> {
    socket: &'a Socket,
    bufs: &'a B,
    token: Option<StopToken>,
    started: bool,
}

impl<B: ?Sized> WriteSome<'_, B> {
    /// Attaches a stop token; firing it cancels the write.
    #[must_use]
    pub fn stop_token(mut self, token: StopToken) -> Self {
        self.token = Some(token);
        self
    }
}

impl<B> Future for WriteSome<'_, B>
where
    B: ConstBufferSequence + ?Sized,
{
    type Output = Result<usize, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let op = &this.socket.imp.wr;

        if !this.started {
            if let Some(token) = &this.token {
                if token.stop_requested() {
                    return Poll::Ready(Err(Error::new(ErrorKind::Canceled)));
                }
            }
            let mut arr = BufferArray::new();
            this.bufs.copy_to(&mut arr);
            this.socket
                .imp
                .start_write(arr, cx.waker().clone(), this.token.as_ref());
            this.started = true;
            return Poll::Pending;
        }

        match op.poll_finished(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(()) => Poll::Ready(op.io_result()),
        }
    }
}

impl<B: ?Sized> Drop for WriteSome<'_, B> {
    fn drop(&mut self) {
        if self.started {
            self.socket.imp.wr.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_and_close() {
        let ctx = IoContext::new().expect("context");
        let sock = Socket::new(&ctx);
        assert!(!sock.is_open());
        sock.open().expect("open");
        assert!(sock.is_open());
        sock.close();
        assert!(!sock.is_open());
    }

    #[test]
    fn reopen_replaces_descriptor() {
        let ctx = IoContext::new().expect("context");
        let sock = Socket::new(&ctx);
        sock.open().expect("open");
        sock.open().expect("reopen");
        assert!(sock.is_open());
    }

    #[test]
    fn options_require_open_socket() {
        let ctx = IoContext::new().expect("context");
        let sock = Socket::new(&ctx);
        assert!(sock.set_nodelay(true).is_err());

        sock.open().expect("open");
        sock.set_nodelay(true).expect("nodelay");
        assert!(sock.nodelay().expect("query"));
        sock.set_keepalive(Some(Duration::from_secs(30)))
            .expect("keepalive");
        sock.set_keepalive(None).expect("keepalive off");
        sock.set_send_buffer_size(64 * 1024).expect("sndbuf");
        sock.set_recv_buffer_size(64 * 1024).expect("rcvbuf");
        sock.set_linger(Some(Duration::from_secs(1))).expect("linger");
        sock.set_linger(None).expect("linger off");
    }

    #[test]
    fn drop_removes_impl_from_registry() {
        let ctx = IoContext::new().expect("context");
        let svc = ctx.services().use_service::<SocketService>();
        let before = svc.live_impls();
        let sock = Socket::new(&ctx);
        assert_eq!(svc.live_impls(), before + 1);
        drop(sock);
        assert_eq!(svc.live_impls(), before);
    }

    #[test]
    fn shutdown_on_closed_socket_fails() {
        let ctx = IoContext::new().expect("context");
        let sock = Socket::new(&ctx);
        assert!(sock.shutdown(ShutdownKind::Both).is_err());
    }
}
