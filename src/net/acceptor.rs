//! Asynchronous TCP acceptors and the acceptor service.

use crate::cancel::StopToken;
use crate::context::IoContext;
use crate::error::{Error, ErrorKind};
use crate::exec::scheduler::Scheduler;
use crate::io::op::{OpCtx, OpKind, OpState};
use crate::net::endpoint::Endpoint;
use crate::net::socket::{Socket, SocketService};
use crate::reactor::Reactor;
use crate::service::{DefaultService, RegisteredService, Service, ServiceRegistry};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Type};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

pub(crate) struct AcceptorImpl {
    sched: Arc<Scheduler>,
    reactor: Arc<dyn Reactor>,
    fd: Mutex<Option<socket2::Socket>>,
    pub(crate) acc: Arc<OpState>,
    local: Mutex<Option<Endpoint>>,
}

impl AcceptorImpl {
    fn new(sched: Arc<Scheduler>, reactor: Arc<dyn Reactor>) -> Arc<Self> {
        Arc::new(Self {
            sched,
            reactor,
            fd: Mutex::new(None),
            acc: OpState::new(OpKind::Accept),
            local: Mutex::new(None),
        })
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.lock().as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }

    fn is_open(&self) -> bool {
        self.fd.lock().is_some()
    }

    /// Opens, binds, and starts listening; ephemeral ports are
    /// resolved through `getsockname` and cached.
    fn listen(&self, endpoint: Endpoint, backlog: i32) -> Result<(), Error> {
        self.close_socket();

        let sock = socket2::Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        sock.set_nonblocking(true)?;
        sock.set_reuse_address(true)?;
        sock.bind(&endpoint.to_sock_addr())?;
        sock.listen(backlog)?;

        let local = sock
            .local_addr()
            .ok()
            .as_ref()
            .and_then(Endpoint::from_sock_addr);
        *self.local.lock() = local;
        *self.fd.lock() = Some(sock);
        Ok(())
    }

    fn start_accept(self: &Arc<Self>, waker: Waker, token: Option<&StopToken>) {
        let fd = self.raw_fd();
        let op = &self.acc;
        let strong: Arc<dyn Any + Send + Sync> = self.clone();
        op.begin(
            waker,
            OpCtx {
                reactor: self.reactor.clone(),
                sched: self.sched.clone(),
                keep_alive_src: Arc::downgrade(&strong),
                fd,
            },
            token,
        );

        if fd < 0 {
            op.complete(libc::EBADF, 0);
            op.settle();
            self.sched.post_op(op.clone());
            return;
        }

        op.perform_io();
        let errno = op.outcome().errno;
        if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
            op.complete(0, 0);
            op.register_with_reactor();
        } else {
            op.settle();
            self.sched.post_op(op.clone());
        }
    }

    fn cancel(&self) {
        self.acc.cancel_one();
    }

    fn close_socket(&self) {
        self.cancel();
        let sock = self.fd.lock().take();
        if let Some(sock) = sock {
            self.reactor.remove_fd(sock.as_raw_fd());
            drop(sock);
        }
        self.local.lock().take();
    }
}

impl std::fmt::Debug for AcceptorImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptorImpl")
            .field("fd", &self.raw_fd())
            .finish_non_exhaustive()
    }
}

/// Maintains the registry of live acceptor impls and creates peer
/// sockets for completed accepts.
pub struct AcceptorService {
    sched: Arc<Scheduler>,
    reactor: Arc<dyn Reactor>,
    socket_svc: Arc<SocketService>,
    impls: Mutex<HashMap<usize, Arc<AcceptorImpl>>>,
}

impl AcceptorService {
    fn create_impl(self: &Arc<Self>) -> Arc<AcceptorImpl> {
        let imp = AcceptorImpl::new(self.sched.clone(), self.reactor.clone());
        self.impls
            .lock()
            .insert(Arc::as_ptr(&imp) as usize, imp.clone());
        imp
    }

    fn destroy_impl(&self, imp: &Arc<AcceptorImpl>) {
        self.impls.lock().remove(&(Arc::as_ptr(imp) as usize));
    }
}

impl Service for AcceptorService {
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

impl RegisteredService for AcceptorService {
    type Key = AcceptorService;
}

impl DefaultService for AcceptorService {
    fn create(registry: &Arc<ServiceRegistry>) -> Self {
        let sched = registry
            .find_service::<Scheduler>()
            .expect("acceptor service requires the context scheduler");
        let reactor = sched.reactor().clone();
        let socket_svc = registry.use_service::<SocketService>();
        Self {
            sched,
            reactor,
            socket_svc,
            impls: Mutex::new(HashMap::new()),
        }
    }
}

impl std::fmt::Debug for AcceptorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptorService")
            .field("live_impls", &self.impls.lock().len())
            .finish_non_exhaustive()
    }
}

/// An asynchronous TCP acceptor.
///
/// Listen on an endpoint, then await [`Acceptor::accept`] for peer
/// sockets. At most one accept may be in flight at a time.
pub struct Acceptor {
    svc: Arc<AcceptorService>,
    imp: Arc<AcceptorImpl>,
}

impl Acceptor {
    /// Creates a closed acceptor on the context.
    #[must_use]
    pub fn new(ctx: &IoContext) -> Self {
        let svc = ctx.services().use_service::<AcceptorService>();
        let imp = svc.create_impl();
        Self { svc, imp }
    }

    /// Opens, binds, and listens on `endpoint` with the given backlog.
    /// Binding port zero picks an ephemeral port, visible afterwards
    /// through [`local_endpoint`](Acceptor::local_endpoint).
    pub fn listen(&self, endpoint: Endpoint, backlog: i32) -> Result<(), Error> {
        self.imp.listen(endpoint, backlog)
    }

    /// Returns true if the acceptor is listening.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.imp.is_open()
    }

    /// The bound local endpoint, if listening.
    #[must_use]
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        *self.imp.local.lock()
    }

    /// Waits for and returns the next peer connection.
    ///
    /// The peer socket arrives non-blocking and close-on-exec with its
    /// endpoints cached.
    #[must_use]
    pub fn accept(&self) -> Accept<'_> {
        Accept {
            acceptor: self,
            token: None,
            started: false,
        }
    }

    /// Completes a pending accept with `Canceled`.
    pub fn cancel(&self) {
        self.imp.cancel();
    }

    /// Cancels a pending accept and closes the listening socket.
    pub fn close(&self) {
        self.imp.close_socket();
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.imp.close_socket();
        self.svc.destroy_impl(&self.imp);
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("open", &self.is_open())
            .field("local", &self.local_endpoint())
            .finish_non_exhaustive()
    }
}

/// Future returned by [`Acceptor::accept`].
pub struct Accept<'a> {
    acceptor: &'a Acceptor,
    token: Option<StopToken>,
    started: bool,
}

impl Accept<'_> {
    /// Attaches a stop token; firing it cancels the accept.
    #[must_use]
    pub fn stop_token(mut self, token: StopToken) -> Self {
        self.token = Some(token);
        self
    }
}

impl Future for Accept<'_> {
    type Output = Result<Socket, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let op = &this.acceptor.imp.acc;

        if !this.started {
            if let Some(token) = &this.token {
                if token.stop_requested() {
                    return Poll::Ready(Err(Error::new(ErrorKind::Canceled)));
                }
            }
            this.acceptor
                .imp
                .start_accept(cx.waker().clone(), this.token.as_ref());
            this.started = true;
            return Poll::Pending;
        }

        match op.poll_finished(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(()) => {
                let outcome = op.outcome();
                if outcome.cancelled {
                    return Poll::Ready(Err(Error::new(ErrorKind::Canceled)));
                }
                if outcome.errno != 0 {
                    return Poll::Ready(Err(Error::from_errno(outcome.errno)));
                }
                let fd = op.take_accepted_fd();
                if fd < 0 {
                    return Poll::Ready(Err(Error::new(ErrorKind::Os)));
                }
                let socket_svc = this.acceptor.svc.socket_svc.clone();
                let peer = socket_svc.create_impl();
                peer.adopt(fd);
                Poll::Ready(Ok(Socket::from_impl(socket_svc, peer)))
            }
        }
    }
}

impl Drop for Accept<'_> {
    fn drop(&mut self) {
        if self.started {
            self.acceptor.imp.acc.detach();
        }
    }
}
