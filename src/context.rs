//! The execution context: one scheduler plus its services.

use crate::error::Result;
use crate::exec::scheduler::Scheduler;
use crate::exec::Executor;
use crate::net::{AcceptorService, SocketService};
use crate::service::{DefaultService, RegisteredService, ServiceRegistry};
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// An execution context groups one scheduler and its services, and
/// owns the service registry.
///
/// The scheduler, socket service and acceptor service are created
/// eagerly; timer and signal services appear on first use. Dropping
/// the context shuts every service down in reverse creation order.
///
/// One or many threads may call [`run`](IoContext::run) on the same
/// context; coroutines launched onto it are scheduled cooperatively
/// and resume only on threads inside the run family.
///
/// # Example
///
/// ```ignore
/// let ctx = IoContext::new()?;
/// async_run(&ctx.executor(), async move {
///     // open sockets, await I/O ...
/// });
/// ctx.run();
/// ```
pub struct IoContext {
    services: Arc<ServiceRegistry>,
    sched: Arc<Scheduler>,
}

impl IoContext {
    /// Creates a context with its core services installed.
    ///
    /// # Errors
    ///
    /// Fails if the OS poller cannot be created (e.g. out of file
    /// descriptors).
    pub fn new() -> io::Result<Self> {
        let services = Arc::new(ServiceRegistry::new());
        let sched = services
            .make_service(|| Scheduler::new(&services))
            .map_err(|e| io::Error::other(e.to_string()))?;
        let _ = services.use_service::<SocketService>();
        let _ = services.use_service::<AcceptorService>();
        Ok(Self { services, sched })
    }

    /// An executor handle for launching tasks onto this context.
    #[must_use]
    pub fn executor(&self) -> Executor {
        Executor::new(self.sched.clone())
    }

    pub(crate) fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    pub(crate) fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    // --- run family ---------------------------------------------------

    /// Runs handlers until the context is stopped or out of work.
    /// Returns the number of handlers executed.
    pub fn run(&self) -> usize {
        self.sched.run()
    }

    /// Runs at most one handler, blocking until one is ready.
    pub fn run_one(&self) -> usize {
        self.sched.run_one()
    }

    /// Runs at most one handler, blocking at most `timeout`.
    pub fn wait_one(&self, timeout: Duration) -> usize {
        self.sched.wait_one(timeout)
    }

    /// Runs all immediately-ready handlers without blocking.
    pub fn poll(&self) -> usize {
        self.sched.poll()
    }

    /// Runs at most one immediately-ready handler.
    pub fn poll_one(&self) -> usize {
        self.sched.poll_one()
    }

    /// Stops the context; all run-family calls return.
    pub fn stop(&self) {
        self.sched.stop();
    }

    /// Returns true if the context is stopped.
    #[must_use]
    pub fn stopped(&self) -> bool {
        self.sched.stopped()
    }

    /// Clears the stopped state after a [`stop`](IoContext::stop).
    pub fn restart(&self) {
        self.sched.restart();
    }

    /// Holds the context open across a period with no pending work.
    pub fn on_work_started(&self) {
        self.sched.on_work_started();
    }

    /// Releases a unit taken with [`on_work_started`](Self::on_work_started).
    pub fn on_work_finished(&self) {
        self.sched.on_work_finished();
    }

    // --- services -----------------------------------------------------

    /// Returns the service of type `T`, creating it if needed.
    pub fn use_service<T: DefaultService>(&self) -> Arc<T> {
        self.services.use_service::<T>()
    }

    /// Returns the service registered as `T` (or under key `T`).
    #[must_use]
    pub fn find_service<T: RegisteredService>(&self) -> Option<Arc<T>> {
        self.services.find_service::<T>()
    }

    /// Constructs and registers a service, failing with
    /// *already-exists* on a type or key conflict.
    pub fn make_service<T, F>(&self, init: F) -> Result<Arc<T>>
    where
        T: RegisteredService,
        F: FnOnce() -> io::Result<T>,
    {
        self.services.make_service(init)
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        self.services.shutdown_all();
    }
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("stopped", &self.stopped())
            .finish_non_exhaustive()
    }
}
