//! corio: a coroutine-first asynchronous TCP I/O runtime.
//!
//! # Overview
//!
//! corio executes user-written coroutines that perform TCP I/O,
//! accept connections, wait on timers and signals, and resolve names.
//! A per-context reactor multiplexes readiness notifications from the
//! operating system; a scheduler dispatches ready work and enforces
//! stop/restart semantics; a type-indexed service registry holds the
//! per-context singletons behind it all.
//!
//! # Core guarantees
//!
//! - **Single completion**: every started operation is completed
//!   exactly once, resumed or cancelled, never both. The race between
//!   readiness and cancellation is resolved by an atomic claim.
//! - **Executor affinity**: a coroutine resumes on the executor it
//!   suspended on; waking re-posts the task to its own scheduler.
//! - **Close is cancel**: closing an I/O object completes every
//!   pending operation with `Canceled` before the native handle is
//!   released; the backing impl outlives its last in-flight op.
//! - **Deterministic teardown**: `run()` returns exactly when the
//!   context is stopped or out of work; dropping the context shuts
//!   services down in reverse creation order.
//!
//! # Module structure
//!
//! - [`context`]: the execution context and run family
//! - [`exec`]: scheduler, tasks, executors, frame allocation
//! - [`reactor`]: OS readiness multiplexing (internal op state lives
//!   in a private `io` module beneath it)
//! - [`net`]: sockets, acceptors, endpoints, name resolution
//! - [`time`]: deadline timers
//! - [`signal`]: POSIX signal sets
//! - [`buffer`]: buffer sequence protocol
//! - [`cancel`]: stop tokens
//! - [`combinator`]: whole-buffer transfers, serve loop
//! - [`error`]: error taxonomy
//!
//! # Example
//!
//! ```ignore
//! use corio::{async_run, Acceptor, Endpoint, IoContext, Socket};
//!
//! let ctx = IoContext::new()?;
//! let ex = ctx.executor();
//!
//! let acceptor = Acceptor::new(&ctx);
//! acceptor.listen(Endpoint::loopback(0), 128)?;
//! let port = acceptor.local_endpoint().unwrap().port();
//!
//! async_run(&ex, async move {
//!     let peer = acceptor.accept().await.expect("accept");
//!     let mut buf = [0u8; 1024];
//!     let n = peer.read_some(&mut buf).await.expect("read");
//!     let _ = peer.write_some(&buf[..n]).await;
//! });
//!
//! ctx.run();
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

pub mod buffer;
pub mod cancel;
pub mod combinator;
pub mod context;
pub mod error;
pub mod exec;
mod io;
pub mod net;
pub mod reactor;
pub mod service;
pub mod signal;
pub mod test_utils;
pub mod time;

pub use buffer::{BufferArray, ConstBufferSequence, ConsumingBuffers, MutableBufferSequence};
pub use cancel::{StopRegistration, StopSource, StopToken};
pub use context::IoContext;
pub use error::{Error, ErrorKind, Result};
pub use exec::{async_run, async_run_in, run_on, Executor, FrameAllocator, FramePool, Scheduler};
pub use net::{Acceptor, Endpoint, Resolver, ShutdownKind, Socket, SystemResolver};
pub use signal::{SignalFlags, SignalSet};
pub use time::Timer;
