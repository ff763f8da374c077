//! Asynchronous TCP networking: sockets, acceptors, endpoints.

mod acceptor;
mod endpoint;
mod resolver;
mod socket;

pub use acceptor::{Accept, Acceptor, AcceptorService};
pub use endpoint::Endpoint;
pub use resolver::{Resolver, SystemResolver};
pub use socket::{Connect, ReadSome, ShutdownKind, Socket, SocketService, WriteSome};
