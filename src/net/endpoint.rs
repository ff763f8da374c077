//! TCP endpoints (IPv4).

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// An `(address, port)` pair identifying a TCP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    addr: Ipv4Addr,
    port: u16,
}

impl Endpoint {
    /// Creates an endpoint from an address and port.
    #[must_use]
    pub const fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }

    /// Loopback endpoint on the given port.
    #[must_use]
    pub const fn loopback(port: u16) -> Self {
        Self::new(Ipv4Addr::LOCALHOST, port)
    }

    /// Wildcard endpoint (`0.0.0.0`) on the given port; port zero asks
    /// the OS for an ephemeral port at bind time.
    #[must_use]
    pub const fn any(port: u16) -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED, port)
    }

    /// The IPv4 address.
    #[must_use]
    pub const fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// The port number.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn to_sock_addr(self) -> socket2::SockAddr {
        socket2::SockAddr::from(SocketAddrV4::new(self.addr, self.port))
    }

    pub(crate) fn from_sock_addr(addr: &socket2::SockAddr) -> Option<Self> {
        match addr.as_socket() {
            Some(SocketAddr::V4(v4)) => Some(Self::new(*v4.ip(), v4.port())),
            _ => None,
        }
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl From<Endpoint> for SocketAddrV4 {
    fn from(ep: Endpoint) -> Self {
        SocketAddrV4::new(ep.addr, ep.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}
