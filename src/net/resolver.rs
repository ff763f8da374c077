//! Name resolution interface.
//!
//! Resolution is an external collaborator of the runtime: the core
//! consumes the [`Resolver`] trait and ships [`SystemResolver`], a
//! blocking implementation over the platform resolver. Callers that
//! need asynchronous resolution run it through
//! [`run_on`](crate::exec::run_on) onto a context of their choosing.

use crate::error::{Error, ErrorKind, Result};
use crate::net::endpoint::Endpoint;
use std::net::{SocketAddr, ToSocketAddrs};

/// Resolves a host and service name to TCP endpoints.
pub trait Resolver: Send + Sync {
    /// Returns every IPv4 endpoint the pair resolves to.
    fn resolve(&self, host: &str, service: &str) -> Result<Vec<Endpoint>>;
}

/// [`Resolver`] backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str, service: &str) -> Result<Vec<Endpoint>> {
        let addrs = (host, parse_service(service)?)
            .to_socket_addrs()
            .map_err(Error::from)?;
        Ok(addrs
            .filter_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(Endpoint::from(v4)),
                SocketAddr::V6(_) => None,
            })
            .collect())
    }
}

fn parse_service(service: &str) -> Result<u16> {
    service
        .parse::<u16>()
        .map_err(|_| Error::new(ErrorKind::InvalidArgument).with_context("service must be a port"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn resolves_localhost() {
        let endpoints = SystemResolver
            .resolve("localhost", "80")
            .expect("resolve localhost");
        assert!(endpoints
            .iter()
            .any(|ep| ep.addr() == Ipv4Addr::LOCALHOST && ep.port() == 80));
    }

    #[test]
    fn rejects_non_numeric_service() {
        let err = SystemResolver
            .resolve("localhost", "http!")
            .expect_err("bad service");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn numeric_host_round_trips() {
        let endpoints = SystemResolver
            .resolve("127.0.0.1", "4242")
            .expect("resolve numeric");
        assert_eq!(endpoints, vec![Endpoint::loopback(4242)]);
    }
}
