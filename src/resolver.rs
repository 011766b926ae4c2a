//! The upstream-connect resolver seam called for in spec.md §9: the
//! source resolves DNS with a single blocking call inline in the
//! handler. That stays true here (no async resolution strategy is in
//! scope, per spec.md §1), but it is kept behind a trait so a future
//! async resolver can be substituted without touching `Handler`.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

pub trait Resolver: Send + Sync {
    fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr>;
}

/// Blocking resolution via the platform's `getaddrinfo`, through
/// `std::net::ToSocketAddrs`. This is the "known blocking point"
/// spec.md §9 calls out: it stalls the single dispatch thread for the
/// duration of the lookup.
pub struct StdResolver;

impl Resolver for StdResolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr> {
        (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_loopback_literal() {
        let resolver = StdResolver;
        let addr = resolver.resolve("127.0.0.1", 80).unwrap();
        assert_eq!(addr.port(), 80);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn unresolvable_host_is_an_error() {
        let resolver = StdResolver;
        assert!(resolver
            .resolve("this.host.does.not.resolve.invalid", 80)
            .is_err());
    }
}
