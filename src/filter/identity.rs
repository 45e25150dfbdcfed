//! Connection identity and block decisions
//!
//! The table that joins the two hooks is keyed on the IPv4 4-tuple of the
//! connection, never on a kernel object address. The tuple is the same on
//! the pending request and on the established child, and TCP allows only one
//! pending request per tuple, so two live requests cannot collide.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use serde::Serialize;

/// Local and remote port of a connection, in host byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub local: u16,
    pub remote: u16,
}

/// Identity of one connection-request lifecycle (request queued → established or dropped)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionIdentity {
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
}

impl ConnectionIdentity {
    pub fn new(local: SocketAddrV4, remote: SocketAddrV4) -> Self {
        Self { local, remote }
    }

    pub fn ports(&self) -> PortPair {
        PortPair {
            local: self.local.port(),
            remote: self.remote.port(),
        }
    }

    /// Build from socket addresses as a socket reports them.
    ///
    /// IPv4 traffic accepted on a dual-stack (`AF_INET6`) listener shows up
    /// with `::ffff:a.b.c.d` addresses; those fold back to IPv4. Returns
    /// `None` for native IPv6 or mixed pairs.
    pub fn from_socket_addrs(local: SocketAddr, remote: SocketAddr) -> Option<Self> {
        Some(Self {
            local: fold_v4(local)?,
            remote: fold_v4(remote)?,
        })
    }

    /// Build from the raw words the kernel probes read out of `sock_common`.
    ///
    /// Addresses are network-order words exactly as stored in memory, so the
    /// native byte representation is the dotted-quad order.
    pub fn from_raw(local_addr: u32, local_port: u16, remote_addr: u32, remote_port: u16) -> Self {
        Self {
            local: SocketAddrV4::new(Ipv4Addr::from(local_addr.to_ne_bytes()), local_port),
            remote: SocketAddrV4::new(Ipv4Addr::from(remote_addr.to_ne_bytes()), remote_port),
        }
    }

    /// Inverse of [`from_raw`](Self::from_raw): `(local_addr, local_port, remote_addr, remote_port)`
    pub fn to_raw(&self) -> (u32, u16, u32, u16) {
        (
            u32::from_ne_bytes(self.local.ip().octets()),
            self.local.port(),
            u32::from_ne_bytes(self.remote.ip().octets()),
            self.remote.port(),
        )
    }
}

fn fold_v4(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(v6) => v6
            .ip()
            .to_ipv4_mapped()
            .map(|ip| SocketAddrV4::new(ip, v6.port())),
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- {}", self.local, self.remote)
    }
}

/// A staged block decision: produced once by the observer for each request
/// that fails the port policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PolicyDecision {
    pub identity: ConnectionIdentity,
    /// Monotonic timestamp (nanoseconds since boot) when the decision was made
    pub timestamp_ns: u64,
}

impl PolicyDecision {
    pub fn new(identity: ConnectionIdentity, timestamp_ns: u64) -> Self {
        Self {
            identity,
            timestamp_ns,
        }
    }

    /// Age of the decision at `now_ns`. Clock skew never yields a negative age.
    pub fn age_ns(&self, now_ns: u64) -> u64 {
        now_ns.saturating_sub(self.timestamp_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_round_trip_keeps_dotted_order() {
        let id = ConnectionIdentity::new(
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 22),
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 7), 51000),
        );

        let (la, lp, ra, rp) = id.to_raw();
        assert_eq!(la.to_ne_bytes(), [10, 0, 0, 1]);
        assert_eq!(ConnectionIdentity::from_raw(la, lp, ra, rp), id);
    }

    #[test]
    fn test_v4_mapped_addresses_fold_to_ipv4() {
        let local: SocketAddr = "[::ffff:10.0.0.1]:2222".parse().unwrap();
        let remote: SocketAddr = "[::ffff:192.168.1.7]:51000".parse().unwrap();

        let id = ConnectionIdentity::from_socket_addrs(local, remote).unwrap();
        assert_eq!(id.to_string(), "10.0.0.1:2222 <- 192.168.1.7:51000");

        let native: SocketAddr = "[2001:db8::1]:51000".parse().unwrap();
        assert!(ConnectionIdentity::from_socket_addrs(local, native).is_none());
    }

    #[test]
    fn test_display() {
        let id = ConnectionIdentity::new(
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 22),
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 7), 51000),
        );
        assert_eq!(id.to_string(), "10.0.0.1:22 <- 192.168.1.7:51000");
    }

    #[test]
    fn test_age_saturates() {
        let id = ConnectionIdentity::new(
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 22),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 40000),
        );
        let decision = PolicyDecision::new(id, 1_000);
        assert_eq!(decision.age_ns(1_500), 500);
        assert_eq!(decision.age_ns(10), 0);
    }
}
