//! Capability contracts for the two interception points
//!
//! The observer and enforcer never touch kernel memory layouts directly.
//! They are handed objects that can produce a race-safe snapshot of the
//! connection identity and, for established sockets, force the socket closed.
//! The kernel program implements the same contract with `sock_common` reads
//! and kill orders; tests implement it with plain structs.

use std::fmt;
use std::time::Duration;

use super::identity::ConnectionIdentity;

/// Why a connection produced no identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotError {
    /// Not IPv4 and not a v4-mapped IPv6 socket; outside the filter's scope
    Unsupported,
    /// Socket memory could not be read
    Unreadable,
}

/// A connection request that has just been queued on a listener.
pub trait PendingConnection {
    /// Snapshot of the request's 4-tuple. IPv4 traffic on a dual-stack
    /// listener carries v4-mapped addresses and must snapshot as IPv4.
    fn snapshot(&self) -> Result<ConnectionIdentity, SnapshotError>;
}

/// A connection whose handshake has completed.
pub trait EstablishedConnection {
    /// Snapshot of the socket's 4-tuple, with the same rules as
    /// [`PendingConnection::snapshot`].
    fn snapshot(&self) -> Result<ConnectionIdentity, SnapshotError>;

    /// Move the socket to the closed state, resetting the peer.
    fn force_close(&mut self) -> Result<(), CloseError>;
}

/// Monotonic time source, in nanoseconds since boot.
pub trait Clock {
    fn now_ns(&self) -> u64;
}

/// `CLOCK_MONOTONIC`, the same clock `bpf_ktime_get_ns` reads, so userspace
/// cutoffs are comparable with kernel decision timestamps.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        match nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => (ts.tv_sec() as u64) * 1_000_000_000 + ts.tv_nsec() as u64,
            Err(_) => 0,
        }
    }
}

/// Nanoseconds in `d`, saturating at `u64::MAX` (about 584 years).
pub fn saturating_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Error returned when a socket cannot be forced closed
#[derive(Debug)]
pub enum CloseError {
    /// The socket is already gone
    NotFound,
    /// Missing CAP_NET_ADMIN or the kernel lacks INET_DIAG_DESTROY
    NotPermitted(String),
    /// Any other failure talking to the kernel
    Io(std::io::Error),
}

impl fmt::Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseError::NotFound => write!(f, "socket not found"),
            CloseError::NotPermitted(msg) => write!(f, "socket destroy not permitted: {}", msg),
            CloseError::Io(e) => write!(f, "socket destroy failed: {}", e),
        }
    }
}

impl std::error::Error for CloseError {}

impl From<std::io::Error> for CloseError {
    fn from(e: std::io::Error) -> Self {
        CloseError::Io(e)
    }
}
