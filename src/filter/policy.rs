//! Port allow-list for connection admission
//!
//! This module defines which ports let an inbound TCP connection through.
//! The kernel program bakes the same set in; keep them in step.

use super::identity::PortPair;

/// Default allowed ports: HTTP and HTTPS.
pub const DEFAULT_ALLOWED_PORTS: &[u16] = &[80, 443];

/// Immutable port allow-list.
///
/// A connection is blocked only when **neither** its local nor its remote
/// port is allowed. Either end matching is enough to let it through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortPolicy {
    allowed: Vec<u16>,
}

impl Default for PortPolicy {
    fn default() -> Self {
        Self::with_ports(DEFAULT_ALLOWED_PORTS)
    }
}

impl PortPolicy {
    /// Create the default HTTP/HTTPS policy
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a policy allowing exactly `ports`
    pub fn with_ports(ports: &[u16]) -> Self {
        let mut allowed = ports.to_vec();
        allowed.sort_unstable();
        allowed.dedup();
        Self { allowed }
    }

    /// Check a single port
    pub fn allows(&self, port: u16) -> bool {
        self.allowed.binary_search(&port).is_ok()
    }

    /// Check whether a connection with these ports must be blocked
    pub fn blocks(&self, ports: PortPair) -> bool {
        !self.allows(ports.local) && !self.allows(ports.remote)
    }

    /// Allowed ports, sorted
    pub fn ports(&self) -> &[u16] {
        &self.allowed
    }
}
