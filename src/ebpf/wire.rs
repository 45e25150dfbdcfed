//! Kernel ↔ userspace record layouts
//!
//! Mirrors the `#[repr(C)]` structs in `ebpf-programs/src/conn_filter.rs`:
//!
//! ```text
//! BlockEvent (24 bytes)
//! ┌──────────────┬───────────────┬────────────┬─────────────┬──────┬──────────┐
//! │ local_addr   │ remote_addr   │ local_port │ remote_port │ _pad │ stamp_ns │
//! │ u32 (net)    │ u32 (net)     │ u16 (host) │ u16 (host)  │ u32  │ u64      │
//! │ 0            │ 4             │ 8          │ 10          │ 12   │ 16       │
//! └──────────────┴───────────────┴────────────┴─────────────┴──────┴──────────┘
//!  └────────────────── ConnKey (12 bytes) ─────────────────┘
//! ```

use crate::filter::{ConnectionIdentity, PolicyDecision};

/// Key of the BLOCKED_CONNECTIONS map
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnKey {
    pub local_addr: u32,
    pub remote_addr: u32,
    pub local_port: u16,
    pub remote_port: u16,
}

// Required for HashMap key
#[cfg(feature = "ebpf")]
unsafe impl aya::Pod for ConnKey {}

impl ConnKey {
    pub fn identity(&self) -> ConnectionIdentity {
        ConnectionIdentity::from_raw(
            self.local_addr,
            self.local_port,
            self.remote_addr,
            self.remote_port,
        )
    }
}

/// Record on BLOCK_EVENTS (export) and KILL_ORDERS (enforcement)
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockEvent {
    pub key: ConnKey,
    pub _pad: u32,
    pub stamp_ns: u64,
}

impl BlockEvent {
    /// Decode one record; `None` when the buffer is too short.
    pub fn read(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < std::mem::size_of::<BlockEvent>() {
            return None;
        }
        // SAFETY: length checked above; every bit pattern is a valid BlockEvent
        Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const BlockEvent) })
    }

    pub fn decision(&self) -> PolicyDecision {
        PolicyDecision::new(self.key.identity(), self.stamp_ns)
    }
}
