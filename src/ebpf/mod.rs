//! Kernel side of the connection filter
//!
//! Loads `conn-filter.o` and wires its two probes into the TCP accept path:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Kernel Space (eBPF programs)                               │
//! │                                                             │
//! │  kprobe/inet_csk_reqsk_queue_hash_add  (observe_request)    │
//! │         │ neither port in {80, 443}?                        │
//! │         ▼                                                   │
//! │  BLOCKED_CONNECTIONS map  (4-tuple → decision ts)           │
//! │         │                                                   │
//! │         ▼                                                   │
//! │  kretprobe/tcp_v4_syn_recv_sock  (enforce_established)      │
//! │         │ entry found & fresh → delete, emit kill order     │
//! │         ▼                                                   │
//! │  KILL_ORDERS perf array        BLOCK_EVENTS ring buffer     │
//! └─────────┼───────────────────────────────┼───────────────────┘
//!           │                               │ (export enabled)
//!           ▼                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  User Space (FilterManager)                                 │
//! │                                                             │
//! │  kill-order thread → SOCK_DESTROY (RST)                     │
//! │  drain_events()       → one line per blocked connection     │
//! │  stats()              → STATS per-CPU counters → Prometheus │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Requirements
//!
//! - Linux kernel 5.8+ with CONFIG_BPF_SYSCALL=y and CONFIG_INET_DIAG_DESTROY=y
//! - CAP_BPF, CAP_PERFMON and CAP_NET_ADMIN (or root)
//! - Pre-built eBPF program in target/ebpf/ (run build-ebpf.sh)
//! - Compiled with `--features ebpf`

pub mod destroy;
#[cfg(feature = "ebpf")]
mod loader;
pub mod metrics;
pub mod preflight;
pub mod wire;

use std::fmt;

#[cfg(feature = "ebpf")]
pub use loader::FilterManager;

/// Error type for kernel-side filter operations
#[derive(Debug)]
pub enum FilterError {
    /// Failed to load the eBPF object or a program in it
    LoadError(String),
    /// Kernel refused to attach a probe
    AttachError(String),
    /// Failed to access a BPF map
    MapError(String),
    /// Failed to detach a probe
    DetachError(String),
    /// Process lacks the privileges to load and attach the filter
    Preflight(String),
    /// eBPF support not compiled in
    NotEnabled,
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::LoadError(msg) => write!(f, "eBPF load error: {}", msg),
            FilterError::AttachError(msg) => write!(f, "eBPF attach error: {}", msg),
            FilterError::MapError(msg) => write!(f, "eBPF map error: {}", msg),
            FilterError::DetachError(msg) => write!(f, "eBPF detach error: {}", msg),
            FilterError::Preflight(msg) => write!(f, "preflight check failed: {}", msg),
            FilterError::NotEnabled => {
                write!(f, "eBPF support not compiled in (rebuild with --features ebpf)")
            }
        }
    }
}

impl std::error::Error for FilterError {}

/// Stub FilterManager for when eBPF feature is disabled.
///
/// Every attach fails, so the supervisor exits before reaching `Attached`.
#[cfg(not(feature = "ebpf"))]
#[derive(Debug, Default)]
pub struct FilterManager;

#[cfg(not(feature = "ebpf"))]
impl FilterManager {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(feature = "ebpf"))]
impl crate::supervisor::ProbeBackend for FilterManager {
    fn attach(&mut self, _config: &crate::config::FilterConfig) -> Result<(), FilterError> {
        Err(FilterError::NotEnabled)
    }

    fn drain_events(&mut self) -> Vec<crate::filter::PolicyDecision> {
        Vec::new()
    }

    fn stats(&self) -> Result<crate::filter::FilterStats, FilterError> {
        Err(FilterError::NotEnabled)
    }

    fn table_len(&self) -> Result<usize, FilterError> {
        Err(FilterError::NotEnabled)
    }

    fn evict_older_than(&mut self, _cutoff_ns: u64) -> Result<usize, FilterError> {
        Err(FilterError::NotEnabled)
    }

    fn detach(&mut self) -> Result<(), FilterError> {
        Ok(())
    }

    fn release(&mut self) {}
}
