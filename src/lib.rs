//! Synguard - eBPF connection admission filter
//!
//! Resets inbound IPv4 TCP connections whose ports fall outside the
//! HTTP/HTTPS allow-list. The decision is staged when the SYN is queued and
//! carried out once the handshake completes, before the application reads.
//!
//! # Modules
//!
//! - `filter` - observer/enforcer decision logic, connection table, exporter
//! - `ebpf` - kernel program loader, socket destroyer, metrics (loader requires `--features ebpf`)
//! - `supervisor` - attach/poll/shutdown lifecycle
//! - `config` - environment configuration
//! - `tracing` - logging and optional OpenTelemetry export
//!
//! # Quick Start
//!
//! ```ignore
//! use synguard::{FilterConfig, FilterManager, Supervisor, supervisor::shutdown_signal};
//!
//! let mut supervisor = Supervisor::new(FilterManager::new(), FilterConfig::from_env()?);
//! supervisor.attach()?;
//! supervisor.run_until(shutdown_signal()).await?;
//! ```

pub mod config;
pub mod ebpf;
pub mod filter;
pub mod supervisor;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use config::{ConfigError, FilterConfig};
pub use ebpf::{FilterError, FilterManager};
pub use filter::{ConnectionEnforcer, ConnectionIdentity, ConnectionObserver, ConnectionTable, PortPolicy};
pub use supervisor::{ProbeBackend, Supervisor, SupervisorError, SupervisorState};
