//! Connection admission logic
//!
//! This module holds the decision logic that the kernel program runs, written
//! against capability traits so it can be exercised with fake sockets:
//!
//! ```text
//!   SYN queued                                  handshake complete
//!       │                                              │
//!       ▼                                              ▼
//! ┌────────────────────┐                    ┌─────────────────────┐
//! │ ConnectionObserver │                    │ ConnectionEnforcer  │
//! │                    │                    │                     │
//! │ PortPolicy.blocks? │                    │ take(identity)      │
//! │   yes → insert ────┼──► ConnectionTable ┼──► found & fresh?   │
//! │   no  → nothing    │   (4-tuple → ts)   │     → force_close() │
//! └─────────┬──────────┘                    └─────────────────────┘
//!           │
//!           └──► EventExporter (optional, drop-on-full)
//! ```

pub mod enforcer;
pub mod export;
pub mod hooks;
pub mod identity;
pub mod observer;
pub mod policy;
pub mod stats;
pub mod table;

pub use enforcer::{ConnectionEnforcer, Enforcement, DEFAULT_HANDSHAKE_WINDOW};
pub use export::{EventExporter, EventFormat, ExportReceiver};
pub use hooks::{
    saturating_nanos, Clock, CloseError, EstablishedConnection, MonotonicClock, PendingConnection,
    SnapshotError,
};
pub use identity::{ConnectionIdentity, PolicyDecision, PortPair};
pub use observer::{ConnectionObserver, Observation};
pub use policy::{PortPolicy, DEFAULT_ALLOWED_PORTS};
pub use stats::{FilterStats, Stat, StatCounters};
pub use table::{ConnectionTable, InsertOutcome};
