//! Enforcer hook: runs when a connection request becomes an established socket
//!
//! ```text
//! established socket ──snapshot()──► identity ──take()──► decision?
//!                                                     │
//!                 none ◄──────────────────────────────┤
//!                 (no-op, connection proceeds)        │
//!                                                     ▼
//!                                     older than handshake window?
//!                                        yes → stale, leave socket
//!                                        no  → force_close()
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::hooks::{saturating_nanos, Clock, EstablishedConnection, MonotonicClock, SnapshotError};
use super::stats::{Stat, StatCounters};
use super::table::ConnectionTable;

/// Default window between a decision and the handshake completing.
/// Longer than the kernel's SYN-ACK retransmit budget (~63s).
pub const DEFAULT_HANDSHAKE_WINDOW: Duration = Duration::from_secs(75);

/// What the enforcer did with an established socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enforcement {
    /// No staged decision, connection proceeds
    NoEntry,
    /// Decision consumed and socket forced closed
    Closed,
    /// Decision consumed, but closing failed (socket left to the application)
    CloseFailed,
    /// Decision outlived the handshake window and belongs to an older request
    Stale,
    /// Identity could not be read
    Unreadable,
    /// Native IPv6 socket, outside the filter's scope
    Skipped,
}

pub struct ConnectionEnforcer<C: Clock = MonotonicClock> {
    table: Arc<ConnectionTable>,
    counters: Arc<StatCounters>,
    handshake_window_ns: u64,
    clock: C,
}

impl ConnectionEnforcer<MonotonicClock> {
    pub fn new(table: Arc<ConnectionTable>, counters: Arc<StatCounters>) -> Self {
        Self::with_clock(table, counters, MonotonicClock)
    }
}

impl<C: Clock> ConnectionEnforcer<C> {
    pub fn with_clock(table: Arc<ConnectionTable>, counters: Arc<StatCounters>, clock: C) -> Self {
        Self {
            table,
            counters,
            handshake_window_ns: saturating_nanos(DEFAULT_HANDSHAKE_WINDOW),
            clock,
        }
    }

    pub fn with_handshake_window(mut self, window: Duration) -> Self {
        self.handshake_window_ns = saturating_nanos(window);
        self
    }

    /// Consume the staged decision for `conn`, if any, and close it.
    pub fn on_established<E: EstablishedConnection>(&self, conn: &mut E) -> Enforcement {
        let identity = match conn.snapshot() {
            Ok(identity) => identity,
            Err(SnapshotError::Unsupported) => {
                self.counters.bump(Stat::Skipped);
                return Enforcement::Skipped;
            }
            Err(SnapshotError::Unreadable) => {
                self.counters.bump(Stat::Unreadable);
                return Enforcement::Unreadable;
            }
        };

        let decision = match self.table.take(&identity) {
            Some(decision) => decision,
            None => return Enforcement::NoEntry,
        };

        let age_ns = decision.age_ns(self.clock.now_ns());
        if age_ns > self.handshake_window_ns {
            self.counters.bump(Stat::Stale);
            warn!(%identity, age_ms = age_ns / 1_000_000, "discarding stale block decision");
            return Enforcement::Stale;
        }

        match conn.force_close() {
            Ok(()) => {
                self.counters.bump(Stat::Enforced);
                info!(%identity, "dropped blocked connection");
                Enforcement::Closed
            }
            Err(e) => {
                warn!(%identity, error = %e, "failed to close blocked connection");
                Enforcement::CloseFailed
            }
        }
    }
}
