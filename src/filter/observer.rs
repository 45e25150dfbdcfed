//! Observer hook: runs when a new inbound connection request is queued
//!
//! The observer only stages intent. It never changes the request's progress;
//! the enforcer is the sole point that terminates traffic.

use std::sync::Arc;

use tracing::{debug, trace};

use super::export::EventExporter;
use super::hooks::{Clock, MonotonicClock, PendingConnection, SnapshotError};
use super::identity::PolicyDecision;
use super::policy::PortPolicy;
use super::stats::{Stat, StatCounters};
use super::table::{ConnectionTable, InsertOutcome};

/// What the observer did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// One of the ports is allowed, nothing recorded
    Allowed,
    /// Policy failed; `recorded` is false when the table was full
    Blocked { recorded: bool },
    /// Identity could not be read, request left alone
    Unreadable,
    /// Native IPv6 request, outside the filter's scope
    Skipped,
}

pub struct ConnectionObserver<C: Clock = MonotonicClock> {
    policy: PortPolicy,
    table: Arc<ConnectionTable>,
    counters: Arc<StatCounters>,
    exporter: Option<Arc<EventExporter>>,
    clock: C,
}

impl ConnectionObserver<MonotonicClock> {
    pub fn new(policy: PortPolicy, table: Arc<ConnectionTable>, counters: Arc<StatCounters>) -> Self {
        Self::with_clock(policy, table, counters, MonotonicClock)
    }
}

impl<C: Clock> ConnectionObserver<C> {
    pub fn with_clock(
        policy: PortPolicy,
        table: Arc<ConnectionTable>,
        counters: Arc<StatCounters>,
        clock: C,
    ) -> Self {
        Self {
            policy,
            table,
            counters,
            exporter: None,
            clock,
        }
    }

    /// Mirror every block decision to `exporter`
    pub fn with_exporter(mut self, exporter: Arc<EventExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn policy(&self) -> &PortPolicy {
        &self.policy
    }

    /// Evaluate a freshly queued request.
    pub fn on_request_queued<P: PendingConnection>(&self, pending: &P) -> Observation {
        self.counters.bump(Stat::Observed);

        let identity = match pending.snapshot() {
            Ok(identity) => identity,
            Err(SnapshotError::Unsupported) => {
                self.counters.bump(Stat::Skipped);
                return Observation::Skipped;
            }
            Err(SnapshotError::Unreadable) => {
                self.counters.bump(Stat::Unreadable);
                return Observation::Unreadable;
            }
        };

        if !self.policy.blocks(identity.ports()) {
            trace!(%identity, "connection request allowed");
            return Observation::Allowed;
        }

        self.counters.bump(Stat::Blocked);
        let decision = PolicyDecision::new(identity, self.clock.now_ns());

        let recorded = match self.table.insert(identity, decision) {
            InsertOutcome::Inserted | InsertOutcome::Replaced => true,
            InsertOutcome::Dropped => {
                self.counters.bump(Stat::TableFull);
                false
            }
        };

        if let Some(exporter) = &self.exporter {
            if !exporter.push(decision) {
                self.counters.bump(Stat::ExportDropped);
            }
        }

        debug!(
            %identity,
            local_port = identity.local.port(),
            remote_port = identity.remote.port(),
            recorded,
            "blocking connection"
        );

        Observation::Blocked { recorded }
    }
}
