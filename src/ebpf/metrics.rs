//! Prometheus metrics for the connection filter
//!
//! The kernel keeps running totals in its per-CPU STATS array. Each
//! supervisor tick copies the totals into these metrics, so they are gauges
//! that only ever grow rather than counters incremented here.

use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_int_counter, register_int_counter_vec, register_int_gauge_vec,
    Encoder, Gauge, IntCounter, IntCounterVec, IntGaugeVec, TextEncoder,
};

use crate::filter::{FilterStats, Stat};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Hook Counters
    // ─────────────────────────────────────────────────────────────────────────────

    /// Hook counter totals as last read from the kernel.
    ///
    /// Labels:
    /// - counter: observed, blocked, table_full, enforced, stale,
    ///   export_dropped, unreadable, skipped
    pub static ref FILTER_EVENTS: IntGaugeVec = register_int_gauge_vec!(
        "synguard_filter_events_total",
        "Connection filter hook counters, as reported by the kernel",
        &["counter"]
    ).expect("failed to register FILTER_EVENTS metric");

    /// Sockets userspace failed to destroy after a kill order.
    ///
    /// Labels:
    /// - reason: not_found, not_permitted, io
    pub static ref DESTROY_FAILURES: IntCounterVec = register_int_counter_vec!(
        "synguard_destroy_failures_total",
        "Kill orders that could not be turned into a socket reset",
        &["reason"]
    ).expect("failed to register DESTROY_FAILURES metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Table Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Staged block decisions currently held in the table.
    pub static ref TABLE_ENTRIES: Gauge = register_gauge!(
        "synguard_table_entries",
        "Block decisions currently staged in the connection table"
    ).expect("failed to register TABLE_ENTRIES metric");

    /// Stale decisions evicted under capacity pressure.
    pub static ref TABLE_EVICTIONS: IntCounter = register_int_counter!(
        "synguard_table_evictions_total",
        "Stale block decisions evicted under capacity pressure"
    ).expect("failed to register TABLE_EVICTIONS metric");

    /// Whether the filter hooks are attached (1) or not (0).
    pub static ref FILTER_ATTACHED: Gauge = register_gauge!(
        "synguard_filter_attached",
        "Whether the connection filter hooks are attached (1) or detached (0)"
    ).expect("failed to register FILTER_ATTACHED metric");
}

/// Initialize metrics with default values.
///
/// Called during startup to ensure metrics exist in the registry.
pub fn init() {
    FILTER_ATTACHED.set(0.0);
    TABLE_ENTRIES.set(0.0);
    for stat in Stat::ALL {
        FILTER_EVENTS.with_label_values(&[stat_label(stat)]).set(0);
    }
}

/// Mark hooks attached or detached.
pub fn set_attached(attached: bool) {
    FILTER_ATTACHED.set(if attached { 1.0 } else { 0.0 });
}

/// Copy a counter snapshot into the registry.
pub fn record_stats(stats: &FilterStats) {
    for stat in Stat::ALL {
        FILTER_EVENTS
            .with_label_values(&[stat_label(stat)])
            .set(stats.get(stat) as i64);
    }
}

pub fn set_table_entries(count: usize) {
    TABLE_ENTRIES.set(count as f64);
}

pub fn add_evictions(count: usize) {
    TABLE_EVICTIONS.inc_by(count as u64);
}

pub fn record_destroy_failure(reason: &str) {
    DESTROY_FAILURES.with_label_values(&[reason]).inc();
}

/// Render the registry in the Prometheus text format.
pub fn gather_text() -> String {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&prometheus::gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

pub fn stat_label(stat: Stat) -> &'static str {
    match stat {
        Stat::Observed => "observed",
        Stat::Blocked => "blocked",
        Stat::TableFull => "table_full",
        Stat::Enforced => "enforced",
        Stat::Stale => "stale",
        Stat::ExportDropped => "export_dropped",
        Stat::Unreadable => "unreadable",
        Stat::Skipped => "skipped",
    }
}
