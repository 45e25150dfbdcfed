//! Hook counters
//!
//! The kernel program keeps the same counters in a per-CPU array; both
//! renditions report through [`FilterStats`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the hook counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    /// Connection requests seen by the observer
    pub observed: u64,
    /// Requests that failed the port policy
    pub blocked: u64,
    /// Block decisions lost because the table was full (fail-open)
    pub table_full: u64,
    /// Established sockets forced closed
    pub enforced: u64,
    /// Decisions consumed after the handshake window expired
    pub stale: u64,
    /// Exported events dropped on a full queue
    pub export_dropped: u64,
    /// Sockets whose identity could not be read
    pub unreadable: u64,
    /// Connections outside the filter's scope (native IPv6)
    pub skipped: u64,
}

#[derive(Debug, Default)]
pub struct StatCounters {
    observed: AtomicU64,
    blocked: AtomicU64,
    table_full: AtomicU64,
    enforced: AtomicU64,
    stale: AtomicU64,
    export_dropped: AtomicU64,
    unreadable: AtomicU64,
    skipped: AtomicU64,
}

/// Counter slots, shared with the kernel program's STATS array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Stat {
    Observed = 0,
    Blocked = 1,
    TableFull = 2,
    Enforced = 3,
    Stale = 4,
    ExportDropped = 5,
    Unreadable = 6,
    Skipped = 7,
}

impl Stat {
    pub const ALL: [Stat; 8] = [
        Stat::Observed,
        Stat::Blocked,
        Stat::TableFull,
        Stat::Enforced,
        Stat::Stale,
        Stat::ExportDropped,
        Stat::Unreadable,
        Stat::Skipped,
    ];
}

impl StatCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self, stat: Stat) {
        self.counter(stat).fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FilterStats {
        let mut stats = FilterStats::default();
        for stat in Stat::ALL {
            stats.set(stat, self.counter(stat).load(Ordering::Relaxed));
        }
        stats
    }

    fn counter(&self, stat: Stat) -> &AtomicU64 {
        match stat {
            Stat::Observed => &self.observed,
            Stat::Blocked => &self.blocked,
            Stat::TableFull => &self.table_full,
            Stat::Enforced => &self.enforced,
            Stat::Stale => &self.stale,
            Stat::ExportDropped => &self.export_dropped,
            Stat::Unreadable => &self.unreadable,
            Stat::Skipped => &self.skipped,
        }
    }
}

impl FilterStats {
    pub fn get(&self, stat: Stat) -> u64 {
        match stat {
            Stat::Observed => self.observed,
            Stat::Blocked => self.blocked,
            Stat::TableFull => self.table_full,
            Stat::Enforced => self.enforced,
            Stat::Stale => self.stale,
            Stat::ExportDropped => self.export_dropped,
            Stat::Unreadable => self.unreadable,
            Stat::Skipped => self.skipped,
        }
    }

    pub fn set(&mut self, stat: Stat, value: u64) {
        let slot = match stat {
            Stat::Observed => &mut self.observed,
            Stat::Blocked => &mut self.blocked,
            Stat::TableFull => &mut self.table_full,
            Stat::Enforced => &mut self.enforced,
            Stat::Stale => &mut self.stale,
            Stat::ExportDropped => &mut self.export_dropped,
            Stat::Unreadable => &mut self.unreadable,
            Stat::Skipped => &mut self.skipped,
        };
        *slot = value;
    }
}
