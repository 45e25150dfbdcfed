//! Bounded, sharded decision table shared by the observer and the enforcer
//!
//! # Concurrency
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  ConnectionTable                                                 │
//! │                                                                  │
//! │  len: AtomicUsize ◄── slot reserved before insert (bounded)      │
//! │                                                                  │
//! │  shard 0   shard 1   shard 2   ...   shard N-1                   │
//! │  Mutex<>   Mutex<>   Mutex<>         Mutex<>                     │
//! │    ▲          ▲                                                  │
//! │    │          └── observer on CPU 3 inserting 10.0.0.1:22        │
//! │    └───────────── enforcer on CPU 0 taking 10.0.0.1:2222         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each lock covers a single shard and is held for one hash operation.
//! Unrelated connections land on different shards and never serialize on a
//! global lock.
//!
//! # Fail-open
//!
//! When `len == capacity`, `insert` drops the new decision and returns
//! [`InsertOutcome::Dropped`]. The caller is never blocked or failed; the
//! connection simply will not be enforced later.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::identity::{ConnectionIdentity, PolicyDecision};

/// Shards per available CPU
const SHARDS_PER_CPU: usize = 4;

/// Result of [`ConnectionTable::insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New entry stored
    Inserted,
    /// An entry for the same identity existed and was overwritten
    Replaced,
    /// Table full, decision discarded
    Dropped,
}

pub struct ConnectionTable {
    shards: Box<[Mutex<HashMap<ConnectionIdentity, PolicyDecision>>]>,
    hasher: RandomState,
    len: AtomicUsize,
    capacity: usize,
}

impl ConnectionTable {
    /// Create a table holding at most `capacity` decisions.
    pub fn new(capacity: usize) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_shards(capacity, cpus * SHARDS_PER_CPU)
    }

    /// Create a table with an explicit shard count (rounded up to a power of two).
    pub fn with_shards(capacity: usize, shards: usize) -> Self {
        let shards = shards.max(1).next_power_of_two();
        Self {
            shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
            len: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stage a decision. Last write wins for an identity already present.
    pub fn insert(&self, identity: ConnectionIdentity, decision: PolicyDecision) -> InsertOutcome {
        let mut shard = self.shard(&identity);

        if let Some(existing) = shard.get_mut(&identity) {
            *existing = decision;
            return InsertOutcome::Replaced;
        }

        if !self.reserve_slot() {
            return InsertOutcome::Dropped;
        }

        shard.insert(identity, decision);
        InsertOutcome::Inserted
    }

    /// Atomically look up and remove a decision. A second call for the same
    /// identity returns `None`.
    pub fn take(&self, identity: &ConnectionIdentity) -> Option<PolicyDecision> {
        let removed = self.shard(identity).remove(identity);
        if removed.is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Peek without consuming
    pub fn contains(&self, identity: &ConnectionIdentity) -> bool {
        self.shard(identity).contains_key(identity)
    }

    /// Evict every decision made before `cutoff_ns`. Returns how many were removed.
    ///
    /// This is the only path that reclaims decisions for handshakes that never
    /// completed; it runs under capacity pressure.
    pub fn evict_older_than(&self, cutoff_ns: u64) -> usize {
        let mut evicted = 0;
        for shard in self.shards.iter() {
            let mut shard = lock(shard);
            let before = shard.len();
            shard.retain(|_, decision| decision.timestamp_ns >= cutoff_ns);
            evicted += before - shard.len();
        }
        if evicted > 0 {
            self.len.fetch_sub(evicted, Ordering::AcqRel);
        }
        evicted
    }

    fn reserve_slot(&self) -> bool {
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                (len < self.capacity).then_some(len + 1)
            })
            .is_ok()
    }

    fn shard(&self, identity: &ConnectionIdentity) -> MutexGuard<'_, HashMap<ConnectionIdentity, PolicyDecision>> {
        let index = (self.hasher.hash_one(identity) as usize) & (self.shards.len() - 1);
        lock(&self.shards[index])
    }
}

/// A poisoned shard still holds consistent data: every critical section is a
/// single map operation.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
