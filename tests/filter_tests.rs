//! Integration tests for the connection filter
//!
//! Drives the observer and enforcer with fake connection objects, the same
//! way the kernel probes drive them with `sock_common` snapshots.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use synguard::filter::export::{self, format_event};
use synguard::filter::{
    Clock, CloseError, ConnectionEnforcer, ConnectionIdentity, ConnectionObserver,
    ConnectionTable, Enforcement, EstablishedConnection, EventFormat, Observation,
    PendingConnection, PortPolicy, SnapshotError, StatCounters,
};

// ─────────────────────────────────────────────────────────────────────────────
// Fakes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct FakeClock(Arc<AtomicU64>);

impl FakeClock {
    fn at(ns: u64) -> Self {
        Self(Arc::new(AtomicU64::new(ns)))
    }

    fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_ns(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

struct FakeRequest(Result<ConnectionIdentity, SnapshotError>);

impl FakeRequest {
    fn ok(identity: ConnectionIdentity) -> Self {
        Self(Ok(identity))
    }
}

impl PendingConnection for FakeRequest {
    fn snapshot(&self) -> Result<ConnectionIdentity, SnapshotError> {
        self.0
    }
}

struct FakeSocket {
    identity: Result<ConnectionIdentity, SnapshotError>,
    closed: bool,
    refuse_close: bool,
}

impl FakeSocket {
    fn new(identity: ConnectionIdentity) -> Self {
        Self::with_snapshot(Ok(identity))
    }

    fn with_snapshot(identity: Result<ConnectionIdentity, SnapshotError>) -> Self {
        Self {
            identity,
            closed: false,
            refuse_close: false,
        }
    }
}

impl EstablishedConnection for FakeSocket {
    fn snapshot(&self) -> Result<ConnectionIdentity, SnapshotError> {
        self.identity
    }

    fn force_close(&mut self) -> Result<(), CloseError> {
        if self.refuse_close {
            return Err(CloseError::NotFound);
        }
        self.closed = true;
        Ok(())
    }
}

/// Snapshot of a socket on a dual-stack listener, as the kernel reads it
fn dual_stack(local: &str, remote: &str) -> Result<ConnectionIdentity, SnapshotError> {
    let local: SocketAddr = local.parse().unwrap();
    let remote: SocketAddr = remote.parse().unwrap();
    ConnectionIdentity::from_socket_addrs(local, remote).ok_or(SnapshotError::Unsupported)
}

fn conn(local_port: u16, remote_port: u16) -> ConnectionIdentity {
    ConnectionIdentity::new(
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), local_port),
        SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 5), remote_port),
    )
}

struct Harness {
    table: Arc<ConnectionTable>,
    counters: Arc<StatCounters>,
    clock: FakeClock,
    observer: ConnectionObserver<FakeClock>,
    enforcer: ConnectionEnforcer<FakeClock>,
}

fn harness(capacity: usize) -> Harness {
    let table = Arc::new(ConnectionTable::new(capacity));
    let counters = Arc::new(StatCounters::new());
    let clock = FakeClock::at(1_000_000_000);
    let observer = ConnectionObserver::with_clock(
        PortPolicy::default(),
        Arc::clone(&table),
        Arc::clone(&counters),
        clock.clone(),
    );
    let enforcer =
        ConnectionEnforcer::with_clock(Arc::clone(&table), Arc::clone(&counters), clock.clone());
    Harness {
        table,
        counters,
        clock,
        observer,
        enforcer,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

/// Request to port 22 is recorded and its socket closed on establishment
#[test]
fn test_blocked_port_is_closed() {
    let h = harness(64);
    let identity = conn(22, 51000);

    let observed = h.observer.on_request_queued(&FakeRequest::ok(identity));
    assert_eq!(observed, Observation::Blocked { recorded: true });
    assert!(h.table.contains(&identity));

    let mut socket = FakeSocket::new(identity);
    assert_eq!(h.enforcer.on_established(&mut socket), Enforcement::Closed);
    assert!(socket.closed);
    assert!(h.table.is_empty());

    let stats = h.counters.snapshot();
    assert_eq!(stats.observed, 1);
    assert_eq!(stats.blocked, 1);
    assert_eq!(stats.enforced, 1);
}

/// Request to port 443 leaves no trace and proceeds
#[test]
fn test_https_request_proceeds() {
    let h = harness(64);
    let identity = conn(443, 51000);

    assert_eq!(
        h.observer.on_request_queued(&FakeRequest::ok(identity)),
        Observation::Allowed
    );
    assert!(h.table.is_empty());

    let mut socket = FakeSocket::new(identity);
    assert_eq!(h.enforcer.on_established(&mut socket), Enforcement::NoEntry);
    assert!(!socket.closed);
}

/// Two simultaneous requests to port 22 keep independent entries
#[test]
fn test_concurrent_requests_do_not_interfere() {
    let h = harness(64);
    let first = conn(22, 51000);
    let second = conn(22, 51001);

    h.observer.on_request_queued(&FakeRequest::ok(first));
    h.observer.on_request_queued(&FakeRequest::ok(second));
    assert_eq!(h.table.len(), 2);

    let mut first_socket = FakeSocket::new(first);
    assert_eq!(h.enforcer.on_established(&mut first_socket), Enforcement::Closed);

    assert!(h.table.contains(&second));
    assert!(!h.table.contains(&first));

    let mut second_socket = FakeSocket::new(second);
    assert_eq!(h.enforcer.on_established(&mut second_socket), Enforcement::Closed);
    assert!(first_socket.closed && second_socket.closed);
}

/// Enforcer with no prior decision has no side effects
#[test]
fn test_enforcer_without_decision_is_noop() {
    let h = harness(64);
    let mut socket = FakeSocket::new(conn(8080, 40000));

    assert_eq!(h.enforcer.on_established(&mut socket), Enforcement::NoEntry);
    assert!(!socket.closed);
    assert_eq!(h.counters.snapshot().enforced, 0);
    assert!(h.table.is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Policy properties
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_either_allowed_port_means_allowed() {
    let h = harness(1024);
    let ports = [22u16, 80, 443, 8080, 51000, 65535];

    for &local in &ports {
        for &remote in &ports {
            let identity = conn(local, remote);
            let observed = h.observer.on_request_queued(&FakeRequest::ok(identity));
            let allowed_side = [80, 443].contains(&local) || [80, 443].contains(&remote);

            if allowed_side {
                assert_eq!(observed, Observation::Allowed, "{}", identity);
                assert!(!h.table.contains(&identity));
            } else {
                assert_eq!(observed, Observation::Blocked { recorded: true }, "{}", identity);
                let mut socket = FakeSocket::new(identity);
                assert_eq!(h.enforcer.on_established(&mut socket), Enforcement::Closed);
                assert!(!h.table.contains(&identity));
            }
        }
    }
    assert!(h.table.is_empty());
}

#[test]
fn test_decision_consumed_once() {
    let h = harness(64);
    let identity = conn(22, 51000);
    h.observer.on_request_queued(&FakeRequest::ok(identity));

    assert!(h.table.take(&identity).is_some());
    assert!(h.table.take(&identity).is_none());

    let mut socket = FakeSocket::new(identity);
    assert_eq!(h.enforcer.on_established(&mut socket), Enforcement::NoEntry);
}

/// Full table drops the decision and the connection is let through
#[test]
fn test_full_table_fails_open() {
    let h = harness(1);
    let kept = conn(22, 51000);
    let dropped = conn(22, 51001);

    assert_eq!(
        h.observer.on_request_queued(&FakeRequest::ok(kept)),
        Observation::Blocked { recorded: true }
    );
    assert_eq!(
        h.observer.on_request_queued(&FakeRequest::ok(dropped)),
        Observation::Blocked { recorded: false }
    );
    assert_eq!(h.counters.snapshot().table_full, 1);

    let mut socket = FakeSocket::new(dropped);
    assert_eq!(h.enforcer.on_established(&mut socket), Enforcement::NoEntry);
    assert!(!socket.closed);
}

#[test]
fn test_unreadable_identities_are_left_alone() {
    let h = harness(64);

    assert_eq!(
        h.observer.on_request_queued(&FakeRequest(Err(SnapshotError::Unreadable))),
        Observation::Unreadable
    );
    let mut socket = FakeSocket::with_snapshot(Err(SnapshotError::Unreadable));
    assert_eq!(h.enforcer.on_established(&mut socket), Enforcement::Unreadable);
    assert!(!socket.closed);
    assert_eq!(h.counters.snapshot().unreadable, 2);
}

/// IPv4 client on an AF_INET6 listener is filtered like any other
#[test]
fn test_v4_mapped_connection_is_closed() {
    let h = harness(64);
    let snapshot = dual_stack("[::ffff:10.0.0.1]:2222", "[::ffff:192.168.1.7]:51000");

    let observed = h.observer.on_request_queued(&FakeRequest(snapshot));
    assert_eq!(observed, Observation::Blocked { recorded: true });

    let mut socket = FakeSocket::with_snapshot(snapshot);
    assert_eq!(h.enforcer.on_established(&mut socket), Enforcement::Closed);
    assert!(socket.closed);

    let stats = h.counters.snapshot();
    assert_eq!(stats.enforced, 1);
    assert_eq!(stats.skipped, 0);
}

/// Mapped and plain IPv4 snapshots of one connection share a table key
#[test]
fn test_v4_mapped_matches_plain_ipv4() {
    let h = harness(64);
    let mapped = dual_stack("[::ffff:10.0.0.1]:22", "[::ffff:203.0.113.5]:51000");
    h.observer.on_request_queued(&FakeRequest(mapped));

    let mut socket = FakeSocket::new(conn(22, 51000));
    assert_eq!(h.enforcer.on_established(&mut socket), Enforcement::Closed);
}

/// Native IPv6 is out of scope: counted as skipped, never as unreadable
#[test]
fn test_native_ipv6_is_skipped() {
    let h = harness(64);
    let snapshot = dual_stack("[2001:db8::1]:22", "[2001:db8::7]:51000");

    assert_eq!(
        h.observer.on_request_queued(&FakeRequest(snapshot)),
        Observation::Skipped
    );
    let mut socket = FakeSocket::with_snapshot(snapshot);
    assert_eq!(h.enforcer.on_established(&mut socket), Enforcement::Skipped);
    assert!(!socket.closed);

    let stats = h.counters.snapshot();
    assert_eq!(stats.skipped, 2);
    assert_eq!(stats.unreadable, 0);
    assert_eq!(stats.blocked, 0);
    assert!(h.table.is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Freshness
// ─────────────────────────────────────────────────────────────────────────────

/// A decision older than the handshake window belongs to a previous request
#[test]
fn test_stale_decision_consumed_without_close() {
    let h = harness(64);
    let identity = conn(22, 51000);
    h.observer.on_request_queued(&FakeRequest::ok(identity));

    h.clock.advance(Duration::from_secs(120));

    let mut socket = FakeSocket::new(identity);
    assert_eq!(h.enforcer.on_established(&mut socket), Enforcement::Stale);
    assert!(!socket.closed);
    assert!(h.table.is_empty());
    assert_eq!(h.counters.snapshot().stale, 1);
}

#[test]
fn test_custom_handshake_window() {
    let h = harness(64);
    let enforcer = ConnectionEnforcer::with_clock(
        Arc::clone(&h.table),
        Arc::clone(&h.counters),
        h.clock.clone(),
    )
    .with_handshake_window(Duration::from_secs(5));

    let identity = conn(22, 51000);
    h.observer.on_request_queued(&FakeRequest::ok(identity));
    h.clock.advance(Duration::from_secs(4));

    let mut socket = FakeSocket::new(identity);
    assert_eq!(enforcer.on_established(&mut socket), Enforcement::Closed);
}

#[test]
fn test_capacity_eviction_keeps_fresh_entries() {
    let h = harness(64);
    let old = conn(22, 51000);
    h.observer.on_request_queued(&FakeRequest::ok(old));

    h.clock.advance(Duration::from_secs(100));
    let fresh = conn(22, 51001);
    h.observer.on_request_queued(&FakeRequest::ok(fresh));

    let cutoff = h.clock.now_ns() - Duration::from_secs(75).as_nanos() as u64;
    assert_eq!(h.table.evict_older_than(cutoff), 1);
    assert!(!h.table.contains(&old));
    assert!(h.table.contains(&fresh));
}

#[test]
fn test_failed_close_still_consumes_decision() {
    let h = harness(64);
    let identity = conn(22, 51000);
    h.observer.on_request_queued(&FakeRequest::ok(identity));

    let mut socket = FakeSocket::new(identity);
    socket.refuse_close = true;
    assert_eq!(h.enforcer.on_established(&mut socket), Enforcement::CloseFailed);
    assert!(h.table.is_empty());
    assert_eq!(h.counters.snapshot().enforced, 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Concurrency
// ─────────────────────────────────────────────────────────────────────────────

/// Many CPUs observing and enforcing distinct connections at once
#[test]
fn test_parallel_observe_and_enforce() {
    let h = harness(4096);
    let observer = Arc::new(h.observer);
    let enforcer = Arc::new(h.enforcer);

    let workers: Vec<_> = (0..8u16)
        .map(|worker| {
            let observer = Arc::clone(&observer);
            let enforcer = Arc::clone(&enforcer);
            thread::spawn(move || {
                let mut closed = 0;
                for i in 0..200u16 {
                    let identity = conn(22, 10000 + worker * 1000 + i);
                    observer.on_request_queued(&FakeRequest::ok(identity));
                    let mut socket = FakeSocket::new(identity);
                    if enforcer.on_established(&mut socket) == Enforcement::Closed {
                        closed += 1;
                    }
                }
                closed
            })
        })
        .collect();

    let closed: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
    assert_eq!(closed, 1600);
    assert!(h.table.is_empty());
    assert_eq!(h.counters.snapshot().enforced, 1600);
}

/// Two enforcers racing for one decision: exactly one wins
#[test]
fn test_racing_enforcers_close_once() {
    for _ in 0..50 {
        let h = harness(64);
        let identity = conn(22, 51000);
        h.observer.on_request_queued(&FakeRequest::ok(identity));
        let enforcer = Arc::new(h.enforcer);

        let racers: Vec<_> = (0..4)
            .map(|_| {
                let enforcer = Arc::clone(&enforcer);
                thread::spawn(move || {
                    let mut socket = FakeSocket::new(identity);
                    enforcer.on_established(&mut socket)
                })
            })
            .collect();

        let wins = racers
            .into_iter()
            .map(|r| r.join().unwrap())
            .filter(|e| *e == Enforcement::Closed)
            .count();
        assert_eq!(wins, 1);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Export
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_exporter_mirrors_block_decisions() {
    let h = harness(64);
    let (exporter, mut receiver) = export::channel(16);
    let observer = ConnectionObserver::with_clock(
        PortPolicy::default(),
        Arc::clone(&h.table),
        Arc::clone(&h.counters),
        h.clock.clone(),
    )
    .with_exporter(Arc::new(exporter));

    observer.on_request_queued(&FakeRequest::ok(conn(22, 51000)));
    observer.on_request_queued(&FakeRequest::ok(conn(443, 51001)));
    observer.on_request_queued(&FakeRequest::ok(conn(3306, 51002)));

    let events = receiver.drain();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].identity, conn(22, 51000));
    assert_eq!(events[1].identity, conn(3306, 51002));

    let line = format_event(&events[0], EventFormat::Text);
    assert!(line.starts_with("Blocked connection: 10.0.0.1:22"));
}

#[test]
fn test_full_exporter_drops_without_blocking() {
    let h = harness(64);
    let (exporter, mut receiver) = export::channel(1);
    let exporter = Arc::new(exporter);
    let observer = ConnectionObserver::with_clock(
        PortPolicy::default(),
        Arc::clone(&h.table),
        Arc::clone(&h.counters),
        h.clock.clone(),
    )
    .with_exporter(Arc::clone(&exporter));

    for port in 0..3 {
        observer.on_request_queued(&FakeRequest::ok(conn(22, 50000 + port)));
    }

    assert_eq!(exporter.dropped(), 2);
    assert_eq!(h.counters.snapshot().export_dropped, 2);
    assert_eq!(receiver.drain().len(), 1);
    // Decisions are recorded regardless of export
    assert_eq!(h.table.len(), 3);
}
