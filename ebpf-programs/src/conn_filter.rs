//! eBPF connection admission filter
//!
//! Two probes cooperate on every inbound IPv4 TCP connection:
//!
//! - `observe_request` (kprobe on `inet_csk_reqsk_queue_hash_add`) runs when a
//!   SYN has been accepted into the listener's request queue. If neither the
//!   local nor the remote port is in the allow-list it stages a block decision
//!   in BLOCKED_CONNECTIONS keyed by the connection 4-tuple.
//! - `enforce_established` (kretprobe on `tcp_v4_syn_recv_sock`) runs when the
//!   handshake completes and the child socket exists. It consumes the staged
//!   decision and emits a kill order that userspace turns into a
//!   SOCK_DESTROY (RST) before the application can read from the socket.
//!
//! The 4-tuple is identical on the request socket and on the child socket,
//! so both probes derive the same key without sharing kernel pointers.
//! Every failure path is fail-open: the connection proceeds.
//!
//! Dual-stack listeners see IPv4 clients as AF_INET6 sockets carrying
//! v4-mapped addresses (::ffff:a.b.c.d). Those are keyed on the embedded
//! IPv4 tuple; native IPv6 connections are counted as skipped.

#![no_std]
#![no_main]

use aya_ebpf::{
    cty::c_long,
    helpers::{bpf_ktime_get_ns, bpf_probe_read_kernel},
    macros::{kprobe, kretprobe, map},
    maps::{Array, HashMap, PerCpuArray, PerfEventArray, RingBuf},
    programs::{ProbeContext, RetProbeContext},
};
use aya_log_ebpf::{debug, info};

/// Default capacity of the decision table; userspace overrides it at load time
const DEFAULT_TABLE_CAPACITY: u32 = 10240;

/// Ports that let a connection through (checked on both ends)
const HTTP_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;

/// Decisions older than this are stale when the window is not configured
const DEFAULT_HANDSHAKE_WINDOW_NS: u64 = 75 * 1_000_000_000;

const AF_INET: u16 = 2;
const AF_INET6: u16 = 10;
const BPF_ANY: u64 = 0;

/// Error for a probe invoked without the expected argument
const ENOARG: c_long = 22;

// struct sock_common field offsets (stable since Linux 5.4).
// struct request_sock starts with a sock_common, so these work for both the
// pending request and the established child.
const SKC_DADDR: usize = 0;
const SKC_RCV_SADDR: usize = 4;
const SKC_DPORT: usize = 12;
const SKC_NUM: usize = 14;
const SKC_FAMILY: usize = 16;
const SKC_V6_DADDR: usize = 56;
const SKC_V6_RCV_SADDR: usize = 72;

/// Third word of a v4-mapped IPv6 address (::ffff:0:0/96), as stored
const V4_MAPPED_MARKER: u32 = u32::from_be(0x0000_ffff);

// STATS slots, mirrored in userspace
const STAT_OBSERVED: u32 = 0;
const STAT_BLOCKED: u32 = 1;
const STAT_TABLE_FULL: u32 = 2;
const STAT_ENFORCED: u32 = 3;
const STAT_STALE: u32 = 4;
const STAT_EXPORT_DROPPED: u32 = 5;
const STAT_UNREADABLE: u32 = 6;
const STAT_SKIPPED: u32 = 7;
const STAT_SLOTS: u32 = 8;

// SETTINGS slots, written once by userspace before attach
const SETTING_EXPORT_ENABLED: u32 = 0;
const SETTING_HANDSHAKE_WINDOW_NS: u32 = 1;

/// Connection 4-tuple. Addresses are raw network-order words as the kernel
/// stores them; ports are host order.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ConnKey {
    pub local_addr: u32,
    pub remote_addr: u32,
    pub local_port: u16,
    pub remote_port: u16,
}

/// Block decision copy sent to userspace (export and kill orders)
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BlockEvent {
    pub key: ConnKey,
    pub _pad: u32,
    /// Decision timestamp (nanoseconds since boot)
    pub stamp_ns: u64,
}

/// BPF Map: 4-tuple -> decision timestamp
/// Written by observe_request, consumed by enforce_established.
#[map]
static BLOCKED_CONNECTIONS: HashMap<ConnKey, u64> =
    HashMap::with_max_entries(DEFAULT_TABLE_CAPACITY, 0);

/// Per-CPU counters read by userspace for metrics
#[map]
static STATS: PerCpuArray<u64> = PerCpuArray::with_max_entries(STAT_SLOTS, 0);

/// Startup settings from userspace
#[map]
static SETTINGS: Array<u64> = Array::with_max_entries(2, 0);

/// Exported block decisions (only when export is enabled)
#[map]
static BLOCK_EVENTS: RingBuf = RingBuf::with_byte_size(64 * 1024, 0);

/// Sockets to destroy, read per CPU by userspace
#[map]
static KILL_ORDERS: PerfEventArray<BlockEvent> = PerfEventArray::new(0);

/// kprobe for inet_csk_reqsk_queue_hash_add(sk, req, timeout)
#[kprobe]
pub fn observe_request(ctx: ProbeContext) -> u32 {
    match try_observe_request(&ctx) {
        Ok(ret) => ret,
        Err(_) => {
            bump(STAT_UNREADABLE);
            0
        }
    }
}

fn try_observe_request(ctx: &ProbeContext) -> Result<u32, c_long> {
    bump(STAT_OBSERVED);

    let req: *const u8 = ctx.arg(1).ok_or(ENOARG)?;
    let key = match read_conn_key(req)? {
        Some(key) => key,
        None => {
            bump(STAT_SKIPPED);
            return Ok(0);
        }
    };

    if port_allowed(key.local_port) || port_allowed(key.remote_port) {
        return Ok(0);
    }

    let stamp_ns = unsafe { bpf_ktime_get_ns() };
    bump(STAT_BLOCKED);

    // Full table: decision is lost and the connection will be let through
    if BLOCKED_CONNECTIONS.insert(&key, &stamp_ns, BPF_ANY).is_err() {
        bump(STAT_TABLE_FULL);
    }

    if setting(SETTING_EXPORT_ENABLED) != 0 {
        let event = BlockEvent {
            key,
            _pad: 0,
            stamp_ns,
        };
        if BLOCK_EVENTS.output(&event, 0).is_err() {
            bump(STAT_EXPORT_DROPPED);
        }
    }

    debug!(
        ctx,
        "staged block: local port {} remote port {}", key.local_port, key.remote_port
    );

    Ok(0)
}

/// kretprobe for tcp_v4_syn_recv_sock, which returns the child socket
#[kretprobe]
pub fn enforce_established(ctx: RetProbeContext) -> u32 {
    match try_enforce_established(&ctx) {
        Ok(ret) => ret,
        Err(_) => {
            bump(STAT_UNREADABLE);
            0
        }
    }
}

fn try_enforce_established(ctx: &RetProbeContext) -> Result<u32, c_long> {
    let child: *const u8 = match ctx.ret() {
        Some(child) => child,
        None => return Ok(0),
    };
    if child.is_null() {
        return Ok(0);
    }

    let key = match read_conn_key(child)? {
        Some(key) => key,
        None => {
            bump(STAT_SKIPPED);
            return Ok(0);
        }
    };

    let stamp_ns = match unsafe { BLOCKED_CONNECTIONS.get(&key) } {
        Some(stamp) => *stamp,
        None => return Ok(0),
    };

    // Only the CPU whose delete succeeds owns the decision
    if BLOCKED_CONNECTIONS.remove(&key).is_err() {
        return Ok(0);
    }

    let now = unsafe { bpf_ktime_get_ns() };
    if now.saturating_sub(stamp_ns) > handshake_window_ns() {
        bump(STAT_STALE);
        return Ok(0);
    }

    bump(STAT_ENFORCED);
    let order = BlockEvent {
        key,
        _pad: 0,
        stamp_ns,
    };
    KILL_ORDERS.output(ctx, &order, 0);

    info!(
        ctx,
        "dropping blocked connection: local port {} remote port {}",
        key.local_port,
        key.remote_port
    );

    Ok(0)
}

/// Snapshot the IPv4 4-tuple of a sock_common, including v4-mapped sockets
/// on dual-stack listeners. Returns None for native IPv6 and other families.
#[inline(always)]
fn read_conn_key(sk: *const u8) -> Result<Option<ConnKey>, c_long> {
    let family: u16 = unsafe { bpf_probe_read_kernel(sk.add(SKC_FAMILY) as *const u16)? };
    let (remote_addr, local_addr) = match family {
        AF_INET => {
            let remote: u32 = unsafe { bpf_probe_read_kernel(sk.add(SKC_DADDR) as *const u32)? };
            let local: u32 = unsafe { bpf_probe_read_kernel(sk.add(SKC_RCV_SADDR) as *const u32)? };
            (remote, local)
        }
        AF_INET6 => {
            let remote: [u32; 4] =
                unsafe { bpf_probe_read_kernel(sk.add(SKC_V6_DADDR) as *const [u32; 4])? };
            let local: [u32; 4] =
                unsafe { bpf_probe_read_kernel(sk.add(SKC_V6_RCV_SADDR) as *const [u32; 4])? };
            if !v4_mapped(&remote) || !v4_mapped(&local) {
                return Ok(None);
            }
            (remote[3], local[3])
        }
        _ => return Ok(None),
    };
    let remote_port: u16 = unsafe { bpf_probe_read_kernel(sk.add(SKC_DPORT) as *const u16)? };
    let local_port: u16 = unsafe { bpf_probe_read_kernel(sk.add(SKC_NUM) as *const u16)? };

    Ok(Some(ConnKey {
        local_addr,
        remote_addr,
        local_port,
        // skc_dport is network order, skc_num is already host order
        remote_port: u16::from_be(remote_port),
    }))
}

#[inline(always)]
fn v4_mapped(addr: &[u32; 4]) -> bool {
    addr[0] == 0 && addr[1] == 0 && addr[2] == V4_MAPPED_MARKER
}

#[inline(always)]
fn port_allowed(port: u16) -> bool {
    port == HTTP_PORT || port == HTTPS_PORT
}

#[inline(always)]
fn setting(slot: u32) -> u64 {
    SETTINGS.get(slot).copied().unwrap_or(0)
}

#[inline(always)]
fn handshake_window_ns() -> u64 {
    match setting(SETTING_HANDSHAKE_WINDOW_NS) {
        0 => DEFAULT_HANDSHAKE_WINDOW_NS,
        window => window,
    }
}

#[inline(always)]
fn bump(slot: u32) {
    if let Some(counter) = STATS.get_ptr_mut(slot) {
        unsafe { *counter += 1 };
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
