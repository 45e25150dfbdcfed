//! eBPF program loader for the connection filter
//!
//! `FilterManager` loads `conn-filter.o`, attaches the observer kprobe and
//! the enforcer kretprobe, and owns every map userspace touches afterwards.

use std::sync::mpsc;
use std::thread;

use aya::maps::{Array, AsyncPerfEventArray, HashMap, MapData, PerCpuArray, RingBuf};
use aya::programs::kprobe::KProbeLinkId;
use aya::programs::KProbe;
use aya::util::online_cpus;
use aya::{include_bytes_aligned, Bpf, BpfLoader};
use aya_log::BpfLogger;
use bytes::BytesMut;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::destroy::{DoomedSocket, SocketDestroyer};
use super::wire::{BlockEvent, ConnKey};
use super::{metrics, FilterError};
use crate::config::FilterConfig;
use crate::filter::{
    saturating_nanos, CloseError, EstablishedConnection, FilterStats, PolicyDecision, Stat,
};
use crate::supervisor::ProbeBackend;

const OBSERVER_PROGRAM: &str = "observe_request";
const OBSERVER_FUNCTION: &str = "inet_csk_reqsk_queue_hash_add";
const ENFORCER_PROGRAM: &str = "enforce_established";
const ENFORCER_FUNCTION: &str = "tcp_v4_syn_recv_sock";

const TABLE_MAP: &str = "BLOCKED_CONNECTIONS";
const STATS_MAP: &str = "STATS";
const SETTINGS_MAP: &str = "SETTINGS";
const EVENTS_MAP: &str = "BLOCK_EVENTS";
const KILL_ORDERS_MAP: &str = "KILL_ORDERS";

const SETTING_EXPORT_ENABLED: u32 = 0;
const SETTING_HANDSHAKE_WINDOW_NS: u32 = 1;

struct Attached {
    bpf: Bpf,
    links: Vec<(&'static str, KProbeLinkId)>,
    events: Option<RingBuf<MapData>>,
    kill_orders: KillOrderWorker,
}

/// Owns the loaded connection filter and its maps.
#[derive(Default)]
pub struct FilterManager {
    attached: Option<Attached>,
}

impl FilterManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn attached(&self) -> Result<&Attached, FilterError> {
        self.attached
            .as_ref()
            .ok_or_else(|| FilterError::LoadError("filter not attached".to_string()))
    }

    fn attached_mut(&mut self) -> Result<&mut Attached, FilterError> {
        self.attached
            .as_mut()
            .ok_or_else(|| FilterError::LoadError("filter not attached".to_string()))
    }
}

impl ProbeBackend for FilterManager {
    fn attach(&mut self, config: &FilterConfig) -> Result<(), FilterError> {
        // Pre-compiled eBPF bytecode, embedded from target/ebpf/conn-filter.o
        let bpf_bytes = include_bytes_aligned!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/target/ebpf/conn-filter.o"
        ));

        let mut bpf = BpfLoader::new()
            .set_max_entries(TABLE_MAP, config.table_capacity)
            .load(bpf_bytes)
            .map_err(|e| FilterError::LoadError(e.to_string()))?;

        if let Err(e) = BpfLogger::init(&mut bpf) {
            warn!(error = %e, "eBPF logger unavailable, kernel log lines will be lost");
        }

        write_settings(&mut bpf, config)?;

        // Readers first: a kill order emitted before they exist is lost
        let perf_array: AsyncPerfEventArray<MapData> = bpf
            .take_map(KILL_ORDERS_MAP)
            .ok_or_else(|| FilterError::MapError(format!("{} map not found", KILL_ORDERS_MAP)))?
            .try_into()
            .map_err(|e: aya::maps::MapError| FilterError::MapError(e.to_string()))?;
        let kill_orders = KillOrderWorker::start(perf_array)?;

        let observer_link = attach_probe(&mut bpf, OBSERVER_PROGRAM, OBSERVER_FUNCTION)?;
        let enforcer_link = attach_probe(&mut bpf, ENFORCER_PROGRAM, ENFORCER_FUNCTION)?;
        info!(
            observer = OBSERVER_FUNCTION,
            enforcer = ENFORCER_FUNCTION,
            capacity = config.table_capacity,
            "connection filter attached"
        );

        let events = if config.export_enabled {
            let map = bpf
                .take_map(EVENTS_MAP)
                .ok_or_else(|| FilterError::MapError(format!("{} map not found", EVENTS_MAP)))?;
            Some(RingBuf::try_from(map).map_err(|e| FilterError::MapError(e.to_string()))?)
        } else {
            None
        };

        self.attached = Some(Attached {
            bpf,
            // Observer first on detach: nothing new is staged while the
            // enforcer still consumes what is already in the table
            links: vec![
                (OBSERVER_PROGRAM, observer_link),
                (ENFORCER_PROGRAM, enforcer_link),
            ],
            events,
            kill_orders,
        });
        Ok(())
    }

    fn drain_events(&mut self) -> Vec<PolicyDecision> {
        let mut decisions = Vec::new();
        let Some(ring) = self.attached.as_mut().and_then(|a| a.events.as_mut()) else {
            return decisions;
        };

        while let Some(item) = ring.next() {
            match BlockEvent::read(&item) {
                Some(event) => decisions.push(event.decision()),
                None => debug!(len = item.len(), "short block event"),
            }
        }
        decisions
    }

    fn stats(&self) -> Result<FilterStats, FilterError> {
        let bpf = &self.attached()?.bpf;
        let counters: PerCpuArray<_, u64> = bpf
            .map(STATS_MAP)
            .ok_or_else(|| FilterError::MapError(format!("{} map not found", STATS_MAP)))?
            .try_into()
            .map_err(|e: aya::maps::MapError| FilterError::MapError(e.to_string()))?;

        let mut stats = FilterStats::default();
        for stat in Stat::ALL {
            let per_cpu = counters
                .get(&(stat as u32), 0)
                .map_err(|e| FilterError::MapError(e.to_string()))?;
            stats.set(stat, per_cpu.iter().sum());
        }
        Ok(stats)
    }

    fn table_len(&self) -> Result<usize, FilterError> {
        let bpf = &self.attached()?.bpf;
        let table: HashMap<_, ConnKey, u64> = bpf
            .map(TABLE_MAP)
            .ok_or_else(|| FilterError::MapError(format!("{} map not found", TABLE_MAP)))?
            .try_into()
            .map_err(|e: aya::maps::MapError| FilterError::MapError(e.to_string()))?;

        Ok(table.keys().filter(|k| k.is_ok()).count())
    }

    fn evict_older_than(&mut self, cutoff_ns: u64) -> Result<usize, FilterError> {
        let bpf = &mut self.attached_mut()?.bpf;
        let mut table: HashMap<_, ConnKey, u64> = bpf
            .map_mut(TABLE_MAP)
            .ok_or_else(|| FilterError::MapError(format!("{} map not found", TABLE_MAP)))?
            .try_into()
            .map_err(|e: aya::maps::MapError| FilterError::MapError(e.to_string()))?;

        let stale: Vec<ConnKey> = table
            .iter()
            .filter_map(|item| item.ok())
            .filter(|(_, stamp_ns)| *stamp_ns < cutoff_ns)
            .map(|(key, _)| key)
            .collect();

        let mut evicted = 0;
        for key in stale {
            // Already consumed by the enforcer in the meantime
            if table.remove(&key).is_ok() {
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    fn detach(&mut self) -> Result<(), FilterError> {
        let attached = self.attached_mut()?;
        if attached.links.is_empty() {
            return Ok(());
        }

        for (program, link) in attached.links.drain(..) {
            detach_probe(&mut attached.bpf, program, link)?;
        }

        info!("connection filter detached");
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut attached) = self.attached.take() {
            attached.kill_orders.stop();
            // Dropping Bpf closes every map fd, including the table
            drop(attached.bpf);
        }
    }
}

fn write_settings(bpf: &mut Bpf, config: &FilterConfig) -> Result<(), FilterError> {
    let mut settings: Array<_, u64> = bpf
        .map_mut(SETTINGS_MAP)
        .ok_or_else(|| FilterError::MapError(format!("{} map not found", SETTINGS_MAP)))?
        .try_into()
        .map_err(|e: aya::maps::MapError| FilterError::MapError(e.to_string()))?;

    settings
        .set(SETTING_EXPORT_ENABLED, u64::from(config.export_enabled), 0)
        .map_err(|e| FilterError::MapError(e.to_string()))?;
    settings
        .set(
            SETTING_HANDSHAKE_WINDOW_NS,
            saturating_nanos(config.handshake_window),
            0,
        )
        .map_err(|e| FilterError::MapError(e.to_string()))?;
    Ok(())
}

fn attach_probe(bpf: &mut Bpf, program: &str, function: &str) -> Result<KProbeLinkId, FilterError> {
    let probe: &mut KProbe = bpf
        .program_mut(program)
        .ok_or_else(|| FilterError::LoadError(format!("{} program not found", program)))?
        .try_into()
        .map_err(|e: aya::programs::ProgramError| FilterError::LoadError(e.to_string()))?;

    probe
        .load()
        .map_err(|e| FilterError::LoadError(format!("{}: {}", program, e)))?;

    probe
        .attach(function, 0)
        .map_err(|e| FilterError::AttachError(format!("{} on {}: {}", program, function, e)))
}

fn detach_probe(bpf: &mut Bpf, program: &str, link: KProbeLinkId) -> Result<(), FilterError> {
    let probe: &mut KProbe = bpf
        .program_mut(program)
        .ok_or_else(|| FilterError::DetachError(format!("{} program not found", program)))?
        .try_into()
        .map_err(|e: aya::programs::ProgramError| FilterError::DetachError(e.to_string()))?;

    probe
        .detach(link)
        .map_err(|e| FilterError::DetachError(format!("{}: {}", program, e)))
}

/// Kill-order readers on a thread and runtime of their own, apart from the
/// supervisor tick.
struct KillOrderWorker {
    stop: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl KillOrderWorker {
    fn start(perf_array: AsyncPerfEventArray<MapData>) -> Result<Self, FilterError> {
        let cpus = online_cpus()
            .map_err(|e| FilterError::MapError(format!("Failed to get online CPUs: {}", e)))?;

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let handle = thread::Builder::new()
            .name("synguard-kill".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(FilterError::AttachError(format!(
                            "kill-order runtime: {}",
                            e
                        ))));
                        return;
                    }
                };

                runtime.block_on(async move {
                    // Perf buffers register with the reactor, so open them here
                    let readers = match spawn_readers(perf_array, cpus) {
                        Ok(readers) => readers,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));

                    let _ = stop_rx.await;
                    for reader in readers {
                        reader.abort();
                    }
                });
            })
            .map_err(|e| FilterError::AttachError(format!("kill-order thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop: Some(stop_tx),
                thread: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(FilterError::AttachError(
                    "kill-order thread exited during startup".to_string(),
                ))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("kill-order thread panicked");
            }
        }
    }
}

impl Drop for KillOrderWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One reader per CPU on the KILL_ORDERS perf array.
///
/// Kill orders cannot wait for the poll interval: each one is destroyed as
/// soon as it is read.
fn spawn_readers(
    mut perf_array: AsyncPerfEventArray<MapData>,
    cpus: Vec<u32>,
) -> Result<Vec<JoinHandle<()>>, FilterError> {
    let mut handles = Vec::with_capacity(cpus.len());
    for cpu_id in cpus {
        let mut buf = perf_array
            .open(cpu_id, None)
            .map_err(|e| FilterError::MapError(format!("Failed to open perf buffer: {}", e)))?;
        let mut destroyer = SocketDestroyer::new()
            .map_err(|e| FilterError::AttachError(format!("NETLINK_SOCK_DIAG socket: {}", e)))?;

        let handle = tokio::spawn(async move {
            let mut buffers = (0..16)
                .map(|_| BytesMut::with_capacity(std::mem::size_of::<BlockEvent>()))
                .collect::<Vec<_>>();

            loop {
                let events = match buf.read_events(&mut buffers).await {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(cpu = cpu_id, error = %e, "error reading kill orders");
                        continue;
                    }
                };

                if events.lost > 0 {
                    warn!(cpu = cpu_id, lost = events.lost, "kill orders lost, connections let through");
                }

                for raw in buffers.iter().take(events.read) {
                    if let Some(order) = BlockEvent::read(raw) {
                        let mut socket = DoomedSocket::new(order.key.identity(), &mut destroyer);
                        execute_kill_order(&mut socket);
                    }
                }
            }
        });
        handles.push(handle);
    }

    Ok(handles)
}

fn execute_kill_order(socket: &mut DoomedSocket<'_>) {
    let identity = socket.snapshot().ok();
    match socket.force_close() {
        Ok(()) => debug!(identity = ?identity, "blocked connection reset"),
        Err(CloseError::NotFound) => {
            // Peer gave up or the application already closed it
            metrics::record_destroy_failure("not_found");
        }
        Err(e @ CloseError::NotPermitted(_)) => {
            metrics::record_destroy_failure("not_permitted");
            warn!(identity = ?identity, error = %e, "cannot reset blocked connection");
        }
        Err(e) => {
            metrics::record_destroy_failure("io");
            warn!(identity = ?identity, error = %e, "cannot reset blocked connection");
        }
    }
}
