//! Supervisor loop
//!
//! Owns a [`ProbeBackend`] and drives it through its lifecycle:
//!
//! ```text
//!   Idle ──attach()──► Attached ──run_until()──► Running
//!    ▲                                              │ SIGINT / SIGTERM
//!    └── attach failed                              ▼
//!                          Stopped ◄──release── ShuttingDown
//!                                                (detach, final drain)
//! ```
//!
//! While running, every poll interval drains exported events to the output
//! sink, refreshes metrics from the kernel counters, and evicts stale table
//! entries when the table-full counter has grown since the previous tick.

use std::fmt;
use std::future::Future;
use std::io::{self, Write};

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::FilterConfig;
use crate::ebpf::{metrics, FilterError};
use crate::filter::export::format_event;
use crate::filter::{saturating_nanos, Clock, FilterStats, MonotonicClock, PolicyDecision};

/// Everything the supervisor needs from the loaded filter.
///
/// Implemented by `ebpf::FilterManager` against the kernel maps, and by fakes
/// in tests.
pub trait ProbeBackend {
    /// Load and attach both hooks.
    fn attach(&mut self, config: &FilterConfig) -> Result<(), FilterError>;

    /// Take every exported event buffered since the last call.
    fn drain_events(&mut self) -> Vec<PolicyDecision>;

    /// Current hook counters.
    fn stats(&self) -> Result<FilterStats, FilterError>;

    /// Number of decisions currently staged in the table. May walk the
    /// whole table, so the supervisor only asks under capacity pressure.
    fn table_len(&self) -> Result<usize, FilterError>;

    /// Remove decisions stamped before `cutoff_ns`; returns how many went.
    fn evict_older_than(&mut self, cutoff_ns: u64) -> Result<usize, FilterError>;

    /// Detach both hooks. Idempotent.
    fn detach(&mut self) -> Result<(), FilterError>;

    /// Drop the table and every other kernel resource.
    fn release(&mut self);
}

/// Lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Attached,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Attached => "attached",
            SupervisorState::Running => "running",
            SupervisorState::ShuttingDown => "shutting down",
            SupervisorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Error type for supervisor operations
#[derive(Debug)]
pub enum SupervisorError {
    /// Operation not valid in the current state
    IllegalTransition {
        from: SupervisorState,
        to: SupervisorState,
    },
    /// Backend failed to attach the hooks
    Attach(FilterError),
    /// Writing event lines failed
    Output(io::Error),
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorError::IllegalTransition { from, to } => {
                write!(f, "illegal transition from {} to {}", from, to)
            }
            SupervisorError::Attach(e) => write!(f, "failed to attach filter: {}", e),
            SupervisorError::Output(e) => write!(f, "failed to write event: {}", e),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Attach(e) => Some(e),
            SupervisorError::Output(e) => Some(e),
            SupervisorError::IllegalTransition { .. } => None,
        }
    }
}

impl From<io::Error> for SupervisorError {
    fn from(e: io::Error) -> Self {
        SupervisorError::Output(e)
    }
}

pub struct Supervisor<B: ProbeBackend, W: Write = io::Stdout, C: Clock = MonotonicClock> {
    backend: B,
    config: FilterConfig,
    out: W,
    clock: C,
    state: SupervisorState,
    last_table_full: u64,
    events_written: u64,
}

impl<B: ProbeBackend> Supervisor<B> {
    /// Supervisor printing event lines to stdout.
    pub fn new(backend: B, config: FilterConfig) -> Self {
        Supervisor::with_output(backend, config, io::stdout(), MonotonicClock)
    }
}

impl<B: ProbeBackend, W: Write, C: Clock> Supervisor<B, W, C> {
    pub fn with_output(backend: B, config: FilterConfig, out: W, clock: C) -> Self {
        Self {
            backend,
            config,
            out,
            clock,
            state: SupervisorState::Idle,
            last_table_full: 0,
            events_written: 0,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    /// Exported events written so far
    pub fn events_written(&self) -> u64 {
        self.events_written
    }

    fn transition(&mut self, to: SupervisorState) -> Result<(), SupervisorError> {
        use SupervisorState::*;

        let legal = matches!(
            (self.state, to),
            (Idle, Attached)
                | (Attached, Running)
                | (Attached, ShuttingDown)
                | (Running, ShuttingDown)
                | (ShuttingDown, Stopped)
        );
        if !legal {
            return Err(SupervisorError::IllegalTransition {
                from: self.state,
                to,
            });
        }

        debug!(from = %self.state, to = %to, "supervisor transition");
        self.state = to;
        Ok(())
    }

    /// `Idle → Attached`. On failure the supervisor stays `Idle`.
    pub fn attach(&mut self) -> Result<(), SupervisorError> {
        if self.state != SupervisorState::Idle {
            return Err(SupervisorError::IllegalTransition {
                from: self.state,
                to: SupervisorState::Attached,
            });
        }

        self.backend
            .attach(&self.config)
            .map_err(SupervisorError::Attach)?;
        metrics::set_attached(true);
        self.transition(SupervisorState::Attached)
    }

    /// `Attached → Running → ShuttingDown → Stopped`.
    ///
    /// Polls until `shutdown` resolves, then detaches, drains and releases.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<(), SupervisorError>
    where
        F: Future<Output = ()>,
    {
        self.transition(SupervisorState::Running)?;
        info!(
            interval_ms = self.config.poll_interval.as_millis() as u64,
            export = self.config.export_enabled,
            "supervisor running"
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                _ = ticker.tick() => {
                    if let Err(e) = self.tick() {
                        break Err(e);
                    }
                }
            }
        };

        // Hooks come off even when the loop failed
        let shutdown_result = self.shutdown();
        outcome.and(shutdown_result)
    }

    /// One poll: events, counters, capacity pressure.
    pub fn tick(&mut self) -> Result<(), SupervisorError> {
        self.flush_events()?;

        let stats = match self.backend.stats() {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "unable to read filter counters");
                return Ok(());
            }
        };
        metrics::record_stats(&stats);

        if stats.table_full > self.last_table_full {
            warn!(
                dropped = stats.table_full - self.last_table_full,
                "connection table full, block decisions dropped"
            );
            self.evict_stale();

            // Counting walks every kernel table entry, so only under pressure
            if let Ok(len) = self.backend.table_len() {
                metrics::set_table_entries(len);
            }
        }
        self.last_table_full = stats.table_full;
        Ok(())
    }

    fn evict_stale(&mut self) {
        let window_ns = saturating_nanos(self.config.handshake_window);
        let cutoff = self.clock.now_ns().saturating_sub(window_ns);

        match self.backend.evict_older_than(cutoff) {
            Ok(0) => {}
            Ok(evicted) => {
                metrics::add_evictions(evicted);
                info!(evicted, "evicted stale block decisions");
            }
            Err(e) => warn!(error = %e, "eviction failed"),
        }
    }

    fn flush_events(&mut self) -> Result<(), SupervisorError> {
        let events = self.backend.drain_events();
        if events.is_empty() {
            return Ok(());
        }

        for decision in &events {
            writeln!(self.out, "{}", format_event(decision, self.config.export_format))?;
        }
        self.out.flush()?;
        self.events_written += events.len() as u64;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), SupervisorError> {
        self.transition(SupervisorState::ShuttingDown)?;

        if let Err(e) = self.backend.detach() {
            warn!(error = %e, "failed to detach hooks cleanly");
        }
        metrics::set_attached(false);

        let drained = self.flush_events();

        if let Ok(stats) = self.backend.stats() {
            metrics::record_stats(&stats);
            info!(
                observed = stats.observed,
                blocked = stats.blocked,
                enforced = stats.enforced,
                stale = stats.stale,
                table_full = stats.table_full,
                export_dropped = stats.export_dropped,
                "filter summary"
            );
        }

        self.backend.release();
        self.transition(SupervisorState::Stopped)?;
        drained
    }
}

/// Resolves on SIGINT (Ctrl-C) or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "unable to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
