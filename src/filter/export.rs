//! Optional export of block decisions to a userspace consumer
//!
//! The exporter is a bounded queue in front of whoever prints events. The
//! observer pushes with `try_send`: a full or closed queue drops the event
//! and bumps a counter, it never waits.
//!
//! ```text
//! observer ──push()──► [ bounded queue ] ──drain()──► supervisor ──► stdout
//!              │
//!              └── full? drop + dropped += 1
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::identity::PolicyDecision;

/// Output format for exported event lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventFormat {
    #[default]
    Text,
    Json,
}

impl EventFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Some(EventFormat::Text),
            "json" => Some(EventFormat::Json),
            _ => None,
        }
    }
}

/// Producer half. Cheap to share between observers.
pub struct EventExporter {
    tx: mpsc::Sender<PolicyDecision>,
    dropped: AtomicU64,
}

/// Consumer half, owned by the supervisor loop.
pub struct ExportReceiver {
    rx: mpsc::Receiver<PolicyDecision>,
}

/// Create an exporter holding at most `capacity` undelivered events.
pub fn channel(capacity: usize) -> (EventExporter, ExportReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventExporter {
            tx,
            dropped: AtomicU64::new(0),
        },
        ExportReceiver { rx },
    )
}

impl EventExporter {
    /// Non-blocking push. Returns false when the event was dropped.
    pub fn push(&self, decision: PolicyDecision) -> bool {
        match self.tx.try_send(decision) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Events discarded because the queue was full or the consumer was gone
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ExportReceiver {
    /// Take everything currently queued without waiting.
    pub fn drain(&mut self) -> Vec<PolicyDecision> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

#[derive(Serialize)]
struct EventLine {
    event: &'static str,
    local: String,
    remote: String,
    timestamp_ns: u64,
}

/// Render one human-readable (or JSON) line for an exported decision.
pub fn format_event(decision: &PolicyDecision, format: EventFormat) -> String {
    let text = || {
        format!(
            "Blocked connection: {} (decided at {}.{:09}s)",
            decision.identity,
            decision.timestamp_ns / 1_000_000_000,
            decision.timestamp_ns % 1_000_000_000
        )
    };

    match format {
        EventFormat::Text => text(),
        EventFormat::Json => {
            let line = EventLine {
                event: "blocked",
                local: decision.identity.local.to_string(),
                remote: decision.identity.remote.to_string(),
                timestamp_ns: decision.timestamp_ns,
            };
            serde_json::to_string(&line).unwrap_or_else(|_| text())
        }
    }
}
