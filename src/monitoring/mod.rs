pub mod alerts;

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info_span, Span};
use uuid::Uuid;

use crate::security::audit_log::Outcome;

#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct OperationStats {
    pub timestamp_ms: u128,
    pub started: u64,
    pub in_flight: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub denied: u64,
    pub total_duration_micros: u64,
}

#[derive(Debug, Default)]
struct Counters {
    started: AtomicU64,
    in_flight: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    denied: AtomicU64,
    total_duration_micros: AtomicU64,
}

/// Process-wide counters for gateway executions.
#[derive(Debug, Clone, Default)]
pub struct OperationMonitor {
    counters: Arc<Counters>,
}

impl OperationMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request rejected before its protection scope was opened.
    pub fn record_denied(&self) {
        self.counters.denied.fetch_add(1, Ordering::Relaxed);
    }

    /// Open a span correlated by `operation_id`. The span is closed when the
    /// returned guard is closed or dropped.
    pub fn start_span(&self, operation_id: Uuid, kind: &str, actor_id: &str) -> MonitoringSpan {
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        self.counters.in_flight.fetch_add(1, Ordering::Relaxed);
        let span = info_span!("critical_operation", %operation_id, kind, actor_id);
        MonitoringSpan {
            operation_id,
            span,
            started: Instant::now(),
            counters: self.counters.clone(),
            closed: false,
        }
    }

    pub fn snapshot(&self) -> OperationStats {
        let c = &self.counters;
        OperationStats {
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or_default(),
            started: c.started.load(Ordering::Relaxed),
            in_flight: c.in_flight.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            denied: c.denied.load(Ordering::Relaxed),
            total_duration_micros: c.total_duration_micros.load(Ordering::Relaxed),
        }
    }
}

/// Monitoring span for one operation execution.
#[derive(Debug)]
pub struct MonitoringSpan {
    operation_id: Uuid,
    span: Span,
    started: Instant,
    counters: Arc<Counters>,
    closed: bool,
}

impl MonitoringSpan {
    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn close(mut self, outcome: Outcome) {
        self.finish(Some(outcome));
    }

    fn finish(&mut self, outcome: Option<Outcome>) {
        if self.closed {
            return;
        }
        self.closed = true;
        let micros = self.started.elapsed().as_micros() as u64;
        self.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.counters
            .total_duration_micros
            .fetch_add(micros, Ordering::Relaxed);
        match outcome {
            Some(Outcome::Success) => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Some(Outcome::Failure) | None => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            Some(Outcome::Denied) => {
                self.counters.denied.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.span.in_scope(|| {
            debug!(operation_id = %self.operation_id, duration_micros = micros, outcome = ?outcome, "monitoring span closed");
        });
    }
}

impl Drop for MonitoringSpan {
    fn drop(&mut self) {
        self.finish(None);
    }
}
