use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::monitoring::alerts::{Alert, AlertDispatcher, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Denied,
}

/// One terminal audit event for a gateway invocation. Records are written
/// once and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub operation_id: Uuid,
    pub operation_kind: String,
    pub actor_id: String,
    pub outcome: Outcome,
    pub duration_micros: u64,
    pub context: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditRecord {
    pub fn new(
        operation_id: Uuid,
        operation_kind: impl Into<String>,
        actor_id: impl Into<String>,
        outcome: Outcome,
        duration: Duration,
        context: serde_json::Value,
    ) -> Self {
        Self {
            operation_id,
            operation_kind: operation_kind.into(),
            actor_id: actor_id.into(),
            outcome,
            duration_micros: duration.as_micros() as u64,
            context,
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Downstream destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, record: &AuditRecord) -> Result<()>;
}

/// Emits records as structured events on the `audit` target.
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

#[async_trait]
impl AuditSink for TracingSink {
    async fn write(&self, r: &AuditRecord) -> Result<()> {
        let error_msg = r.error.as_deref().unwrap_or("");
        match r.outcome {
            Outcome::Success => {
                info!(target: "audit", event = "operation_succeeded", operation_id = %r.operation_id, kind = %r.operation_kind, actor_id = %r.actor_id, duration_micros = r.duration_micros)
            }
            Outcome::Failure => {
                error!(target: "audit", event = "operation_failed", operation_id = %r.operation_id, kind = %r.operation_kind, actor_id = %r.actor_id, duration_micros = r.duration_micros, error = error_msg)
            }
            Outcome::Denied => {
                warn!(target: "audit", event = "operation_denied", operation_id = %r.operation_id, kind = %r.operation_kind, actor_id = %r.actor_id, error = error_msg)
            }
        }
        Ok(())
    }
}

/// Appends records as JSON lines.
#[derive(Debug)]
pub struct JsonlFileSink {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonlFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every record in a JSON-lines audit file.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<AuditRecord>> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading audit log {}", path.display()))?;
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .enumerate()
            .map(|(i, line)| {
                serde_json::from_str(line).with_context(|| format!("parsing audit line {}", i + 1))
            })
            .collect()
    }
}

#[async_trait]
impl AuditSink for JsonlFileSink {
    async fn write(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record).context("encoding audit record")?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening audit log {}", self.path.display()))?;
        file.write_all(&line).await.context("appending audit record")?;
        file.flush().await.context("flushing audit log")?;
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        match self.records.lock() {
            Ok(g) => g.clone(),
            Err(e) => e.into_inner().clone(),
        }
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.records().iter().filter(|r| r.outcome == outcome).count()
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn write(&self, record: &AuditRecord) -> Result<()> {
        match self.records.lock() {
            Ok(mut g) => g.push(record.clone()),
            Err(e) => e.into_inner().push(record.clone()),
        }
        Ok(())
    }
}

/// Raise an alert when `failures` records with `outcome` for `kind` (any
/// kind when unset) land within `window_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdRule {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default = "default_threshold_outcome")]
    pub outcome: Outcome,
    pub failures: u32,
    #[serde(default = "default_threshold_window")]
    pub window_secs: u64,
    #[serde(default)]
    pub severity: Severity,
}

fn default_threshold_outcome() -> Outcome {
    Outcome::Failure
}

fn default_threshold_window() -> u64 {
    300
}

impl ThresholdRule {
    fn matches(&self, record: &AuditRecord) -> bool {
        record.outcome == self.outcome
            && self
                .kind
                .as_deref()
                .map_or(true, |k| k == record.operation_kind)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    /// JSON-lines file receiving every record in addition to the log
    #[serde(default)]
    pub file_path: Option<PathBuf>,
    #[serde(default)]
    pub thresholds: Vec<ThresholdRule>,
}

/// Append-only audit trail with threshold alerting.
///
/// `record` never fails on the caller's behalf: sink errors and threshold
/// problems go to the `audit_fallback` target.
pub struct AuditLogger {
    sinks: Vec<Arc<dyn AuditSink>>,
    rules: Vec<ThresholdRule>,
    hits: Mutex<Vec<VecDeque<Instant>>>,
    alerts: Option<AlertDispatcher>,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("sinks", &self.sinks.len())
            .field("rules", &self.rules)
            .finish()
    }
}

impl AuditLogger {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self {
            sinks,
            rules: Vec::new(),
            hits: Mutex::new(Vec::new()),
            alerts: None,
        }
    }

    /// Log sink plus the optional JSON-lines file from config.
    pub fn from_config(config: &AuditConfig, alerts: Option<AlertDispatcher>) -> Self {
        let mut sinks: Vec<Arc<dyn AuditSink>> = vec![Arc::new(TracingSink)];
        if let Some(path) = &config.file_path {
            sinks.push(Arc::new(JsonlFileSink::new(path.clone())));
        }
        let mut logger = Self::new(sinks).with_thresholds(config.thresholds.clone());
        logger.alerts = alerts;
        logger
    }

    pub fn with_thresholds(mut self, rules: Vec<ThresholdRule>) -> Self {
        self.hits = Mutex::new(rules.iter().map(|_| VecDeque::new()).collect());
        self.rules = rules;
        self
    }

    pub fn with_alerts(mut self, alerts: AlertDispatcher) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub async fn record(&self, record: AuditRecord) {
        for sink in &self.sinks {
            if let Err(e) = sink.write(&record).await {
                error!(
                    target: "audit_fallback",
                    operation_id = %record.operation_id,
                    kind = %record.operation_kind,
                    actor_id = %record.actor_id,
                    outcome = ?record.outcome,
                    error = %e,
                    "audit sink write failed"
                );
            }
        }

        for alert in self.evaluate_thresholds(&record) {
            match &self.alerts {
                Some(dispatcher) => dispatcher.dispatch(alert).await,
                None => warn!(target: "audit_fallback", message = %alert.message, "threshold reached with no alert channel"),
            }
        }
    }

    fn evaluate_thresholds(&self, record: &AuditRecord) -> Vec<Alert> {
        if self.rules.is_empty() {
            return Vec::new();
        }
        let mut hits = match self.hits.lock() {
            Ok(g) => g,
            Err(_) => {
                error!(target: "audit_fallback", "threshold state poisoned; skipping evaluation");
                return Vec::new();
            }
        };

        let now = Instant::now();
        let mut fired = Vec::new();
        for (rule, deque) in self.rules.iter().zip(hits.iter_mut()) {
            if !rule.matches(record) {
                continue;
            }
            let window = Duration::from_secs(rule.window_secs);
            // purge old
            while let Some(&front) = deque.front() {
                if now.duration_since(front) > window {
                    deque.pop_front();
                } else {
                    break;
                }
            }
            deque.push_back(now);

            if rule.failures > 0 && deque.len() >= rule.failures as usize {
                fired.push(Alert::new(
                    rule.severity,
                    format!(
                        "{} {:?} records for '{}' within {}s",
                        deque.len(),
                        record.outcome,
                        rule.kind.as_deref().unwrap_or("*"),
                        rule.window_secs
                    ),
                    json!({
                        "operation_kind": record.operation_kind,
                        "last_operation_id": record.operation_id,
                        "last_actor_id": record.actor_id,
                    }),
                ));
                deque.clear();
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::alerts::MemoryNotifier;

    fn rec(kind: &str, outcome: Outcome) -> AuditRecord {
        AuditRecord::new(
            Uuid::new_v4(),
            kind,
            "alice",
            outcome,
            Duration::from_micros(42),
            json!({"origin": "127.0.0.1"}),
        )
    }

    struct BrokenSink;

    #[async_trait]
    impl AuditSink for BrokenSink {
        async fn write(&self, _record: &AuditRecord) -> Result<()> {
            anyhow::bail!("disk full")
        }
    }

    #[tokio::test]
    async fn sink_failure_does_not_stop_other_sinks() {
        let memory = MemorySink::new();
        let logger = AuditLogger::new(vec![Arc::new(BrokenSink), Arc::new(memory.clone())]);
        logger.record(rec("content.create", Outcome::Success)).await;
        assert_eq!(memory.records().len(), 1);
    }

    #[tokio::test]
    async fn threshold_fires_once_per_crossing() {
        let memory = MemorySink::new();
        let notifier = MemoryNotifier::new();
        let logger = AuditLogger::new(vec![Arc::new(memory.clone())])
            .with_thresholds(vec![ThresholdRule {
                kind: Some("content.update".into()),
                outcome: Outcome::Failure,
                failures: 3,
                window_secs: 60,
                severity: Severity::Critical,
            }])
            .with_alerts(AlertDispatcher::new(
                Arc::new(notifier.clone()),
                Duration::from_secs(1),
            ));

        logger.record(rec("content.update", Outcome::Failure)).await;
        logger.record(rec("content.update", Outcome::Success)).await;
        logger.record(rec("content.delete", Outcome::Failure)).await;
        logger.record(rec("content.update", Outcome::Failure)).await;
        assert!(notifier.alerts().is_empty());

        logger.record(rec("content.update", Outcome::Failure)).await;
        let alerts = notifier.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Critical);

        logger.record(rec("content.update", Outcome::Failure)).await;
        assert_eq!(notifier.alerts().len(), 1);
        assert_eq!(memory.records().len(), 6);
    }

    #[tokio::test]
    async fn wildcard_threshold_counts_all_kinds() {
        let notifier = MemoryNotifier::new();
        let logger = AuditLogger::new(vec![])
            .with_thresholds(vec![ThresholdRule {
                kind: None,
                outcome: Outcome::Denied,
                failures: 2,
                window_secs: 60,
                severity: Severity::Warning,
            }])
            .with_alerts(AlertDispatcher::new(
                Arc::new(notifier.clone()),
                Duration::from_secs(1),
            ));

        logger.record(rec("content.publish", Outcome::Denied)).await;
        logger.record(rec("widget.update", Outcome::Denied)).await;
        assert_eq!(notifier.alerts().len(), 1);
    }

    #[tokio::test]
    async fn jsonl_sink_round_trips_all_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlFileSink::new(&path);

        let first = rec("media.upload", Outcome::Success);
        let second = rec("media.upload", Outcome::Failure).with_error("disk quota exceeded");
        sink.write(&first).await.unwrap();
        sink.write(&second).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let line: serde_json::Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        for field in [
            "operation_kind",
            "actor_id",
            "outcome",
            "duration_micros",
            "context",
            "timestamp",
        ] {
            assert!(line.get(field).is_some(), "missing {field}");
        }
        assert_eq!(line["outcome"], "success");

        let records = JsonlFileSink::read_all(&path).unwrap();
        assert_eq!(records, vec![first, second]);
    }
}
