use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};
use uuid::Uuid;

use crate::backup::{BackupManager, BackupPointId};
use crate::cache::CacheManager;
use crate::monitoring::alerts::{Alert, AlertDispatcher, Severity};
use crate::persistence::{TransactionId, TransactionManager};
use crate::security::audit_log::{AuditLogger, AuditRecord, Outcome};

/// Everything needed to finish a protection scope without the caller.
pub(crate) struct Scope {
    operation_id: Uuid,
    kind: String,
    actor_id: String,
    context: Value,
    started: Instant,
    backup_point: BackupPointId,
    cache_tags: Vec<String>,
    transactions: Arc<dyn TransactionManager>,
    backups: Arc<BackupManager>,
    cache: CacheManager,
    audit: Arc<AuditLogger>,
    alerts: Option<AlertDispatcher>,
    transaction: Option<TransactionId>,
    committed: bool,
}

/// Armed from backup point creation until the inline path has done its
/// recovery work. Dropping it armed, which happens when the `execute`
/// future is dropped, spawns the remaining steps onto the runtime.
pub(crate) struct ScopeGuard {
    scope: Option<Scope>,
}

impl Scope {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        operation_id: Uuid,
        kind: String,
        actor_id: String,
        context: Value,
        started: Instant,
        backup_point: BackupPointId,
        cache_tags: Vec<String>,
        transactions: Arc<dyn TransactionManager>,
        backups: Arc<BackupManager>,
        cache: CacheManager,
        audit: Arc<AuditLogger>,
        alerts: Option<AlertDispatcher>,
    ) -> Self {
        Self {
            operation_id,
            kind,
            actor_id,
            context,
            started,
            backup_point,
            cache_tags,
            transactions,
            backups,
            cache,
            audit,
            alerts,
            transaction: None,
            committed: false,
        }
    }

    async fn unwind(self) {
        if self.committed {
            self.finish_committed().await;
        } else {
            self.roll_back().await;
        }
    }

    async fn finish_committed(self) {
        self.backups.cleanup_backup_point(self.backup_point).await;
        if !self.cache_tags.is_empty() {
            self.cache.invalidate_tags(&self.cache_tags).await;
        }
        self.audit
            .record(AuditRecord::new(
                self.operation_id,
                &self.kind,
                &self.actor_id,
                Outcome::Success,
                self.started.elapsed(),
                self.context,
            ))
            .await;
    }

    async fn roll_back(self) {
        let operation_id = self.operation_id;
        warn!(%operation_id, kind = %self.kind, "execute dropped mid-operation, rolling back");

        let mut errors = Vec::new();
        if let Some(tx) = self.transaction {
            if let Err(e) = self.transactions.rollback(tx).await {
                errors.push(format!("rollback failed: {e:#}"));
            }
        }
        if let Err(e) = self.backups.restore_from_point(self.backup_point).await {
            errors.push(e.to_string());
        }
        self.backups.cleanup_backup_point(self.backup_point).await;

        let message = if errors.is_empty() {
            "operation dropped by caller".to_string()
        } else {
            error!(%operation_id, errors = ?errors, "recovery failed");
            format!("{}; after: operation dropped by caller", errors.join("; "))
        };

        let mut context = self.context;
        if let Value::Object(map) = &mut context {
            map.insert("failure_stage".into(), Value::String("dropped".into()));
        }
        self.audit
            .record(
                AuditRecord::new(
                    operation_id,
                    &self.kind,
                    &self.actor_id,
                    Outcome::Failure,
                    self.started.elapsed(),
                    context,
                )
                .with_error(message.clone()),
            )
            .await;

        if !errors.is_empty() {
            if let Some(alerts) = &self.alerts {
                let alert = Alert::new(
                    Severity::Emergency,
                    format!("recovery failed for {}", self.kind),
                    json!({
                        "operation_id": operation_id,
                        "operation_kind": self.kind,
                        "actor_id": self.actor_id,
                        "error": message,
                    }),
                );
                alerts.dispatch(alert).await;
            }
        }
    }
}

impl ScopeGuard {
    pub(crate) fn new(scope: Scope) -> Self {
        Self { scope: Some(scope) }
    }

    pub(crate) fn transaction_opened(&mut self, tx: TransactionId) {
        if let Some(scope) = &mut self.scope {
            scope.transaction = Some(tx);
        }
    }

    /// Rollback was attempted inline; it must not run again.
    pub(crate) fn transaction_closed(&mut self) {
        if let Some(scope) = &mut self.scope {
            scope.transaction = None;
        }
    }

    /// After commit the backup point must not be restored.
    pub(crate) fn committed(&mut self) {
        if let Some(scope) = &mut self.scope {
            scope.transaction = None;
            scope.committed = true;
        }
    }

    /// The inline path finished its recovery work.
    pub(crate) fn release(mut self) {
        self.scope = None;
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let Some(scope) = self.scope.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(scope.unwind());
            }
            Err(_) => {
                error!(
                    target: "audit_fallback",
                    operation_id = %scope.operation_id,
                    kind = %scope.kind,
                    "execute dropped outside a runtime, protection scope left open"
                );
            }
        }
    }
}
