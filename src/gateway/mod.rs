mod guard;
pub mod operation;

use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::backup::{BackupError, BackupManager, BackupPointId, ManifestTampered};
use crate::cache::CacheManager;
use crate::config::GatewayConfig;
use crate::crypto::CryptoError;
use crate::error::GatewayError;
use crate::monitoring::alerts::{Alert, AlertDispatcher, Severity};
use crate::monitoring::{MonitoringSpan, OperationMonitor};
use crate::persistence::{TransactionId, TransactionManager};
use crate::security::access::{AccessControl, PermissionStore};
use crate::security::audit_log::{AuditLogger, AuditRecord, Outcome};
use crate::security::rate_limit::{RateDecision, RateLimiter};
use crate::validation::{FieldError, ValidationEngine};
use guard::{Scope, ScopeGuard};

pub use operation::{
    ExecutionContext, Operation, OperationBody, OperationBuilder, OperationOutput, OperationType,
    SecurityContext,
};

/// Why a protected operation took the failure path.
#[derive(Debug, Error)]
enum Failure {
    #[error("{0:#}")]
    Body(anyhow::Error),
    #[error("result verification failed: {}", join_fields(.0))]
    Verification(Vec<FieldError>),
    #[error("deadline of {}ms exceeded", .0.as_millis())]
    Deadline(Duration),
    #[error("operation cancelled")]
    Cancelled,
    #[error("commit failed: {0:#}")]
    Commit(anyhow::Error),
}

impl Failure {
    fn stage(&self) -> &'static str {
        match self {
            Failure::Body(_) => "execute",
            Failure::Verification(_) => "verify",
            Failure::Deadline(_) => "deadline",
            Failure::Cancelled => "cancelled",
            Failure::Commit(_) => "commit",
        }
    }

    /// Tampering surfaced anywhere in the error chain.
    fn is_integrity(&self) -> bool {
        let err = match self {
            Failure::Body(e) | Failure::Commit(e) => e,
            _ => return false,
        };
        err.chain().any(|cause| {
            cause
                .downcast_ref::<CryptoError>()
                .is_some_and(CryptoError::is_integrity)
                || matches!(cause.downcast_ref::<BackupError>(), Some(BackupError::Integrity(_)))
                || cause.downcast_ref::<ManifestTampered>().is_some()
        })
    }
}

fn join_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Single entry point for state-mutating operations.
///
/// Every call runs validate, authorize, rate limit, then the body inside a
/// transaction guarded by a backup point, and leaves exactly one audit record.
pub struct SecurityGateway {
    validation: Arc<ValidationEngine>,
    access: AccessControl,
    rate_limiter: Arc<RateLimiter>,
    transactions: Arc<dyn TransactionManager>,
    backups: Arc<BackupManager>,
    cache: CacheManager,
    audit: Arc<AuditLogger>,
    alerts: Option<AlertDispatcher>,
    monitor: OperationMonitor,
    default_deadline: Option<Duration>,
}

impl std::fmt::Debug for SecurityGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityGateway")
            .field("validation", &self.validation)
            .field("access", &self.access)
            .field("rate_limiter", &self.rate_limiter)
            .field("backups", &self.backups)
            .field("audit", &self.audit)
            .field("default_deadline", &self.default_deadline)
            .finish()
    }
}

impl SecurityGateway {
    pub fn builder(
        transactions: Arc<dyn TransactionManager>,
        access: AccessControl,
    ) -> SecurityGatewayBuilder {
        SecurityGatewayBuilder {
            transactions,
            access,
            validation: None,
            rate_limiter: None,
            backups: None,
            cache: None,
            audit: None,
            alerts: None,
            monitor: None,
            default_deadline: None,
        }
    }

    /// Wire every component from configuration.
    pub fn from_config(
        config: &GatewayConfig,
        transactions: Arc<dyn TransactionManager>,
        permissions: Arc<dyn PermissionStore>,
    ) -> Result<Self> {
        let alerts = AlertDispatcher::from_config(&config.alerts)?;
        let audit = AuditLogger::from_config(&config.audit, Some(alerts.clone()));
        let access = AccessControl::new(permissions, config.access.clone());
        Ok(Self::builder(transactions, access)
            .validation(ValidationEngine::new(&config.validation))
            .rate_limiter(RateLimiter::new(config.rate_limits.clone()))
            .backups(BackupManager::from_config(&config.backup)?)
            .audit(audit)
            .alerts(alerts)
            .default_deadline(config.default_deadline())
            .build())
    }

    pub fn monitor(&self) -> &OperationMonitor {
        &self.monitor
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub async fn execute(
        &self,
        operation: &Operation,
        context: &SecurityContext,
        body: &dyn OperationBody,
    ) -> Result<OperationOutput, GatewayError> {
        self.execute_with_cancel(operation, context, body, CancellationToken::new())
            .await
    }

    /// As [`execute`](Self::execute); cancelling `cancel` while the body runs
    /// takes the failure path.
    pub async fn execute_with_cancel(
        &self,
        operation: &Operation,
        context: &SecurityContext,
        body: &dyn OperationBody,
        cancel: CancellationToken,
    ) -> Result<OperationOutput, GatewayError> {
        let operation_id = Uuid::new_v4();
        let started = Instant::now();

        let result = match self
            .validation
            .validate(operation.payload(), operation.validation_rules())
        {
            Ok(result) => result,
            Err(e) => {
                let err = GatewayError::InvalidRule(e.to_string());
                self.deny(operation_id, operation, context, started, &err).await;
                return Err(err);
            }
        };
        if !result.is_valid() {
            let err = GatewayError::Validation {
                errors: result.into_errors(),
            };
            self.deny(operation_id, operation, context, started, &err).await;
            return Err(err);
        }

        if let Err(denied) = self
            .access
            .authorize(context, operation.kind(), operation.required_permissions())
            .await
        {
            let err = GatewayError::Authorization {
                actor_id: context.actor_id.clone(),
                reason: denied.reason,
            };
            self.deny(operation_id, operation, context, started, &err).await;
            return Err(err);
        }

        if let RateDecision::Denied { retry_after } = self
            .rate_limiter
            .check_operation(&context.actor_id, operation.kind())
        {
            let err = GatewayError::RateLimited { retry_after };
            self.deny(operation_id, operation, context, started, &err).await;
            return Err(err);
        }

        let span = self
            .monitor
            .start_span(operation_id, operation.kind(), &context.actor_id);
        let scope = span.span().clone();
        self.run_protected(operation, context, body, cancel, span, started)
            .instrument(scope)
            .await
    }

    async fn run_protected(
        &self,
        operation: &Operation,
        context: &SecurityContext,
        body: &dyn OperationBody,
        cancel: CancellationToken,
        span: MonitoringSpan,
        started: Instant,
    ) -> Result<OperationOutput, GatewayError> {
        let operation_id = span.operation_id();

        let backup_point = match self.backups.create_backup_point().await {
            Ok(id) => id,
            Err(e) => {
                let err = GatewayError::OperationFailed {
                    operation_id,
                    message: e.to_string(),
                };
                self.audit_failure(operation, context, started, &err, "backup").await;
                span.close(Outcome::Failure);
                return Err(err);
            }
        };

        // Unwinds the scope if this future is dropped before it finishes.
        let mut guard = ScopeGuard::new(Scope::new(
            operation_id,
            operation.kind().to_string(),
            context.actor_id.clone(),
            context.snapshot(),
            started,
            backup_point,
            operation.cache_tags().to_vec(),
            self.transactions.clone(),
            self.backups.clone(),
            self.cache.clone(),
            self.audit.clone(),
            self.alerts.clone(),
        ));

        let transaction = match self.transactions.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                let err = GatewayError::OperationFailed {
                    operation_id,
                    message: format!("could not begin transaction: {e:#}"),
                };
                self.backups.cleanup_backup_point(backup_point).await;
                guard.release();
                self.audit_failure(operation, context, started, &err, "begin").await;
                span.close(Outcome::Failure);
                return Err(err);
            }
        };
        guard.transaction_opened(transaction);
        debug!(%operation_id, %transaction, %backup_point, "protection scope opened");

        let exec = ExecutionContext {
            operation_id,
            transaction,
            backup_point,
            kind: operation.kind().to_string(),
            actor_id: context.actor_id.clone(),
            payload: operation.payload().clone(),
        };
        let deadline = operation.deadline().or(self.default_deadline);

        let outcome = match self.run_body(operation, body, exec, deadline, &cancel).await {
            Ok(output) => self
                .transactions
                .commit(transaction)
                .await
                .map(|()| output)
                .map_err(Failure::Commit),
            Err(failure) => Err(failure),
        };

        match outcome {
            Ok(output) => {
                guard.committed();
                self.backups.cleanup_backup_point(backup_point).await;
                if !operation.cache_tags().is_empty() {
                    self.cache.invalidate_tags(operation.cache_tags()).await;
                }
                guard.release();
                self.audit
                    .record(AuditRecord::new(
                        operation_id,
                        operation.kind(),
                        &context.actor_id,
                        Outcome::Success,
                        started.elapsed(),
                        context.snapshot(),
                    ))
                    .await;
                info!(%operation_id, kind = operation.kind(), actor_id = %context.actor_id, "operation committed");
                span.close(Outcome::Success);
                Ok(output)
            }
            Err(failure) => {
                let err = self
                    .recover(operation_id, transaction, backup_point, &failure, &mut guard)
                    .await;
                self.backups.cleanup_backup_point(backup_point).await;
                guard.release();
                self.audit_failure(operation, context, started, &err, failure.stage())
                    .await;
                self.raise_alert(&err, operation, context).await;
                span.close(Outcome::Failure);
                Err(err)
            }
        }
    }

    async fn run_body(
        &self,
        operation: &Operation,
        body: &dyn OperationBody,
        exec: ExecutionContext,
        deadline: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<OperationOutput, Failure> {
        let run = async {
            match deadline {
                Some(limit) => match tokio::time::timeout(limit, body.run(exec)).await {
                    Ok(result) => result.map_err(Failure::Body),
                    Err(_) => Err(Failure::Deadline(limit)),
                },
                None => body.run(exec).await.map_err(Failure::Body),
            }
        };

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Failure::Cancelled),
            result = run => result?,
        };

        let verified = self
            .validation
            .verify_result(&output, operation.result_fields());
        if !verified.is_valid() {
            return Err(Failure::Verification(verified.into_errors()));
        }
        Ok(output)
    }

    /// Roll back and restore, then classify the failure.
    async fn recover(
        &self,
        operation_id: Uuid,
        transaction: TransactionId,
        backup_point: BackupPointId,
        failure: &Failure,
        guard: &mut ScopeGuard,
    ) -> GatewayError {
        warn!(%operation_id, stage = failure.stage(), error = %failure, "operation failed, rolling back");

        let mut recovery_errors = Vec::new();
        let rolled_back = self.transactions.rollback(transaction).await;
        guard.transaction_closed();
        if let Err(e) = rolled_back {
            recovery_errors.push(format!("rollback failed: {e:#}"));
        }
        if let Err(e) = self.backups.restore_from_point(backup_point).await {
            recovery_errors.push(e.to_string());
        }

        if !recovery_errors.is_empty() {
            error!(%operation_id, errors = ?recovery_errors, "recovery failed");
            return GatewayError::SystemFailure {
                operation_id,
                message: format!("{}; after: {failure}", recovery_errors.join("; ")),
            };
        }
        if failure.is_integrity() {
            return GatewayError::Integrity {
                operation_id,
                message: failure.to_string(),
            };
        }
        GatewayError::OperationFailed {
            operation_id,
            message: failure.to_string(),
        }
    }

    async fn deny(
        &self,
        operation_id: Uuid,
        operation: &Operation,
        context: &SecurityContext,
        started: Instant,
        err: &GatewayError,
    ) {
        self.monitor.record_denied();
        info!(%operation_id, kind = operation.kind(), actor_id = %context.actor_id, reason = %err, "operation denied");
        self.audit
            .record(
                AuditRecord::new(
                    operation_id,
                    operation.kind(),
                    &context.actor_id,
                    Outcome::Denied,
                    started.elapsed(),
                    context.snapshot(),
                )
                .with_error(err.to_string()),
            )
            .await;
    }

    async fn audit_failure(
        &self,
        operation: &Operation,
        context: &SecurityContext,
        started: Instant,
        err: &GatewayError,
        stage: &str,
    ) {
        let mut snapshot = context.snapshot();
        if let Value::Object(map) = &mut snapshot {
            map.insert("failure_stage".into(), Value::String(stage.to_string()));
        }
        let operation_id = err.operation_id().unwrap_or_default();
        self.audit
            .record(
                AuditRecord::new(
                    operation_id,
                    operation.kind(),
                    &context.actor_id,
                    Outcome::Failure,
                    started.elapsed(),
                    snapshot,
                )
                .with_error(err.to_string()),
            )
            .await;
    }

    async fn raise_alert(&self, err: &GatewayError, operation: &Operation, context: &SecurityContext) {
        let Some(severity) = err.severity() else {
            return;
        };
        let message = match severity {
            Severity::Emergency => format!("recovery failed for {}", operation.kind()),
            _ => format!("integrity failure in {}", operation.kind()),
        };
        let alert = Alert::new(
            severity,
            message,
            json!({
                "operation_id": err.operation_id(),
                "operation_kind": operation.kind(),
                "actor_id": context.actor_id,
                "error": err.to_string(),
            }),
        );
        match &self.alerts {
            Some(dispatcher) => dispatcher.dispatch(alert).await,
            None => {
                error!(target: "audit_fallback", severity = ?alert.severity, message = %alert.message, "no alert channel configured")
            }
        }
    }
}

pub struct SecurityGatewayBuilder {
    transactions: Arc<dyn TransactionManager>,
    access: AccessControl,
    validation: Option<ValidationEngine>,
    rate_limiter: Option<RateLimiter>,
    backups: Option<BackupManager>,
    cache: Option<CacheManager>,
    audit: Option<AuditLogger>,
    alerts: Option<AlertDispatcher>,
    monitor: Option<OperationMonitor>,
    default_deadline: Option<Duration>,
}

impl SecurityGatewayBuilder {
    pub fn validation(mut self, engine: ValidationEngine) -> Self {
        self.validation = Some(engine);
        self
    }

    pub fn rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn backups(mut self, backups: BackupManager) -> Self {
        self.backups = Some(backups);
        self
    }

    pub fn cache(mut self, cache: CacheManager) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn audit(mut self, audit: AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn alerts(mut self, alerts: AlertDispatcher) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn monitor(mut self, monitor: OperationMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn default_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.default_deadline = deadline;
        self
    }

    /// Unset components fall back to defaults: built-in rules, 60/min
    /// limits, no-op snapshots, log-only audit.
    pub fn build(self) -> SecurityGateway {
        SecurityGateway {
            validation: Arc::new(self.validation.unwrap_or_default()),
            access: self.access,
            rate_limiter: Arc::new(self.rate_limiter.unwrap_or_else(|| RateLimiter::new_per_minute(60))),
            transactions: self.transactions,
            backups: Arc::new(self.backups.unwrap_or_else(|| {
                BackupManager::new(Arc::new(crate::backup::NullSnapshotStore))
            })),
            cache: self.cache.unwrap_or_default(),
            audit: Arc::new(self.audit.unwrap_or_else(|| {
                AuditLogger::new(vec![Arc::new(crate::security::audit_log::TracingSink)])
            })),
            alerts: self.alerts,
            monitor: self.monitor.unwrap_or_default(),
            default_deadline: self.default_deadline,
        }
    }
}
