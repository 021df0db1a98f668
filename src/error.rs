use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::monitoring::alerts::Severity;
use crate::validation::FieldError;

/// Errors returned by [`crate::gateway::SecurityGateway`].
///
/// The first three variants are rejections of the caller's request and are
/// produced before any side effect exists. The remaining variants mean the
/// system failed to complete a request it had accepted.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("validation failed: {}", summarize(.errors))]
    Validation { errors: Vec<FieldError> },

    #[error("actor '{actor_id}' is not authorized: {reason}")]
    Authorization { actor_id: String, reason: String },

    #[error("rate limit exceeded, retry after {}ms", .retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    #[error("integrity violation in operation {operation_id}: {message}")]
    Integrity { operation_id: Uuid, message: String },

    #[error("operation {operation_id} failed: {message}")]
    OperationFailed { operation_id: Uuid, message: String },

    #[error("system failure during recovery of operation {operation_id}: {message}")]
    SystemFailure { operation_id: Uuid, message: String },

    #[error("invalid validation rule: {0}")]
    InvalidRule(String),
}

impl GatewayError {
    /// True when the request was rejected because of the caller's input,
    /// permissions or request rate.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            GatewayError::Validation { .. }
                | GatewayError::Authorization { .. }
                | GatewayError::RateLimited { .. }
        )
    }

    /// Alert severity for failures that must reach an operator.
    pub fn severity(&self) -> Option<Severity> {
        match self {
            GatewayError::Integrity { .. } => Some(Severity::Critical),
            GatewayError::SystemFailure { .. } => Some(Severity::Emergency),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            GatewayError::Validation { errors } => errors,
            _ => &[],
        }
    }

    pub fn operation_id(&self) -> Option<Uuid> {
        match self {
            GatewayError::Integrity { operation_id, .. }
            | GatewayError::OperationFailed { operation_id, .. }
            | GatewayError::SystemFailure { operation_id, .. } => Some(*operation_id),
            _ => None,
        }
    }
}

fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}
