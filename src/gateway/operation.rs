use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;
use uuid::Uuid;

use crate::backup::BackupPointId;
use crate::persistence::TransactionId;
use crate::validation::RuleDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Critical,
    Normal,
}

/// Who is asking, from where, and when. Built once per external request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub actor_id: String,
    pub origin: IpAddr,
    pub timestamp: DateTime<Utc>,
    pub operation_type: OperationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_fingerprint: Option<String>,
}

impl SecurityContext {
    pub fn new(actor_id: impl Into<String>, origin: IpAddr, operation_type: OperationType) -> Self {
        Self {
            actor_id: actor_id.into(),
            origin,
            timestamp: Utc::now(),
            operation_type,
            request_fingerprint: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.request_fingerprint = Some(fingerprint.into());
        self
    }

    /// JSON snapshot embedded in audit records.
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A state-mutating request routed through the gateway. Immutable once built.
#[derive(Debug, Clone)]
pub struct Operation {
    kind: String,
    payload: Value,
    required_permissions: BTreeSet<String>,
    validation_rules: Vec<RuleDescriptor>,
    cache_tags: Vec<String>,
    result_fields: Vec<String>,
    deadline: Option<Duration>,
}

impl Operation {
    pub fn builder(kind: impl Into<String>, payload: Value) -> OperationBuilder {
        OperationBuilder {
            op: Operation {
                kind: kind.into(),
                payload,
                required_permissions: BTreeSet::new(),
                validation_rules: Vec::new(),
                cache_tags: Vec::new(),
                result_fields: Vec::new(),
                deadline: None,
            },
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn required_permissions(&self) -> &BTreeSet<String> {
        &self.required_permissions
    }

    pub fn validation_rules(&self) -> &[RuleDescriptor] {
        &self.validation_rules
    }

    pub fn cache_tags(&self) -> &[String] {
        &self.cache_tags
    }

    pub fn result_fields(&self) -> &[String] {
        &self.result_fields
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    pub fn rate_limit_key(&self, actor_id: &str) -> String {
        crate::security::rate_limit::RateLimiter::bucket_key(actor_id, &self.kind)
    }
}

#[derive(Debug, Clone)]
pub struct OperationBuilder {
    op: Operation,
}

impl OperationBuilder {
    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.op.required_permissions.insert(permission.into());
        self
    }

    pub fn rule(mut self, rule: RuleDescriptor) -> Self {
        self.op.validation_rules.push(rule);
        self
    }

    pub fn rules(mut self, rules: impl IntoIterator<Item = RuleDescriptor>) -> Self {
        self.op.validation_rules.extend(rules);
        self
    }

    /// Cache group invalidated after a successful commit.
    pub fn invalidates(mut self, tag: impl Into<String>) -> Self {
        self.op.cache_tags.push(tag.into());
        self
    }

    /// Field the result must populate, in addition to `id`.
    pub fn requires_result_field(mut self, field: impl Into<String>) -> Self {
        self.op.result_fields.push(field.into());
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.op.deadline = Some(deadline);
        self
    }

    pub fn build(self) -> Operation {
        self.op
    }
}

/// Value returned by an operation body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationOutput(pub Value);

impl OperationOutput {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn id(&self) -> Option<&Value> {
        self.0.get("id").filter(|v| !v.is_null())
    }

    pub fn into_inner(self) -> Value {
        self.0
    }
}

/// Handles given to an operation body for one execution.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub operation_id: Uuid,
    pub transaction: TransactionId,
    pub backup_point: BackupPointId,
    pub kind: String,
    pub actor_id: String,
    pub payload: Value,
}

/// The work performed inside the protection scope.
#[async_trait]
pub trait OperationBody: Send + Sync {
    async fn run(&self, ctx: ExecutionContext) -> Result<OperationOutput>;
}

#[async_trait]
impl<F, Fut> OperationBody for F
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<OperationOutput>> + Send + 'static,
{
    async fn run(&self, ctx: ExecutionContext) -> Result<OperationOutput> {
        (self)(ctx).await
    }
}
