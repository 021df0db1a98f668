use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::gateway::operation::SecurityContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Maximum allowed distance between the request timestamp and now
    #[serde(default = "default_max_skew")]
    pub max_clock_skew_secs: i64,
}

fn default_max_skew() -> i64 {
    300
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            max_clock_skew_secs: default_max_skew(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct AccessDenied {
    pub reason: String,
}

impl AccessDenied {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Answers `(actor, permission) -> bool`.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn has_permission(&self, actor_id: &str, permission: &str) -> bool;
}

/// Permission grants held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPermissionStore {
    grants: Arc<RwLock<HashMap<String, HashSet<String>>>>,
}

impl InMemoryPermissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn grant(&self, actor_id: &str, permission: &str) {
        let mut grants = self.grants.write().await;
        grants
            .entry(actor_id.to_string())
            .or_default()
            .insert(permission.to_string());
    }

    pub async fn revoke(&self, actor_id: &str, permission: &str) {
        let mut grants = self.grants.write().await;
        if let Some(set) = grants.get_mut(actor_id) {
            set.remove(permission);
        }
    }

    /// Parse a comma separated grant list such as `content.create,content.update`.
    pub async fn grant_list(&self, actor_id: &str, list: &str) {
        for item in list.split(',') {
            let permission = item.trim();
            if !permission.is_empty() {
                self.grant(actor_id, permission).await;
            }
        }
    }
}

#[async_trait]
impl PermissionStore for InMemoryPermissionStore {
    async fn has_permission(&self, actor_id: &str, permission: &str) -> bool {
        let grants = self.grants.read().await;
        grants
            .get(actor_id)
            .is_some_and(|set| set.contains(permission))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(String),
}

/// Hook for suspicious-access detection. No heuristic ships with the crate.
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    async fn evaluate(&self, context: &SecurityContext, operation_kind: &str) -> PolicyDecision;
}

#[derive(Debug, Clone, Default)]
pub struct AllowAllPolicy;

#[async_trait]
impl AccessPolicy for AllowAllPolicy {
    async fn evaluate(&self, _context: &SecurityContext, _operation_kind: &str) -> PolicyDecision {
        PolicyDecision::Allow
    }
}

/// Authentication and permission checks against a security context.
#[derive(Clone)]
pub struct AccessControl {
    store: Arc<dyn PermissionStore>,
    policy: Arc<dyn AccessPolicy>,
    config: AccessConfig,
}

impl std::fmt::Debug for AccessControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessControl")
            .field("config", &self.config)
            .finish()
    }
}

impl AccessControl {
    pub fn new(store: Arc<dyn PermissionStore>, config: AccessConfig) -> Self {
        Self {
            store,
            policy: Arc::new(AllowAllPolicy),
            config,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// The context must name an actor and carry a fresh timestamp.
    pub fn authenticate(&self, context: &SecurityContext) -> Result<(), AccessDenied> {
        if context.actor_id.trim().is_empty() {
            return Err(AccessDenied::new("unauthenticated request"));
        }
        let skew = (Utc::now() - context.timestamp).num_seconds().abs();
        if skew > self.config.max_clock_skew_secs {
            return Err(AccessDenied::new(format!(
                "stale request (timestamp skew {skew}s)"
            )));
        }
        Ok(())
    }

    /// Pure lookup: true when the actor holds every permission.
    pub async fn check(&self, context: &SecurityContext, permissions: &BTreeSet<String>) -> bool {
        self.missing_permissions(context, permissions).await.is_empty()
    }

    pub async fn missing_permissions(
        &self,
        context: &SecurityContext,
        permissions: &BTreeSet<String>,
    ) -> Vec<String> {
        let mut missing = Vec::new();
        for permission in permissions {
            if !self.store.has_permission(&context.actor_id, permission).await {
                missing.push(permission.clone());
            }
        }
        missing
    }

    /// Authentication, permission lookup, then the access policy.
    pub async fn authorize(
        &self,
        context: &SecurityContext,
        operation_kind: &str,
        permissions: &BTreeSet<String>,
    ) -> Result<(), AccessDenied> {
        self.authenticate(context)?;

        let missing = self.missing_permissions(context, permissions).await;
        if !missing.is_empty() {
            debug!(actor_id = %context.actor_id, kind = operation_kind, ?missing, "permission check failed");
            return Err(AccessDenied::new(format!(
                "missing permission(s): {}",
                missing.join(", ")
            )));
        }

        match self.policy.evaluate(context, operation_kind).await {
            PolicyDecision::Allow => Ok(()),
            PolicyDecision::Deny(reason) => Err(AccessDenied::new(reason)),
        }
    }
}
