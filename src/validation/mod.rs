pub mod rules;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::gateway::operation::OperationOutput;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// HMAC secret for the `signature` integrity rule
    #[serde(default)]
    pub signing_secret: Option<String>,
}

/// Evaluation tier. Tiers run in declaration order of this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleTier {
    Structural,
    Business,
    Integrity,
}

impl RuleTier {
    pub const ORDER: [RuleTier; 3] = [RuleTier::Structural, RuleTier::Business, RuleTier::Integrity];
}

/// A rule reference attached to an operation: which rule, which field, and
/// the rule's parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDescriptor {
    pub rule: String,
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub params: Value,
    /// Overrides the rule's default message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RuleDescriptor {
    pub fn new(rule: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            field: field.into(),
            params: Value::Null,
            message: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub(crate) fn field_name(&self) -> &str {
        if self.field.is_empty() {
            "payload"
        } else {
            &self.field
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Either valid with no errors, or invalid with at least one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    valid: bool,
    errors: Vec<FieldError>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn from_errors(errors: Vec<FieldError>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn errors(&self) -> &[FieldError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<FieldError> {
        self.errors
    }
}

/// Programmer errors in rule declarations. A rule that merely fails is
/// reported through [`ValidationResult`] instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("unknown rule identifier '{0}'")]
    UnknownRule(String),
    #[error("rule '{rule}' has invalid parameters: {reason}")]
    InvalidParams { rule: String, reason: String },
}

impl RuleError {
    pub fn params(rule: &str, reason: impl Into<String>) -> Self {
        RuleError::InvalidParams {
            rule: rule.to_string(),
            reason: reason.into(),
        }
    }
}

/// Pure predicate: `Ok(None)` passes, `Ok(Some(message))` fails.
pub type RuleFn = Arc<dyn Fn(&Value, &RuleDescriptor) -> Result<Option<String>, RuleError> + Send + Sync>;

#[derive(Clone)]
struct RegisteredRule {
    tier: RuleTier,
    check: RuleFn,
}

/// Three-tier payload validation: structural, business, integrity.
#[derive(Clone)]
pub struct ValidationEngine {
    rules: HashMap<String, RegisteredRule>,
}

impl std::fmt::Debug for ValidationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.rules.keys().collect();
        names.sort();
        f.debug_struct("ValidationEngine").field("rules", &names).finish()
    }
}

impl ValidationEngine {
    /// Engine with the built-in rule set.
    pub fn new(config: &ValidationConfig) -> Self {
        let mut engine = Self {
            rules: HashMap::new(),
        };
        rules::register_builtins(&mut engine, config);
        engine
    }

    /// Add or replace a rule under `id`.
    pub fn register<F>(&mut self, id: impl Into<String>, tier: RuleTier, check: F)
    where
        F: Fn(&Value, &RuleDescriptor) -> Result<Option<String>, RuleError> + Send + Sync + 'static,
    {
        self.rules.insert(
            id.into(),
            RegisteredRule {
                tier,
                check: Arc::new(check),
            },
        );
    }

    pub fn tier_of(&self, id: &str) -> Option<RuleTier> {
        self.rules.get(id).map(|r| r.tier)
    }

    /// Errors accumulate within a tier; a tier only runs when every earlier
    /// tier came back clean.
    pub fn validate(&self, payload: &Value, descriptors: &[RuleDescriptor]) -> Result<ValidationResult, RuleError> {
        let resolved = descriptors
            .iter()
            .map(|d| {
                self.rules
                    .get(&d.rule)
                    .map(|r| (d, r))
                    .ok_or_else(|| RuleError::UnknownRule(d.rule.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        for tier in RuleTier::ORDER {
            let mut errors = Vec::new();
            for (descriptor, rule) in resolved.iter().filter(|(_, r)| r.tier == tier) {
                if let Some(default_message) = (rule.check)(payload, descriptor)? {
                    let message = descriptor.message.clone().unwrap_or(default_message);
                    errors.push(FieldError::new(descriptor.field_name(), message));
                }
            }
            if !errors.is_empty() {
                return Ok(ValidationResult::from_errors(errors));
            }
        }
        Ok(ValidationResult::ok())
    }

    /// Result invariants checked after an operation body returns: an object
    /// with a non-null `id` and every listed field populated.
    pub fn verify_result(&self, output: &OperationOutput, required_fields: &[String]) -> ValidationResult {
        let Some(obj) = output.0.as_object() else {
            return ValidationResult::from_errors(vec![FieldError::new("result", "must be an object")]);
        };

        let mut errors = Vec::new();
        if output.id().is_none() {
            errors.push(FieldError::new("id", "result id must not be null"));
        }
        for field in required_fields {
            let populated = match obj.get(field) {
                None | Some(Value::Null) => false,
                Some(Value::String(s)) => !s.trim().is_empty(),
                Some(_) => true,
            };
            if !populated {
                errors.push(FieldError::new(field.clone(), "required result field is not populated"));
            }
        }
        ValidationResult::from_errors(errors)
    }
}

impl Default for ValidationEngine {
    fn default() -> Self {
        Self::new(&ValidationConfig::default())
    }
}
