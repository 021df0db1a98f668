use base64::{engine::general_purpose, Engine};
use hmac::{Hmac, Mac};
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::{RuleDescriptor, RuleError, RuleTier, ValidationConfig, ValidationEngine};

type HmacSha256 = Hmac<Sha256>;

pub(super) fn register_builtins(engine: &mut ValidationEngine, config: &ValidationConfig) {
    engine.register("required", RuleTier::Structural, required);
    engine.register("type", RuleTier::Structural, type_of);
    engine.register("min_length", RuleTier::Structural, min_length);
    engine.register("max_length", RuleTier::Structural, max_length);
    engine.register("pattern", RuleTier::Structural, pattern);
    engine.register("one_of", RuleTier::Structural, one_of);

    engine.register("monotonic", RuleTier::Business, monotonic);
    engine.register("depends_on", RuleTier::Business, depends_on);
    engine.register("not_equal", RuleTier::Business, not_equal);

    engine.register("checksum", RuleTier::Integrity, checksum);
    let secret = config.signing_secret.clone();
    engine.register("signature", RuleTier::Integrity, move |payload, d| {
        let Some(secret) = secret.as_deref() else {
            return Err(RuleError::params(&d.rule, "no signing secret configured"));
        };
        signature(payload, d, secret)
    });
}

/// Look up a dotted path such as `meta.author`.
pub fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(payload);
    }
    path.split('.')
        .try_fold(payload, |v, key| v.get(key))
        .filter(|v| !v.is_null())
}

fn param_str<'a>(d: &'a RuleDescriptor, key: &str) -> Result<&'a str, RuleError> {
    d.params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| RuleError::params(&d.rule, format!("missing string param '{key}'")))
}

fn param_u64(d: &RuleDescriptor, key: &str) -> Result<u64, RuleError> {
    d.params
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| RuleError::params(&d.rule, format!("missing integer param '{key}'")))
}

fn param_array<'a>(d: &'a RuleDescriptor, key: &str) -> Result<&'a Vec<Value>, RuleError> {
    d.params
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| RuleError::params(&d.rule, format!("missing array param '{key}'")))
}

fn measure(v: &Value) -> Option<usize> {
    match v {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(a) => Some(a.len()),
        _ => None,
    }
}

fn required(payload: &Value, d: &RuleDescriptor) -> Result<Option<String>, RuleError> {
    Ok(match lookup(payload, &d.field) {
        None => Some("is required".to_string()),
        Some(Value::String(s)) if s.trim().is_empty() => Some("must not be empty".to_string()),
        Some(_) => None,
    })
}

fn type_of(payload: &Value, d: &RuleDescriptor) -> Result<Option<String>, RuleError> {
    let expected = param_str(d, "type")?;
    let Some(v) = lookup(payload, &d.field) else {
        return Ok(None);
    };
    let matches = match expected {
        "string" => v.is_string(),
        "number" => v.is_number(),
        "integer" => v.is_i64() || v.is_u64(),
        "boolean" => v.is_boolean(),
        "object" => v.is_object(),
        "array" => v.is_array(),
        other => return Err(RuleError::params(&d.rule, format!("unsupported type '{other}'"))),
    };
    Ok((!matches).then(|| format!("must be of type {expected}")))
}

fn min_length(payload: &Value, d: &RuleDescriptor) -> Result<Option<String>, RuleError> {
    let min = param_u64(d, "value")? as usize;
    let Some(v) = lookup(payload, &d.field) else {
        return Ok(None);
    };
    Ok(match measure(v) {
        Some(len) if len >= min => None,
        Some(_) => Some(format!("must have at least {min} characters or items")),
        None => Some("must be a string or array".to_string()),
    })
}

fn max_length(payload: &Value, d: &RuleDescriptor) -> Result<Option<String>, RuleError> {
    let max = param_u64(d, "value")? as usize;
    let Some(v) = lookup(payload, &d.field) else {
        return Ok(None);
    };
    Ok(match measure(v) {
        Some(len) if len <= max => None,
        Some(_) => Some(format!("must have at most {max} characters or items")),
        None => Some("must be a string or array".to_string()),
    })
}

fn pattern(payload: &Value, d: &RuleDescriptor) -> Result<Option<String>, RuleError> {
    let raw = param_str(d, "regex")?;
    let re = Regex::new(raw).map_err(|e| RuleError::params(&d.rule, e.to_string()))?;
    let Some(v) = lookup(payload, &d.field) else {
        return Ok(None);
    };
    Ok(match v.as_str() {
        Some(s) if re.is_match(s) => None,
        Some(_) => Some(format!("must match pattern {raw}")),
        None => Some("must be a string".to_string()),
    })
}

fn one_of(payload: &Value, d: &RuleDescriptor) -> Result<Option<String>, RuleError> {
    let allowed = param_array(d, "values")?;
    let Some(v) = lookup(payload, &d.field) else {
        return Ok(None);
    };
    if allowed.contains(v) {
        return Ok(None);
    }
    let listed = allowed
        .iter()
        .map(|a| a.as_str().map(str::to_string).unwrap_or_else(|| a.to_string()))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(Some(format!("must be one of {listed}")))
}

/// The field may only move forward through `order` relative to
/// `previous_field`, e.g. draft -> review -> published.
fn monotonic(payload: &Value, d: &RuleDescriptor) -> Result<Option<String>, RuleError> {
    let order = param_array(d, "order")?;
    let previous_field = param_str(d, "previous_field")?;
    let (Some(current), Some(previous)) = (lookup(payload, &d.field), lookup(payload, previous_field)) else {
        return Ok(None);
    };
    let position = |v: &Value| order.iter().position(|o| o == v);
    Ok(match (position(current), position(previous)) {
        (Some(cur), Some(prev)) if cur >= prev => None,
        (Some(_), Some(_)) => Some(format!("cannot transition from {previous} to {current}")),
        _ => Some("unknown state in transition".to_string()),
    })
}

fn depends_on(payload: &Value, d: &RuleDescriptor) -> Result<Option<String>, RuleError> {
    let other = param_str(d, "field")?;
    if lookup(payload, &d.field).is_some() && lookup(payload, other).is_none() {
        return Ok(Some(format!("requires '{other}' to be set")));
    }
    Ok(None)
}

fn not_equal(payload: &Value, d: &RuleDescriptor) -> Result<Option<String>, RuleError> {
    let other = param_str(d, "field")?;
    match (lookup(payload, &d.field), lookup(payload, other)) {
        (Some(a), Some(b)) if a == b => Ok(Some(format!("must differ from '{other}'"))),
        _ => Ok(None),
    }
}

/// Canonical bytes of the payload with the proof field removed. Object keys
/// serialize in sorted order.
pub fn canonical_bytes(payload: &Value, proof_field: &str) -> Vec<u8> {
    let mut copy = payload.clone();
    if let Some(obj) = copy.as_object_mut() {
        obj.remove(proof_field);
    }
    serde_json::to_vec(&copy).unwrap_or_default()
}

/// Hex SHA-256 checksum as expected by the `checksum` rule.
pub fn compute_checksum(payload: &Value, proof_field: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_bytes(payload, proof_field));
    format!("{:x}", hasher.finalize())
}

/// Base64 HMAC-SHA256 as expected by the `signature` rule.
pub fn compute_signature(secret: &str, payload: &Value, proof_field: &str) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(&canonical_bytes(payload, proof_field));
    general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

fn proof_field(d: &RuleDescriptor, default: &str) -> String {
    if d.field.is_empty() {
        default.to_string()
    } else {
        d.field.clone()
    }
}

fn checksum(payload: &Value, d: &RuleDescriptor) -> Result<Option<String>, RuleError> {
    let field = proof_field(d, "checksum");
    let Some(provided) = payload.get(&field).and_then(Value::as_str) else {
        return Ok(Some("checksum missing".to_string()));
    };
    let expected = compute_checksum(payload, &field);
    let matches = provided
        .to_ascii_lowercase()
        .as_bytes()
        .ct_eq(expected.as_bytes())
        .unwrap_u8()
        == 1;
    Ok((!matches).then(|| "checksum mismatch".to_string()))
}

fn signature(payload: &Value, d: &RuleDescriptor, secret: &str) -> Result<Option<String>, RuleError> {
    let field = proof_field(d, "signature");
    let Some(provided) = payload.get(&field).and_then(Value::as_str) else {
        return Ok(Some("signature missing".to_string()));
    };
    let Ok(provided) = general_purpose::STANDARD.decode(provided) else {
        return Ok(Some("invalid signature encoding".to_string()));
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| RuleError::params(&d.rule, "invalid hmac key"))?;
    mac.update(&canonical_bytes(payload, &field));
    let expected = mac.finalize().into_bytes();

    if provided.ct_eq(expected.as_slice()).unwrap_u8() == 1 {
        Ok(None)
    } else {
        Ok(Some("signature mismatch".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> ValidationEngine {
        ValidationEngine::new(&ValidationConfig {
            signing_secret: Some("shared-secret".into()),
        })
    }

    fn errors(payload: Value, rule: RuleDescriptor) -> Vec<String> {
        engine()
            .validate(&payload, &[rule])
            .unwrap()
            .into_errors()
            .into_iter()
            .map(|e| e.message)
            .collect()
    }

    #[test]
    fn required_rejects_missing_null_and_blank() {
        let rule = || RuleDescriptor::new("required", "title");
        assert_eq!(errors(json!({}), rule()), ["is required"]);
        assert_eq!(errors(json!({"title": null}), rule()), ["is required"]);
        assert_eq!(errors(json!({"title": "  "}), rule()), ["must not be empty"]);
        assert!(errors(json!({"title": "T"}), rule()).is_empty());
    }

    #[test]
    fn nested_paths_are_resolved() {
        let rule = RuleDescriptor::new("required", "meta.author");
        assert!(errors(json!({"meta": {"author": "ann"}}), rule.clone()).is_empty());
        assert_eq!(errors(json!({"meta": {}}), rule), ["is required"]);
    }

    #[test]
    fn type_and_length_checks() {
        let ty = RuleDescriptor::new("type", "tags").with_params(json!({"type": "array"}));
        assert!(errors(json!({"tags": []}), ty.clone()).is_empty());
        assert_eq!(errors(json!({"tags": "x"}), ty), ["must be of type array"]);

        let max = RuleDescriptor::new("max_length", "title").with_params(json!({"value": 3}));
        assert!(errors(json!({"title": "abc"}), max.clone()).is_empty());
        assert_eq!(errors(json!({"title": "abcd"}), max).len(), 1);

        let min = RuleDescriptor::new("min_length", "tags").with_params(json!({"value": 1}));
        assert_eq!(errors(json!({"tags": []}), min).len(), 1);
    }

    #[test]
    fn bad_params_are_programmer_errors() {
        let e = engine();
        let rule = RuleDescriptor::new("pattern", "slug").with_params(json!({"regex": "("}));
        assert!(matches!(
            e.validate(&json!({"slug": "a"}), &[rule]),
            Err(RuleError::InvalidParams { .. })
        ));
        let rule = RuleDescriptor::new("type", "slug").with_params(json!({"type": "tuple"}));
        assert!(e.validate(&json!({"slug": "a"}), &[rule]).is_err());
    }

    #[test]
    fn pattern_and_one_of() {
        let slug = RuleDescriptor::new("pattern", "slug").with_params(json!({"regex": "^[a-z0-9-]+$"}));
        assert!(errors(json!({"slug": "hello-world"}), slug.clone()).is_empty());
        assert_eq!(errors(json!({"slug": "Hello World"}), slug).len(), 1);

        let status = RuleDescriptor::new("one_of", "status")
            .with_params(json!({"values": ["draft", "published"]}));
        assert_eq!(
            errors(json!({"status": "archived"}), status),
            ["must be one of draft, published"]
        );
    }

    #[test]
    fn monotonic_transitions_only_move_forward() {
        let rule = RuleDescriptor::new("monotonic", "status").with_params(json!({
            "order": ["draft", "review", "published"],
            "previous_field": "previous_status"
        }));
        assert!(errors(json!({"status": "published", "previous_status": "draft"}), rule.clone()).is_empty());
        assert!(errors(json!({"status": "review", "previous_status": "review"}), rule.clone()).is_empty());
        assert_eq!(
            errors(json!({"status": "draft", "previous_status": "published"}), rule.clone()).len(),
            1
        );
        assert_eq!(
            errors(json!({"status": "gone", "previous_status": "draft"}), rule),
            ["unknown state in transition"]
        );
    }

    #[test]
    fn depends_on_and_not_equal() {
        let dep = RuleDescriptor::new("depends_on", "publish_at").with_params(json!({"field": "timezone"}));
        assert_eq!(errors(json!({"publish_at": "2026-01-01"}), dep.clone()).len(), 1);
        assert!(errors(json!({"publish_at": "2026-01-01", "timezone": "UTC"}), dep.clone()).is_empty());
        assert!(errors(json!({}), dep).is_empty());
    }

    #[test]
    fn checksum_detects_tampering() {
        let mut payload = json!({"title": "T", "body": "hello"});
        payload["checksum"] = json!(compute_checksum(&payload, "checksum"));
        let rule = RuleDescriptor::new("checksum", "");
        assert!(errors(payload.clone(), rule.clone()).is_empty());

        payload["body"] = json!("tampered");
        assert_eq!(errors(payload, rule.clone()), ["checksum mismatch"]);
        assert_eq!(errors(json!({"title": "T"}), rule), ["checksum missing"]);
    }

    #[test]
    fn signature_verifies_with_configured_secret() {
        let mut payload = json!({"widget": "hero", "position": 2});
        payload["signature"] = json!(compute_signature("shared-secret", &payload, "signature"));
        let rule = RuleDescriptor::new("signature", "");
        assert!(errors(payload.clone(), rule.clone()).is_empty());

        payload["signature"] = json!(compute_signature("other-secret", &payload, "signature"));
        assert_eq!(errors(payload, rule), ["signature mismatch"]);
    }

    #[test]
    fn signature_without_secret_is_misconfiguration() {
        let e = ValidationEngine::default();
        let rule = RuleDescriptor::new("signature", "");
        assert!(matches!(
            e.validate(&json!({"signature": "x"}), &[rule]),
            Err(RuleError::InvalidParams { .. })
        ));
    }
}
