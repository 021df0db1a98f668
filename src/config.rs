use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backup::BackupConfig;
use crate::crypto::keys::KeyConfig;
use crate::monitoring::alerts::AlertConfig;
use crate::security::access::AccessConfig;
use crate::security::audit_log::AuditConfig;
use crate::security::rate_limit::{LimitRule, RateLimitConfig};
use crate::validation::ValidationConfig;

/// Top-level configuration threaded into every gateway component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub keys: KeyConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub access: AccessConfig,
    /// Deadline applied to operations that do not declare their own
    #[serde(default)]
    pub default_deadline_secs: Option<u64>,
    #[serde(default)]
    pub log_level: Option<String>,
}

impl GatewayConfig {
    /// Load a JSON config file and apply environment overrides on top.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut cfg: GatewayConfig = serde_json::from_str(&raw).context("parsing config JSON")?;
        cfg.apply_env()?;
        Ok(cfg)
    }

    /// Defaults plus environment overrides, for deployments without a file.
    pub fn from_env() -> Result<Self> {
        let mut cfg = GatewayConfig::default();
        cfg.apply_env()?;
        Ok(cfg)
    }

    /// Environment variables win over file values:
    /// - `GATEWAY_RATE_LIMIT_PER_MIN`: default per-minute limit
    /// - `GATEWAY_ALERT_WEBHOOK`: alert webhook URL
    /// - `GATEWAY_SIGNING_SECRET`: secret for the `signature` rule
    /// - `GATEWAY_BACKUP_DIR`: where snapshots are written
    /// - `GATEWAY_LOG`: log level
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("GATEWAY_RATE_LIMIT_PER_MIN") {
            let limit = val
                .trim()
                .parse::<u32>()
                .with_context(|| format!("invalid GATEWAY_RATE_LIMIT_PER_MIN '{val}'"))?;
            self.rate_limits.default = LimitRule::per_minute(limit);
        }
        if let Ok(url) = std::env::var("GATEWAY_ALERT_WEBHOOK") {
            if !url.trim().is_empty() {
                self.alerts.webhook_url = Some(url.trim().to_string());
            }
        }
        if let Ok(secret) = std::env::var("GATEWAY_SIGNING_SECRET") {
            if !secret.is_empty() {
                self.validation.signing_secret = Some(secret);
            }
        }
        if let Ok(dir) = std::env::var("GATEWAY_BACKUP_DIR") {
            if !dir.trim().is_empty() {
                self.backup.backup_dir = PathBuf::from(dir.trim());
            }
        }
        if let Ok(level) = std::env::var("GATEWAY_LOG") {
            if !level.trim().is_empty() {
                self.log_level = Some(level.trim().to_string());
            }
        }
        Ok(())
    }

    pub fn default_deadline(&self) -> Option<Duration> {
        self.default_deadline_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Mutex, OnceLock};
    use tempfile::NamedTempFile;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        match ENV_LOCK.get_or_init(|| Mutex::new(())).lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }

    #[test]
    fn test_config_parsing() {
        let _g = lock_env();
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                "rate_limits": {{
                    "default": {{"limit": 60, "window_secs": 60}},
                    "per_kind": {{"media.upload": {{"limit": 5, "window_secs": 60}}}}
                }},
                "audit": {{"thresholds": [{{"kind": "content.update", "failures": 3, "window_secs": 300}}]}},
                "default_deadline_secs": 30
            }}"#
        )
        .unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.rate_limits.rule_for("media.upload").limit, 5);
        assert_eq!(config.rate_limits.rule_for("content.create").limit, 60);
        assert_eq!(config.audit.thresholds.len(), 1);
        assert_eq!(config.default_deadline(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_config_defaults_for_empty_object() {
        let _g = lock_env();
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{}}").unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.rate_limits.default.limit, 60);
        assert_eq!(config.rate_limits.default.window_secs, 60);
        assert!(config.default_deadline().is_none());
    }

    #[test]
    fn test_config_missing_file() {
        let result = GatewayConfig::from_file("/nonexistent/path/gateway.json");
        assert!(result.is_err());
    }

    #[test]
    fn test_config_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{invalid json").unwrap();
        assert!(GatewayConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let _g = lock_env();
        std::env::set_var("GATEWAY_RATE_LIMIT_PER_MIN", "120");
        std::env::set_var("GATEWAY_SIGNING_SECRET", "s3cret");

        let config = GatewayConfig::from_env().unwrap();
        assert_eq!(config.rate_limits.default.limit, 120);
        assert_eq!(config.validation.signing_secret.as_deref(), Some("s3cret"));

        std::env::set_var("GATEWAY_RATE_LIMIT_PER_MIN", "lots");
        assert!(GatewayConfig::from_env().is_err());

        std::env::remove_var("GATEWAY_RATE_LIMIT_PER_MIN");
        std::env::remove_var("GATEWAY_SIGNING_SECRET");
    }
}
