use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use cms_gateway::crypto::{EncryptionService, KeyRotationManager};
use cms_gateway::security::audit_log::JsonlFileSink;
use cms_gateway::{utils, GatewayConfig};

#[derive(Parser)]
#[command(name = "cms-gateway", version, about = "Critical-operation gateway tooling")]
struct AppCli {
    /// Config file path
    #[arg(short, long, default_value = "gateway.json", global = true)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the encryption key set
    Keys {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// Encrypt text (argument or stdin) under the active key
    Encrypt { plaintext: Option<String> },
    /// Decrypt an envelope (argument or stdin)
    Decrypt { envelope: Option<String> },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Inspect the JSON-lines audit trail
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Create a new key set file
    Init {
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Generate a new active key, archiving the current one
    Rotate,
    /// Remove archived keys outside the retention policy
    Prune,
    /// List key ids
    Show,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Load the config with environment overrides and print it
    Check,
}

#[derive(Subcommand)]
enum AuditAction {
    /// Count records by kind and outcome
    Summary {
        /// Audit file, defaults to `audit.file_path` from config
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

fn load_config(path: &str) -> Result<GatewayConfig> {
    if Path::new(path).exists() {
        GatewayConfig::from_file(path)
    } else {
        GatewayConfig::from_env()
    }
}

fn keyset_path(config: &GatewayConfig) -> Result<&Path> {
    config
        .keys
        .keyset_path
        .as_deref()
        .context("keys.keyset_path is not configured")
}

fn arg_or_stdin(arg: Option<String>) -> Result<String> {
    match arg {
        Some(value) => Ok(value),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading stdin")?;
            Ok(buf.trim_end_matches('\n').to_string())
        }
    }
}

fn keys_command(config: &GatewayConfig, action: KeyAction) -> Result<()> {
    let path = keyset_path(config)?;
    match action {
        KeyAction::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists, pass --force to replace it", path.display());
            }
            let manager = KeyRotationManager::generate()?;
            manager.save(path)?;
            info!(key_id = %manager.active_key_id(), path = %path.display(), "key set created");
            println!("{}", manager.active_key_id());
        }
        KeyAction::Rotate => {
            let manager = KeyRotationManager::load(path)?;
            let new_id = manager.rotate_keys()?;
            manager.save(path)?;
            info!(key_id = %new_id, "encryption key rotated");
            println!("{new_id}");
        }
        KeyAction::Prune => {
            let manager = KeyRotationManager::load(path)?;
            let removed = manager.prune(&config.keys.retention)?;
            manager.save(path)?;
            println!("{}", serde_json::to_string_pretty(&json!({ "removed": removed }))?);
        }
        KeyAction::Show => {
            let manager = KeyRotationManager::load(path)?;
            let keys = manager.current();
            let archived: Vec<_> = keys
                .archived()
                .iter()
                .map(|k| json!({ "id": k.id, "created_at": k.created_at }))
                .collect();
            let out = json!({
                "active": { "id": keys.active().id, "created_at": keys.active().created_at },
                "archived": archived,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }
    Ok(())
}

fn audit_summary(config: &GatewayConfig, file: Option<PathBuf>) -> Result<()> {
    let path = file
        .or_else(|| config.audit.file_path.clone())
        .context("no audit file given and audit.file_path is not configured")?;
    let records = JsonlFileSink::read_all(&path)?;

    let mut by_kind: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
    for record in &records {
        let outcome = serde_json::to_value(record.outcome)?
            .as_str()
            .unwrap_or("unknown")
            .to_string();
        *by_kind
            .entry(record.operation_kind.clone())
            .or_default()
            .entry(outcome)
            .or_insert(0) += 1;
    }
    let out = json!({
        "file": path.display().to_string(),
        "records": records.len(),
        "by_kind": by_kind,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = AppCli::parse();
    let config = load_config(&args.config)?;
    utils::logging::init_with(config.log_level.as_deref());

    match args.command {
        Commands::Keys { action } => keys_command(&config, action)?,
        Commands::Encrypt { plaintext } => {
            let manager = KeyRotationManager::load(keyset_path(&config)?)?;
            let service = EncryptionService::new(Arc::new(manager));
            println!("{}", service.encrypt_str(&arg_or_stdin(plaintext)?)?);
        }
        Commands::Decrypt { envelope } => {
            let manager = KeyRotationManager::load(keyset_path(&config)?)?;
            let service = EncryptionService::new(Arc::new(manager));
            println!("{}", service.decrypt_str(&arg_or_stdin(envelope)?)?);
        }
        Commands::Config {
            action: ConfigAction::Check,
        } => {
            let mut shown = serde_json::to_value(&config)?;
            if shown["validation"]["signing_secret"].is_string() {
                shown["validation"]["signing_secret"] = json!("<redacted>");
            }
            if shown["backup"]["manifest_secret"].is_string() {
                shown["backup"]["manifest_secret"] = json!("<redacted>");
            }
            println!("{}", serde_json::to_string_pretty(&shown)?);
        }
        Commands::Audit {
            action: AuditAction::Summary { file },
        } => audit_summary(&config, file)?,
    }

    Ok(())
}
