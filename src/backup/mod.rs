pub mod fs_store;
pub mod signer;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use fs_store::FsSnapshotStore;
pub use signer::{ManifestSigner, ManifestTampered};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackupPointId(pub Uuid);

impl BackupPointId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BackupPointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BackupPointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque handle to a storage-layer snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupPoint {
    pub id: BackupPointId,
    pub created_at: DateTime<Utc>,
    pub snapshot_ref: SnapshotRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory whose files are protected by snapshots; unset disables file snapshots
    #[serde(default)]
    pub tracked_root: Option<PathBuf>,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    /// HMAC secret sealing snapshot manifests; a random one is used when unset
    #[serde(default)]
    pub manifest_secret: Option<String>,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}

fn default_max_age_secs() -> u64 {
    86_400
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            tracked_root: None,
            backup_dir: default_backup_dir(),
            manifest_secret: None,
            max_age_secs: default_max_age_secs(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackupError {
    #[error("snapshot failed: {0}")]
    Snapshot(String),
    #[error("restore failed: {0}")]
    Restore(String),
    #[error("snapshot integrity check failed: {0}")]
    Integrity(String),
    #[error("unknown backup point {0}")]
    UnknownPoint(BackupPointId),
}

/// Storage-layer snapshot primitives.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn snapshot(&self, point: BackupPointId) -> Result<SnapshotRef>;
    async fn restore(&self, snapshot: &SnapshotRef) -> Result<()>;
    /// Release snapshot resources. Must tolerate an already discarded snapshot.
    async fn discard(&self, snapshot: &SnapshotRef) -> Result<()>;
}

/// For deployments where the transaction covers every side effect.
#[derive(Debug, Clone, Default)]
pub struct NullSnapshotStore;

#[async_trait]
impl SnapshotStore for NullSnapshotStore {
    async fn snapshot(&self, point: BackupPointId) -> Result<SnapshotRef> {
        Ok(SnapshotRef(format!("null:{point}")))
    }

    async fn restore(&self, _snapshot: &SnapshotRef) -> Result<()> {
        Ok(())
    }

    async fn discard(&self, _snapshot: &SnapshotRef) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct PointState {
    point: BackupPoint,
    restored: bool,
}

/// Creates, restores and releases backup points around an operation.
pub struct BackupManager {
    store: Arc<dyn SnapshotStore>,
    points: DashMap<BackupPointId, Arc<Mutex<PointState>>>,
}

impl fmt::Debug for BackupManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupManager")
            .field("active_points", &self.points.len())
            .finish()
    }
}

impl BackupManager {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            points: DashMap::new(),
        }
    }

    /// File snapshots when a tracked root is configured, no-op otherwise.
    pub fn from_config(config: &BackupConfig) -> Result<Self> {
        let store: Arc<dyn SnapshotStore> = match &config.tracked_root {
            Some(root) => {
                let signer = match &config.manifest_secret {
                    Some(secret) => ManifestSigner::new(secret.as_bytes()),
                    None => ManifestSigner::new(Uuid::new_v4().as_bytes()),
                };
                Arc::new(
                    FsSnapshotStore::new(root.clone(), config.backup_dir.clone(), signer)
                        .with_max_age(config.max_age_secs),
                )
            }
            None => Arc::new(NullSnapshotStore),
        };
        Ok(Self::new(store))
    }

    pub async fn create_backup_point(&self) -> Result<BackupPointId, BackupError> {
        let id = BackupPointId::new();
        let snapshot_ref = self
            .store
            .snapshot(id)
            .await
            .map_err(|e| BackupError::Snapshot(format!("{e:#}")))?;
        let point = BackupPoint {
            id,
            created_at: Utc::now(),
            snapshot_ref,
        };
        debug!(backup_point = %id, snapshot = %point.snapshot_ref.0, "backup point created");
        self.points.insert(
            id,
            Arc::new(Mutex::new(PointState {
                point,
                restored: false,
            })),
        );
        Ok(id)
    }

    /// Restore side effects captured at `id`. A second call is a no-op.
    pub async fn restore_from_point(&self, id: BackupPointId) -> Result<(), BackupError> {
        let state = self
            .points
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(BackupError::UnknownPoint(id))?;
        let mut state = state.lock().await;
        if state.restored {
            debug!(backup_point = %id, "backup point already restored");
            return Ok(());
        }
        self.store
            .restore(&state.point.snapshot_ref)
            .await
            .map_err(|e| {
                if let Some(t) = e.downcast_ref::<ManifestTampered>() {
                    BackupError::Integrity(t.0.clone())
                } else {
                    BackupError::Restore(format!("{e:#}"))
                }
            })?;
        state.restored = true;
        info!(backup_point = %id, "restored from backup point");
        Ok(())
    }

    /// Release the point. Safe to call repeatedly, with or without a restore.
    pub async fn cleanup_backup_point(&self, id: BackupPointId) {
        let Some((_, state)) = self.points.remove(&id) else {
            return;
        };
        let state = state.lock().await;
        if let Err(e) = self.store.discard(&state.point.snapshot_ref).await {
            warn!(backup_point = %id, error = %e, "failed to discard snapshot");
        }
        debug!(backup_point = %id, "backup point released");
    }

    pub fn point(&self, id: BackupPointId) -> Option<BackupPoint> {
        self.points
            .get(&id)
            .and_then(|entry| entry.value().try_lock().ok().map(|s| s.point.clone()))
    }

    /// Points created and not yet cleaned up.
    pub fn active_points(&self) -> usize {
        self.points.len()
    }
}
