use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::signer::{Manifest, ManifestEntry, ManifestSigner, ManifestTampered};
use super::{BackupPointId, SnapshotRef, SnapshotStore};

const MANIFEST_FILE: &str = "manifest.sig";
const FILES_DIR: &str = "files";

/// Copies a tracked directory into `backup_dir/<point>/files` with a signed
/// manifest of per-file SHA-256 digests.
///
/// A restore reverts the whole tree, so snapshots of one root are leased one
/// at a time: `snapshot` waits for the previous point to be discarded.
#[derive(Debug, Clone)]
pub struct FsSnapshotStore {
    inner: Arc<Inner>,
    lease: Arc<RootLease>,
    max_age_secs: u64,
}

#[derive(Debug)]
struct Inner {
    root: PathBuf,
    backup_dir: PathBuf,
    signer: ManifestSigner,
}

#[derive(Debug, Default)]
struct RootLease {
    lock: Arc<Mutex<()>>,
    held: DashMap<String, OwnedMutexGuard<()>>,
}

impl FsSnapshotStore {
    pub fn new(root: PathBuf, backup_dir: PathBuf, signer: ManifestSigner) -> Self {
        Self {
            inner: Arc::new(Inner {
                root,
                backup_dir,
                signer,
            }),
            lease: Arc::new(RootLease::default()),
            max_age_secs: 86_400,
        }
    }

    /// Oldest manifest `restore` accepts.
    pub fn with_max_age(mut self, max_age_secs: u64) -> Self {
        self.max_age_secs = max_age_secs;
        self
    }

    pub fn max_age_secs(&self) -> u64 {
        self.max_age_secs
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn snapshot(&self, point: BackupPointId) -> Result<SnapshotRef> {
        let lease = self.lease.lock.clone().lock_owned().await;
        let inner = self.inner.clone();
        let snapshot = tokio::task::spawn_blocking(move || inner.snapshot(point))
            .await
            .context("snapshot task panicked")??;
        self.lease.held.insert(snapshot.0.clone(), lease);
        Ok(snapshot)
    }

    async fn restore(&self, snapshot: &SnapshotRef) -> Result<()> {
        let inner = self.inner.clone();
        let dir = PathBuf::from(&snapshot.0);
        let max_age_secs = self.max_age_secs;
        tokio::task::spawn_blocking(move || inner.restore(&dir, max_age_secs))
            .await
            .context("restore task panicked")?
    }

    async fn discard(&self, snapshot: &SnapshotRef) -> Result<()> {
        let dir = PathBuf::from(&snapshot.0);
        let removed = match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", dir.display())),
        };
        self.lease.held.remove(&snapshot.0);
        removed
    }
}

impl Inner {
    /// Write the snapshot, removing the partial directory on any error.
    fn snapshot(&self, point: BackupPointId) -> Result<SnapshotRef> {
        let dir = self.backup_dir.join(point.to_string());
        self.write_snapshot(point, &dir).inspect_err(|_| {
            if let Err(e) = fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(snapshot = %dir.display(), error = %e, "failed to remove partial snapshot");
                }
            }
        })
    }

    fn write_snapshot(&self, point: BackupPointId, dir: &Path) -> Result<SnapshotRef> {
        let files_dir = dir.join(FILES_DIR);
        fs::create_dir_all(&files_dir)
            .with_context(|| format!("creating {}", files_dir.display()))?;

        let mut entries = Vec::new();
        for rel in list_files(&self.root)? {
            let src = self.root.join(&rel);
            let dst = files_dir.join(&rel);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            let bytes = fs::read(&src).with_context(|| format!("reading {}", src.display()))?;
            fs::write(&dst, &bytes).with_context(|| format!("writing {}", dst.display()))?;
            entries.push(ManifestEntry {
                path: rel_to_string(&rel),
                sha256: digest(&bytes),
                size: bytes.len() as u64,
            });
        }

        let manifest = Manifest {
            point_id: point.to_string(),
            files: entries,
        };
        let sealed = self.signer.seal(&manifest)?;
        let manifest_path = dir.join(MANIFEST_FILE);
        fs::write(&manifest_path, sealed)
            .with_context(|| format!("writing {}", manifest_path.display()))?;
        debug!(
            backup_point = %point,
            files = manifest.files.len(),
            "snapshot written"
        );
        Ok(SnapshotRef(dir.to_string_lossy().into_owned()))
    }

    fn restore(&self, dir: &Path, max_age_secs: u64) -> Result<()> {
        let sealed = fs::read_to_string(dir.join(MANIFEST_FILE))
            .with_context(|| format!("reading manifest in {}", dir.display()))?;
        let manifest = self.signer.open(&sealed, max_age_secs)?;
        let files_dir = dir.join(FILES_DIR);

        // Check every copy before touching the live tree.
        let mut verified = Vec::with_capacity(manifest.files.len());
        for entry in &manifest.files {
            let rel = safe_relative(&entry.path)?;
            let bytes = fs::read(files_dir.join(&rel))
                .map_err(|_| ManifestTampered(format!("missing snapshot file {}", entry.path)))?;
            if digest(&bytes) != entry.sha256 {
                return Err(ManifestTampered(format!("digest mismatch for {}", entry.path)).into());
            }
            verified.push((rel, bytes));
        }

        let keep: HashSet<PathBuf> = verified.iter().map(|(rel, _)| rel.clone()).collect();
        for rel in list_files(&self.root)? {
            if !keep.contains(&rel) {
                let path = self.root.join(&rel);
                fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
                prune_empty_parents(&self.root, &rel);
            }
        }

        for (rel, bytes) in verified {
            let dst = self.root.join(&rel);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dst, bytes).with_context(|| format!("restoring {}", dst.display()))?;
        }
        debug!(snapshot = %dir.display(), files = keep.len(), "snapshot restored");
        Ok(())
    }
}

/// Remove directories under `root` left empty by deleting `rel`.
fn prune_empty_parents(root: &Path, rel: &Path) {
    let mut parent = rel.parent();
    while let Some(dir) = parent.filter(|d| !d.as_os_str().is_empty()) {
        if fs::remove_dir(root.join(dir)).is_err() {
            break;
        }
        parent = dir.parent();
    }
}

fn digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn rel_to_string(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Rejects absolute paths and `..` so a manifest cannot write outside the root.
fn safe_relative(path: &str) -> Result<PathBuf> {
    let rel = PathBuf::from(path);
    let ok = rel
        .components()
        .all(|c| matches!(c, std::path::Component::Normal(_)));
    if !ok || path.is_empty() {
        return Err(ManifestTampered(format!("unsafe path {path}")).into());
    }
    Ok(rel)
}

/// Regular files under `root`, relative and sorted. Symlinks are skipped.
fn list_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    let mut stack = vec![PathBuf::new()];
    while let Some(rel_dir) = stack.pop() {
        let abs = root.join(&rel_dir);
        for entry in fs::read_dir(&abs).with_context(|| format!("listing {}", abs.display()))? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let rel = rel_dir.join(entry.file_name());
            if file_type.is_dir() {
                stack.push(rel);
            } else if file_type.is_file() {
                out.push(rel);
            } else {
                warn!(path = %rel.display(), "skipping non-regular file");
            }
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(root: &TempDir, backups: &TempDir) -> FsSnapshotStore {
        FsSnapshotStore::new(
            root.path().to_path_buf(),
            backups.path().to_path_buf(),
            ManifestSigner::new("manifest-secret"),
        )
    }

    #[tokio::test]
    async fn restore_undoes_edits_additions_and_deletions() {
        let root = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("media")).unwrap();
        fs::write(root.path().join("media/a.txt"), "original").unwrap();
        fs::write(root.path().join("index.json"), "{}").unwrap();

        let store = store(&root, &backups);
        let snap = store.snapshot(BackupPointId::new()).await.unwrap();

        fs::write(root.path().join("media/a.txt"), "changed").unwrap();
        fs::remove_file(root.path().join("index.json")).unwrap();
        fs::write(root.path().join("stray.bin"), "new").unwrap();
        fs::create_dir_all(root.path().join("uploads/2024")).unwrap();
        fs::write(root.path().join("uploads/2024/new.png"), "png").unwrap();

        store.restore(&snap).await.unwrap();
        assert_eq!(fs::read_to_string(root.path().join("media/a.txt")).unwrap(), "original");
        assert_eq!(fs::read_to_string(root.path().join("index.json")).unwrap(), "{}");
        assert!(!root.path().join("stray.bin").exists());
        assert!(!root.path().join("uploads").exists());
        assert!(root.path().join("media").is_dir());
    }

    #[tokio::test]
    async fn failed_snapshot_leaves_no_directory() {
        let root = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        fs::write(root.path().join("a.txt"), "original").unwrap();

        let point = BackupPointId::new();
        let dir = backups.path().join(point.to_string());
        // A directory where the manifest should go makes the final write fail.
        fs::create_dir_all(dir.join(MANIFEST_FILE)).unwrap();

        let store = store(&root, &backups);
        assert!(store.snapshot(point).await.is_err());
        assert!(!dir.exists());

        // The lease is released, so the next snapshot does not wait.
        let next = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            store.snapshot(BackupPointId::new()),
        )
        .await
        .unwrap();
        assert!(next.is_ok());
    }

    #[tokio::test]
    async fn second_snapshot_waits_for_discard() {
        let root = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        let store = store(&root, &backups);
        let first = store.snapshot(BackupPointId::new()).await.unwrap();

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            store.snapshot(BackupPointId::new()),
        )
        .await;
        assert!(blocked.is_err());

        store.discard(&first).await.unwrap();
        let second = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            store.snapshot(BackupPointId::new()),
        )
        .await
        .unwrap();
        assert!(second.is_ok());
    }

    #[test]
    fn max_age_applies_to_shared_store() {
        let root = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        let base = store(&root, &backups);
        let shared = base.clone();

        let strict = base.with_max_age(60);
        assert_eq!(strict.max_age_secs(), 60);
        assert_eq!(shared.max_age_secs(), 86_400);
    }

    #[tokio::test]
    async fn tampered_copy_is_reported_and_live_tree_untouched() {
        let root = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        fs::write(root.path().join("a.txt"), "original").unwrap();

        let store = store(&root, &backups);
        let snap = store.snapshot(BackupPointId::new()).await.unwrap();
        fs::write(PathBuf::from(&snap.0).join(FILES_DIR).join("a.txt"), "evil").unwrap();
        fs::write(root.path().join("a.txt"), "current").unwrap();

        let err = store.restore(&snap).await.unwrap_err();
        assert!(err.downcast_ref::<ManifestTampered>().is_some());
        assert_eq!(fs::read_to_string(root.path().join("a.txt")).unwrap(), "current");
    }

    #[tokio::test]
    async fn discard_is_idempotent() {
        let root = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        let store = store(&root, &backups);
        let snap = store.snapshot(BackupPointId::new()).await.unwrap();

        store.discard(&snap).await.unwrap();
        store.discard(&snap).await.unwrap();
        assert!(!PathBuf::from(&snap.0).exists());
    }

    #[test]
    fn unsafe_manifest_paths_are_rejected() {
        assert!(safe_relative("../etc/passwd").is_err());
        assert!(safe_relative("/etc/passwd").is_err());
        assert!(safe_relative("media/a.txt").is_ok());
    }
}
