use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::CryptoError;

pub const KEY_LEN: usize = 32;
/// Envelopes carry the key id behind a one-byte length prefix.
pub const MAX_KEY_ID_LEN: usize = u8::MAX as usize;

/// Raw AES-256 key bytes, wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; KEY_LEN]);

impl KeyMaterial {
    pub fn generate(rng: &SystemRandom) -> Result<Self, CryptoError> {
        let mut bytes = [0u8; KEY_LEN];
        rng.fill(&mut bytes).map_err(|_| CryptoError::Rng)?;
        Ok(Self(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::WeakKey(format!("expected {KEY_LEN} bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial([REDACTED])")
    }
}

/// One identified key.
#[derive(Debug, Clone)]
pub struct KeyEntry {
    pub id: String,
    pub created_at: DateTime<Utc>,
    material: KeyMaterial,
}

impl KeyEntry {
    pub fn generate(rng: &SystemRandom) -> Result<Self, CryptoError> {
        let created_at = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        Ok(Self {
            id: format!("k{}-{}", created_at.format("%Y%m%d%H%M%S"), &suffix[..8]),
            created_at,
            material: KeyMaterial::generate(rng)?,
        })
    }

    pub fn from_parts(
        id: impl Into<String>,
        created_at: DateTime<Utc>,
        material: KeyMaterial,
    ) -> Result<Self, CryptoError> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_KEY_ID_LEN {
            return Err(CryptoError::WeakKey(format!(
                "key id must be 1..={MAX_KEY_ID_LEN} bytes, got {}",
                id.len()
            )));
        }
        Ok(Self {
            id,
            created_at,
            material,
        })
    }

    fn aead_key(&self) -> Result<LessSafeKey, CryptoError> {
        let unbound = UnboundKey::new(&AES_256_GCM, self.material.as_bytes())
            .map_err(|_| CryptoError::WeakKey(format!("key {} rejected by cipher", self.id)))?;
        Ok(LessSafeKey::new(unbound))
    }

    /// AES-256-GCM seal; the key id is bound as associated data.
    pub(crate) fn seal(&self, nonce: [u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.aead_key()?;
        let mut in_out = plaintext.to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(self.id.as_bytes()),
            &mut in_out,
        )
        .map_err(|_| CryptoError::Seal)?;
        Ok(in_out)
    }

    pub(crate) fn open(&self, nonce: [u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.aead_key()?;
        let mut buf = ciphertext.to_vec();
        let plain = key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(self.id.as_bytes()),
                &mut buf,
            )
            .map_err(|_| CryptoError::Integrity)?;
        Ok(plain.to_vec())
    }
}

/// Exactly one active key plus every archived key, newest first.
#[derive(Debug, Clone)]
pub struct KeySet {
    active: KeyEntry,
    archived: Vec<KeyEntry>,
}

impl KeySet {
    pub fn new(active: KeyEntry) -> Self {
        Self {
            active,
            archived: Vec::new(),
        }
    }

    pub fn with_archived(active: KeyEntry, archived: Vec<KeyEntry>) -> Self {
        Self { active, archived }
    }

    pub fn active(&self) -> &KeyEntry {
        &self.active
    }

    pub fn archived(&self) -> &[KeyEntry] {
        &self.archived
    }

    pub fn find(&self, id: &str) -> Option<&KeyEntry> {
        if self.active.id == id {
            return Some(&self.active);
        }
        self.archived.iter().find(|k| k.id == id)
    }

    pub fn key_ids(&self) -> Vec<String> {
        std::iter::once(&self.active)
            .chain(self.archived.iter())
            .map(|k| k.id.clone())
            .collect()
    }

    fn rotated(&self, next: KeyEntry) -> Self {
        let mut archived = Vec::with_capacity(self.archived.len() + 1);
        archived.push(self.active.clone());
        archived.extend(self.archived.iter().cloned());
        Self {
            active: next,
            archived,
        }
    }
}

/// How long archived keys are kept. Only applied by an explicit prune.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyRetention {
    #[serde(default)]
    pub max_archived: Option<usize>,
    #[serde(default)]
    pub max_age_days: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyConfig {
    #[serde(default)]
    pub keyset_path: Option<PathBuf>,
    #[serde(default)]
    pub retention: KeyRetention,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredKey {
    id: String,
    created_at: DateTime<Utc>,
    key: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredKeySet {
    active: StoredKey,
    #[serde(default)]
    archived: Vec<StoredKey>,
}

impl StoredKey {
    fn from_entry(entry: &KeyEntry) -> Self {
        Self {
            id: entry.id.clone(),
            created_at: entry.created_at,
            key: general_purpose::STANDARD.encode(entry.material.as_bytes()),
        }
    }

    fn into_entry(self) -> Result<KeyEntry> {
        let mut bytes = general_purpose::STANDARD
            .decode(&self.key)
            .with_context(|| format!("decoding key {}", self.id))?;
        let material = KeyMaterial::from_slice(&bytes);
        bytes.zeroize();
        Ok(KeyEntry::from_parts(self.id, self.created_at, material?)?)
    }
}

/// Owns the process-wide [`KeySet`].
///
/// Readers take an immutable snapshot, so an encrypt racing a rotation sees
/// either the old set or the new one. Rotations and prunes are serialized.
#[derive(Debug)]
pub struct KeyRotationManager {
    keys: ArcSwap<KeySet>,
    rotation_lock: Mutex<()>,
    rng: SystemRandom,
}

impl KeyRotationManager {
    /// Start with a freshly generated active key.
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let active = KeyEntry::generate(&rng)?;
        Ok(Self::with_rng(KeySet::new(active), rng))
    }

    pub fn from_keyset(keys: KeySet) -> Self {
        Self::with_rng(keys, SystemRandom::new())
    }

    fn with_rng(keys: KeySet, rng: SystemRandom) -> Self {
        Self {
            keys: ArcSwap::from_pointee(keys),
            rotation_lock: Mutex::new(()),
            rng,
        }
    }

    pub(crate) fn rng(&self) -> &SystemRandom {
        &self.rng
    }

    /// Consistent snapshot of the current key set.
    pub fn current(&self) -> Arc<KeySet> {
        self.keys.load_full()
    }

    pub fn active_key_id(&self) -> String {
        self.keys.load().active.id.clone()
    }

    /// Install a new active key and archive the previous one.
    ///
    /// The candidate is checked for strength and must survive an
    /// encrypt/decrypt round trip before it is swapped in.
    pub fn rotate_keys(&self) -> Result<String, CryptoError> {
        let _guard = self
            .rotation_lock
            .lock()
            .map_err(|_| CryptoError::Rotation("rotation lock poisoned".into()))?;

        let current = self.keys.load_full();
        let candidate = KeyEntry::generate(&self.rng)?;
        validate_candidate(&candidate, &current)?;
        self.verify_round_trip(&candidate)?;

        let next = current.rotated(candidate);
        let new_id = next.active.id.clone();
        self.keys.store(Arc::new(next));

        info!(
            new_key_id = %new_id,
            previous_key_id = %current.active.id,
            archived = current.archived.len() + 1,
            "encryption key rotated"
        );
        Ok(new_id)
    }

    fn verify_round_trip(&self, candidate: &KeyEntry) -> Result<(), CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce).map_err(|_| CryptoError::Rng)?;
        let sample = b"key-rotation-check";
        let sealed = candidate.seal(nonce, sample)?;
        let opened = candidate.open(nonce, &sealed)?;
        if opened != sample {
            return Err(CryptoError::Rotation("round-trip verification failed".into()));
        }
        Ok(())
    }

    /// Drop archived keys outside the retention policy. Returns the removed ids.
    ///
    /// Callers must have re-encrypted data protected by those keys first.
    pub fn prune(&self, retention: &KeyRetention) -> Result<Vec<String>, CryptoError> {
        let _guard = self
            .rotation_lock
            .lock()
            .map_err(|_| CryptoError::Rotation("rotation lock poisoned".into()))?;

        let current = self.keys.load_full();
        let cutoff = retention
            .max_age_days
            .map(|days| Utc::now() - chrono::Duration::days(days));

        let mut kept = Vec::new();
        let mut removed = Vec::new();
        for (idx, key) in current.archived.iter().enumerate() {
            let over_count = retention.max_archived.is_some_and(|max| idx >= max);
            let too_old = cutoff.is_some_and(|c| key.created_at < c);
            if over_count || too_old {
                removed.push(key.id.clone());
            } else {
                kept.push(key.clone());
            }
        }

        if !removed.is_empty() {
            self.keys
                .store(Arc::new(KeySet::with_archived(current.active.clone(), kept)));
            warn!(removed = ?removed, "archived encryption keys pruned");
        }
        Ok(removed)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading keyset {}", path.display()))?;
        let stored: StoredKeySet = serde_json::from_str(&raw).context("parsing keyset JSON")?;
        let active = stored.active.into_entry()?;
        let archived = stored
            .archived
            .into_iter()
            .map(StoredKey::into_entry)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_keyset(KeySet::with_archived(active, archived)))
    }

    /// Write the key set as JSON, readable by the owner only on unix.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let keys = self.current();
        let stored = StoredKeySet {
            active: StoredKey::from_entry(&keys.active),
            archived: keys.archived.iter().map(StoredKey::from_entry).collect(),
        };
        let json = serde_json::to_vec_pretty(&stored).context("encoding keyset")?;

        let tmp = path.with_extension("tmp");
        write_private(&tmp, &json).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, data)
}

fn validate_candidate(candidate: &KeyEntry, current: &KeySet) -> Result<(), CryptoError> {
    let bytes = candidate.material.as_bytes();
    if bytes.len() != KEY_LEN {
        return Err(CryptoError::WeakKey(format!("expected {KEY_LEN} bytes")));
    }
    if bytes.iter().all(|b| *b == bytes[0]) {
        return Err(CryptoError::WeakKey("key bytes are constant".into()));
    }
    if current.find(&candidate.id).is_some() {
        return Err(CryptoError::WeakKey(format!("key id {} already in use", candidate.id)));
    }
    let reused = std::iter::once(&current.active)
        .chain(current.archived.iter())
        .any(|k| k.material == candidate.material);
    if reused {
        return Err(CryptoError::WeakKey("key material reused".into()));
    }
    Ok(())
}
