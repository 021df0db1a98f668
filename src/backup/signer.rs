use anyhow::Result;
use base64::{engine::general_purpose, Engine as _};
use ring::hmac;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Raised when a snapshot manifest fails signature verification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("snapshot manifest failed verification: {0}")]
pub struct ManifestTampered(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the tracked root, `/` separated
    pub path: String,
    pub sha256: String,
    pub size: u64,
}

/// File listing of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub point_id: String,
    pub files: Vec<ManifestEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SignedManifest {
    manifest: Manifest,
    timestamp: u64,
}

/// Time-stamped HMAC-SHA256 seal over snapshot manifests.
#[derive(Debug)]
pub struct ManifestSigner {
    key: hmac::Key,
}

impl ManifestSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret.as_ref()),
        }
    }

    /// Sign a manifest with the current timestamp.
    pub fn seal(&self, manifest: &Manifest) -> Result<String> {
        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let data = SignedManifest {
            manifest: manifest.clone(),
            timestamp,
        };
        let json_bytes = serde_json::to_vec(&data)?;

        let signature = hmac::sign(&self.key, &json_bytes);
        let mut signed = json_bytes;
        signed.extend_from_slice(signature.as_ref());

        Ok(general_purpose::URL_SAFE_NO_PAD.encode(signed))
    }

    /// Verify a sealed manifest no older than `max_age_secs`.
    pub fn open(&self, sealed: &str, max_age_secs: u64) -> Result<Manifest> {
        let decoded = general_purpose::URL_SAFE_NO_PAD
            .decode(sealed.trim())
            .map_err(|_| ManifestTampered("invalid encoding".into()))?;

        // HMAC-SHA256 produces 32-byte signature
        let signature_len = 32;
        if decoded.len() < signature_len {
            return Err(ManifestTampered("too short".into()).into());
        }
        let (data, signature_bytes) = decoded.split_at(decoded.len() - signature_len);

        hmac::verify(&self.key, data, signature_bytes)
            .map_err(|_| ManifestTampered("invalid signature".into()))?;

        let signed: SignedManifest = serde_json::from_slice(data)?;
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        if now.saturating_sub(signed.timestamp) > max_age_secs {
            anyhow::bail!("snapshot manifest expired");
        }
        Ok(signed.manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Manifest {
        Manifest {
            point_id: "p-1".into(),
            files: vec![ManifestEntry {
                path: "media/a.png".into(),
                sha256: "ab".into(),
                size: 2,
            }],
        }
    }

    #[test]
    fn test_seal_and_open() {
        let signer = ManifestSigner::new("test_secret");
        let sealed = signer.seal(&manifest()).unwrap();
        assert_eq!(signer.open(&sealed, 3600).unwrap(), manifest());
    }

    #[test]
    fn test_open_fails_with_wrong_secret() {
        let sealed = ManifestSigner::new("test_secret").seal(&manifest()).unwrap();
        let err = ManifestSigner::new("wrong_secret")
            .open(&sealed, 3600)
            .unwrap_err();
        assert!(err.downcast_ref::<ManifestTampered>().is_some());
    }

    #[test]
    fn test_open_fails_on_modified_body() {
        let signer = ManifestSigner::new("test_secret");
        let sealed = signer.seal(&manifest()).unwrap();
        let mut raw = general_purpose::URL_SAFE_NO_PAD.decode(&sealed).unwrap();
        raw[5] ^= 0x20;
        let tampered = general_purpose::URL_SAFE_NO_PAD.encode(raw);
        assert!(signer.open(&tampered, 3600).is_err());
    }
}
