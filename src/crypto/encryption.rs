use base64::{engine::general_purpose, Engine as _};
use ring::aead::NONCE_LEN;
use ring::rand::SecureRandom;
use std::sync::Arc;
use tracing::{debug, warn};

use super::keys::{KeyRotationManager, KeySet};
use super::CryptoError;

const ENVELOPE_VERSION: u8 = 1;

/// Serialized ciphertext: version, key id, nonce, then ciphertext with tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub key_id: String,
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    pub fn encode(&self) -> Result<String, CryptoError> {
        let id = self.key_id.as_bytes();
        let id_len = u8::try_from(id.len())
            .map_err(|_| CryptoError::Malformed(format!("key id is {} bytes", id.len())))?;
        let mut out = Vec::with_capacity(2 + id.len() + NONCE_LEN + self.ciphertext.len());
        out.push(ENVELOPE_VERSION);
        out.push(id_len);
        out.extend_from_slice(id);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        Ok(general_purpose::URL_SAFE_NO_PAD.encode(out))
    }

    pub fn decode(encoded: &str) -> Result<Self, CryptoError> {
        let raw = general_purpose::URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::Malformed(e.to_string()))?;
        let (&version, rest) = raw
            .split_first()
            .ok_or_else(|| CryptoError::Malformed("empty envelope".into()))?;
        if version != ENVELOPE_VERSION {
            return Err(CryptoError::Malformed(format!("unsupported version {version}")));
        }
        let (&id_len, rest) = rest
            .split_first()
            .ok_or_else(|| CryptoError::Malformed("missing key id".into()))?;
        let id_len = id_len as usize;
        if rest.len() < id_len + NONCE_LEN {
            return Err(CryptoError::Malformed("envelope too short".into()));
        }
        let (id, rest) = rest.split_at(id_len);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let key_id = String::from_utf8(id.to_vec())
            .map_err(|_| CryptoError::Malformed("key id is not utf-8".into()))?;
        let mut nonce_arr = [0u8; NONCE_LEN];
        nonce_arr.copy_from_slice(nonce);
        Ok(Self {
            key_id,
            nonce: nonce_arr,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// Authenticated encryption under the active key of a [`KeyRotationManager`].
#[derive(Debug, Clone)]
pub struct EncryptionService {
    keys: Arc<KeyRotationManager>,
}

impl EncryptionService {
    pub fn new(keys: Arc<KeyRotationManager>) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &Arc<KeyRotationManager> {
        &self.keys
    }

    /// Encrypt with the active key and a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let keys = self.keys.current();
        let active = keys.active();

        let mut nonce = [0u8; NONCE_LEN];
        self.keys.rng().fill(&mut nonce).map_err(|_| CryptoError::Rng)?;
        let ciphertext = active.seal(nonce, plaintext)?;

        Envelope {
            key_id: active.id.clone(),
            nonce,
            ciphertext,
        }
        .encode()
    }

    pub fn decrypt(&self, envelope: &str) -> Result<Vec<u8>, CryptoError> {
        Self::decrypt_with_keyset(&self.keys.current(), envelope)
    }

    /// Decrypt using only the key named in the envelope.
    pub fn decrypt_with_keyset(keys: &KeySet, envelope: &str) -> Result<Vec<u8>, CryptoError> {
        let env = Envelope::decode(envelope)?;
        let key = keys
            .find(&env.key_id)
            .ok_or_else(|| CryptoError::UnknownKey(env.key_id.clone()))?;
        key.open(env.nonce, &env.ciphertext).inspect_err(|e| {
            if e.is_integrity() {
                warn!(key_id = %env.key_id, "ciphertext failed authentication");
            }
        })
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<String, CryptoError> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_str(&self, envelope: &str) -> Result<String, CryptoError> {
        let bytes = self.decrypt(envelope)?;
        String::from_utf8(bytes).map_err(|_| CryptoError::Malformed("plaintext is not utf-8".into()))
    }

    /// Re-seal under the active key. Envelopes already on the active key are
    /// returned unchanged.
    pub fn re_encrypt(&self, envelope: &str) -> Result<String, CryptoError> {
        let env = Envelope::decode(envelope)?;
        if env.key_id == self.keys.active_key_id() {
            return Ok(envelope.to_string());
        }
        let plaintext = self.decrypt(envelope)?;
        debug!(from_key = %env.key_id, "re-encrypting under active key");
        self.encrypt(&plaintext)
    }

    pub fn key_id_of(envelope: &str) -> Result<String, CryptoError> {
        Ok(Envelope::decode(envelope)?.key_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> EncryptionService {
        EncryptionService::new(Arc::new(KeyRotationManager::generate().unwrap()))
    }

    #[test]
    fn round_trip() {
        let svc = service();
        for plaintext in ["", "hello", "ünïcødé body with\nnewlines"] {
            let env = svc.encrypt_str(plaintext).unwrap();
            assert_eq!(svc.decrypt_str(&env).unwrap(), plaintext);
        }
    }

    #[test]
    fn nonces_are_fresh_per_call() {
        let svc = service();
        let a = svc.encrypt_str("same").unwrap();
        let b = svc.encrypt_str("same").unwrap();
        assert_ne!(a, b);
        assert_ne!(Envelope::decode(&a).unwrap().nonce, Envelope::decode(&b).unwrap().nonce);
    }

    #[test]
    fn tampered_ciphertext_is_an_integrity_error() {
        let svc = service();
        let mut env = Envelope::decode(&svc.encrypt_str("secret").unwrap()).unwrap();
        env.ciphertext[0] ^= 0x01;
        assert_eq!(svc.decrypt(&env.encode().unwrap()), Err(CryptoError::Integrity));
    }

    #[test]
    fn swapped_key_id_fails_authentication() {
        let svc = service();
        let original = svc.encrypt_str("secret").unwrap();
        svc.keys().rotate_keys().unwrap();
        let mut env = Envelope::decode(&original).unwrap();
        env.key_id = svc.keys().active_key_id();
        assert_eq!(svc.decrypt(&env.encode().unwrap()), Err(CryptoError::Integrity));
    }

    #[test]
    fn unknown_key_id_is_reported() {
        let svc = service();
        let mut env = Envelope::decode(&svc.encrypt_str("secret").unwrap()).unwrap();
        env.key_id = "k-missing".into();
        assert_eq!(
            svc.decrypt(&env.encode().unwrap()),
            Err(CryptoError::UnknownKey("k-missing".into()))
        );
    }

    #[test]
    fn malformed_envelopes_are_rejected() {
        let svc = service();
        assert!(matches!(svc.decrypt("!!!"), Err(CryptoError::Malformed(_))));
        assert!(matches!(svc.decrypt(""), Err(CryptoError::Malformed(_))));
        let short = general_purpose::URL_SAFE_NO_PAD.encode([1u8, 4, b'a']);
        assert!(matches!(svc.decrypt(&short), Err(CryptoError::Malformed(_))));
    }

    #[test]
    fn longest_key_id_stays_decryptable() {
        use super::super::keys::{KeyEntry, KeyMaterial, MAX_KEY_ID_LEN};
        use chrono::Utc;
        use ring::rand::SystemRandom;

        let material = KeyMaterial::generate(&SystemRandom::new()).unwrap();
        let entry = KeyEntry::from_parts("k".repeat(MAX_KEY_ID_LEN), Utc::now(), material).unwrap();
        let svc = EncryptionService::new(Arc::new(KeyRotationManager::from_keyset(KeySet::new(entry))));

        let env = svc.encrypt_str("body").unwrap();
        assert_eq!(svc.decrypt_str(&env).unwrap(), "body");
    }

    #[test]
    fn overlong_key_id_cannot_be_encoded() {
        let env = Envelope {
            key_id: "k".repeat(300),
            nonce: [0u8; NONCE_LEN],
            ciphertext: vec![1, 2, 3],
        };
        assert!(matches!(env.encode(), Err(CryptoError::Malformed(_))));
    }

    #[test]
    fn re_encrypt_moves_to_active_key() {
        let svc = service();
        let old = svc.encrypt_str("migrate me").unwrap();
        let new_id = svc.keys().rotate_keys().unwrap();

        let migrated = svc.re_encrypt(&old).unwrap();
        assert_eq!(EncryptionService::key_id_of(&migrated).unwrap(), new_id);
        assert_eq!(svc.decrypt_str(&migrated).unwrap(), "migrate me");
        assert_eq!(svc.re_encrypt(&migrated).unwrap(), migrated);
    }
}
