pub mod encryption;
pub mod keys;

use thiserror::Error;

pub use encryption::{EncryptionService, Envelope};
pub use keys::{KeyConfig, KeyRetention, KeyRotationManager, KeySet};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("unknown key id '{0}'")]
    UnknownKey(String),

    #[error("ciphertext failed authentication")]
    Integrity,

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("key rejected: {0}")]
    WeakKey(String),

    #[error("key rotation failed: {0}")]
    Rotation(String),

    #[error("random number generator failure")]
    Rng,

    #[error("encryption failed")]
    Seal,
}

impl CryptoError {
    /// Tampering or corruption, as opposed to a missing key or bad input.
    pub fn is_integrity(&self) -> bool {
        matches!(self, CryptoError::Integrity)
    }
}
