//! Authenticated encryption for stored broker connection strings.
//!
//! A namespace's credential is never written to the store in the clear.
//! [`ConnectionStringProtector`] wraps AES-256-GCM behind a versioned,
//! base64-encoded envelope so that old ciphertext keeps decrypting across a
//! key rotation (new values are written under the current version; bulk
//! re-encryption of old rows is not this type's job).

use aes_gcm::aead::{generic_array::GenericArray, Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use thiserror::Error;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const CURRENT_VERSION: &str = "V2";

/// Errors raised while protecting or unprotecting a connection string.
#[derive(Debug, Error)]
pub enum ProtectorError {
    /// The supplied master key is not 32 bytes.
    #[error("master key must be {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    /// The stored payload doesn't carry a recognized version prefix.
    #[error("unknown encryption version: {0}")]
    UnknownVersion(String),

    /// The payload isn't validly base64, or is too short to contain a nonce.
    #[error("malformed encrypted payload")]
    MalformedPayload,

    /// Decryption failed: wrong key or a tampered/corrupted ciphertext.
    #[error("failed to decrypt payload: authentication tag mismatch")]
    DecryptFailed,
}

/// Encrypts and decrypts namespace credentials with AES-256-GCM.
///
/// The master key is supplied externally (environment or key vault) and
/// never persisted by this type.
pub struct ConnectionStringProtector {
    cipher: Aes256Gcm,
}

impl ConnectionStringProtector {
    /// Build a protector from a raw 256-bit key.
    pub fn new(master_key: &[u8]) -> Result<Self, ProtectorError> {
        if master_key.len() != KEY_LEN {
            return Err(ProtectorError::InvalidKeyLength(master_key.len()));
        }
        let key = GenericArray::from_slice(master_key);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Encrypt `plaintext`, returning `V2:base64(nonce || ciphertext || tag)`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, ProtectorError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| ProtectorError::DecryptFailed)?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ciphertext);

        Ok(format!("{CURRENT_VERSION}:{}", BASE64.encode(payload)))
    }

    /// Decrypt a payload previously produced by [`Self::encrypt`].
    pub fn decrypt(&self, payload: &str) -> Result<String, ProtectorError> {
        let (version, encoded) = payload
            .split_once(':')
            .ok_or(ProtectorError::MalformedPayload)?;

        if version != CURRENT_VERSION {
            return Err(ProtectorError::UnknownVersion(version.to_string()));
        }

        let raw = BASE64
            .decode(encoded)
            .map_err(|_| ProtectorError::MalformedPayload)?;

        if raw.len() < NONCE_LEN {
            return Err(ProtectorError::MalformedPayload);
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| ProtectorError::DecryptFailed)?;

        String::from_utf8(plaintext).map_err(|_| ProtectorError::DecryptFailed)
    }
}
