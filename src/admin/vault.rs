//! At-rest encryption for per-[`crate::db::models::Phone`] telephony-provider credentials
//! (§6, §6a). Distinct from [`crate::admin::crypto`], which protects the bootstrap secret
//! *in transit*; this module protects the provider basic-auth credentials stored in the
//! `phones.encrypted_credentials` column *at rest*, using the master key delivered through
//! that same bootstrap handshake.
//!
//! AES-256-GCM was picked (over extending the bootstrap transport's ChaCha20-Poly1305) to
//! match the concrete crate the wider corpus reaches for when the job is encrypting stored
//! credentials rather than securing a live handshake.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("master key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("malformed credential envelope: {0}")]
    MalformedEnvelope(String),
    #[error("decryption failed, credentials may be corrupt or the key is wrong")]
    DecryptionFailed,
}

/// A 32-byte AES-256-GCM key, decoded once from the base64 config value at startup.
pub struct VaultKey(Key<Aes256Gcm>);

impl VaultKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VaultError> {
        if bytes.len() != 32 {
            return Err(VaultError::InvalidKeyLength(bytes.len()));
        }
        Ok(Self(*Key::<Aes256Gcm>::from_slice(bytes)))
    }
}

/// Encrypt `plaintext` credentials, producing the `iv_hex:ct_hex:tag_hex` envelope format
/// named in §6/§9. AES-GCM's tag is appended to the ciphertext by the `aead` crate; it is
/// split back out here only so the on-disk format matches the three-part layout exactly.
pub fn encrypt_credentials(key: &VaultKey, plaintext: &str) -> Result<String, VaultError> {
    let cipher = Aes256Gcm::new(&key.0);
    let mut iv_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut iv_bytes);
    let nonce = Nonce::from_slice(&iv_bytes);

    let mut sealed = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| VaultError::DecryptionFailed)?;
    let tag = sealed.split_off(sealed.len() - 16);

    Ok(format!("{}:{}:{}", hex::encode(iv_bytes), hex::encode(sealed), hex::encode(tag)))
}

/// Decrypt an `iv_hex:ct_hex:tag_hex` envelope back to the plaintext credentials.
pub fn decrypt_credentials(key: &VaultKey, envelope: &str) -> Result<String, VaultError> {
    let mut parts = envelope.splitn(3, ':');
    let (iv_hex, ct_hex, tag_hex) = match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), Some(c)) => (a, b, c),
        _ => return Err(VaultError::MalformedEnvelope(envelope.to_string())),
    };

    let iv = hex::decode(iv_hex).map_err(|e| VaultError::MalformedEnvelope(e.to_string()))?;
    let ct = hex::decode(ct_hex).map_err(|e| VaultError::MalformedEnvelope(e.to_string()))?;
    let tag = hex::decode(tag_hex).map_err(|e| VaultError::MalformedEnvelope(e.to_string()))?;

    if iv.len() != 12 {
        return Err(VaultError::MalformedEnvelope(format!("iv length {}", iv.len())));
    }

    let mut combined = ct;
    combined.extend_from_slice(&tag);

    let cipher = Aes256Gcm::new(&key.0);
    let nonce = Nonce::from_slice(&iv);
    let plaintext = cipher
        .decrypt(nonce, combined.as_slice())
        .map_err(|_| VaultError::DecryptionFailed)?;

    String::from_utf8(plaintext).map_err(|_| VaultError::DecryptionFailed)
}
