//! AES-256-GCM encryption for refresh tokens.
//!
//! Each token is encrypted with a fresh random nonce. The nonce is stored in
//! front of the ciphertext and the whole blob is base64 encoded, so a single
//! column holds everything needed to decrypt it.

use crate::error::{CredentialError, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::fmt;

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
const TAG_SIZE: usize = 16;

/// Master key used to encrypt refresh tokens at rest.
///
/// Loaded once from the environment and held in memory only.
#[derive(Clone)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Decodes a base64-encoded 32-byte key.
    pub fn from_base64(key_base64: &str) -> Result<Self> {
        let key_bytes = BASE64
            .decode(key_base64.trim())
            .map_err(|e| CredentialError::InvalidKey(format!("not valid base64: {}", e)))?;

        Self::from_bytes(&key_bytes)
    }

    pub fn from_bytes(key_bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_SIZE] = key_bytes.try_into().map_err(|_| {
            CredentialError::InvalidKey(format!(
                "must be {} bytes (256 bits), got {} bytes",
                KEY_SIZE,
                key_bytes.len()
            ))
        })?;

        Ok(Self(key))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Encrypts plaintext using AES-256-GCM with a random nonce.
///
/// Returns `base64(nonce || ciphertext || tag)`.
pub fn encrypt(plaintext: &str, key: &EncryptionKey) -> Result<String> {
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;

    // Generate random nonce (never reuse!)
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| CredentialError::Encryption(e.to_string()))?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(blob))
}

/// Decrypts a blob produced by [`encrypt`].
///
/// Fails on malformed base64, truncated input, a wrong key, or any
/// modification of the nonce, ciphertext or tag.
pub fn decrypt(ciphertext: &str, key: &EncryptionKey) -> Result<String> {
    let blob = BASE64
        .decode(ciphertext)
        .map_err(|e| CredentialError::Decryption(format!("invalid base64: {}", e)))?;

    if blob.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CredentialError::Decryption(format!(
            "ciphertext truncated: {} bytes",
            blob.len()
        )));
    }

    let (nonce_bytes, sealed) = blob.split_at(NONCE_SIZE);

    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), sealed)
        .map_err(|_| {
            CredentialError::Decryption("wrong key or corrupted data".to_string())
        })?;

    String::from_utf8(plaintext)
        .map_err(|_| CredentialError::Decryption("plaintext is not valid UTF-8".to_string()))
}
