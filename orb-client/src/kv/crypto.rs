//! Scope encryption with AES-256-GCM
//!
//! Format: nonce_12bytes || ciphertext || tag_16bytes

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use zeroize::Zeroize;

use crate::error::{OrbError, OrbResult};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// Key used for values stored under encrypted scopes
#[derive(Clone)]
pub struct ScopeKey {
    key: [u8; KEY_LEN],
}

impl Drop for ScopeKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ScopeKey(..)")
    }
}

impl ScopeKey {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    pub fn from_slice(bytes: &[u8]) -> OrbResult<Self> {
        if bytes.len() != KEY_LEN {
            return Err(OrbError::Crypto(format!(
                "key has {} bytes, expected {KEY_LEN}",
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    /// Random key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut key);
        Self { key }
    }

    /// Encrypt plaintext → nonce || ciphertext || tag
    pub fn encrypt(&self, plaintext: &[u8]) -> OrbResult<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| OrbError::Crypto("invalid key".into()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| OrbError::Crypto("encryption failed".into()))?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt nonce || ciphertext || tag → plaintext
    pub fn decrypt(&self, data: &[u8]) -> OrbResult<Vec<u8>> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(OrbError::Crypto("ciphertext too short".into()));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| OrbError::Crypto("invalid key".into()))?;
        let nonce = Nonce::from_slice(&data[..NONCE_LEN]);

        cipher
            .decrypt(nonce, &data[NONCE_LEN..])
            .map_err(|_| OrbError::Crypto("decryption failed (wrong key or tampered data)".into()))
    }
}
