//! Symmetric encryption layer using ChaCha20-Poly1305 AEAD
//!
//! Bulk encryption primitive for the hybrid envelope: the asymmetric
//! side only ever seals the 32-byte session key, everything else goes
//! through this cipher.
//!
//! Output format: `[nonce (12 bytes)] + [ciphertext + auth tag (16 bytes)]`

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

use crate::error::SecurityError;

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// AEAD cipher bound to one 32-byte key.
///
/// A fresh random nonce is generated per encryption and prepended to
/// the ciphertext, so the same plaintext never encrypts to the same
/// bytes twice.
pub struct PayloadCipher {
    cipher: ChaCha20Poly1305,
}

impl PayloadCipher {
    /// Create a cipher for the given 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Generate a random 32-byte session key.
    pub fn generate_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        key
    }

    /// Encrypt `plaintext`, returning `[nonce] + [ciphertext + tag]`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| SecurityError::Decryption(format!("encryption failed: {}", e)))?;

        let mut result = nonce_bytes.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt data produced by [`encrypt`](Self::encrypt).
    ///
    /// Fails on a wrong key, tampered bytes, or truncated input; the
    /// AEAD tag detects any modification of nonce or ciphertext.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, SecurityError> {
        if data.len() < NONCE_SIZE {
            return Err(SecurityError::Decryption(
                "data too short to contain nonce".to_string(),
            ));
        }

        let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, &data[NONCE_SIZE..])
            .map_err(|e| SecurityError::Decryption(e.to_string()))
    }
}
