//! Long-lived identity key pairs
//!
//! Each protocol identity (the server, each client) owns one key pair
//! with two halves:
//!
//! - an Ed25519 signing key (signatures hash with SHA-512 internally)
//! - an X25519 exchange key for sealing session keys to this identity
//!
//! Private halves never leave their owner. At rest they are wrapped
//! under a passphrase-derived key (Argon2id → ChaCha20-Poly1305), so a
//! stolen key store is useless without the passphrase. Public bundles
//! of all counterparties must be distributed and pinned out-of-band
//! before the protocol can operate.

use argon2::{Algorithm, Argon2, Params, Version};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use crate::crypto::PayloadCipher;
use crate::error::{SecurityError, SyncError, SyncResult};

/// Argon2id memory cost in KiB for passphrase wrapping
const KDF_MEMORY_KIB: u32 = 19_456;
/// Argon2id iteration count
const KDF_ITERATIONS: u32 = 2;
/// Argon2id parallelism
const KDF_PARALLELISM: u32 = 1;

/// An unlocked key pair: both private halves in memory.
pub struct SyncKeypair {
    signing: SigningKey,
    exchange: X25519StaticSecret,
}

impl SyncKeypair {
    /// Generate a fresh random key pair.
    pub fn generate() -> SyncResult<Self> {
        let mut signing_seed = [0u8; 32];
        getrandom::getrandom(&mut signing_seed)
            .map_err(|e| SyncError::KeyGeneration(format!("entropy unavailable: {}", e)))?;
        let mut exchange_seed = [0u8; 32];
        getrandom::getrandom(&mut exchange_seed)
            .map_err(|e| SyncError::KeyGeneration(format!("entropy unavailable: {}", e)))?;

        Ok(Self {
            signing: SigningKey::from_bytes(&signing_seed),
            exchange: X25519StaticSecret::from(exchange_seed),
        })
    }

    /// Public halves of this key pair.
    pub fn public_keys(&self) -> PublicKeyBundle {
        PublicKeyBundle {
            signing: self.signing.verifying_key().to_bytes(),
            exchange: X25519PublicKey::from(&self.exchange).to_bytes(),
        }
    }

    /// Sign `message` with the Ed25519 half.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_vec()
    }

    /// The X25519 secret, for Diffie-Hellman during envelope open.
    pub(crate) fn exchange_secret(&self) -> &X25519StaticSecret {
        &self.exchange
    }

    /// Wrap the private halves under a passphrase for storage.
    pub fn lock(&self, passphrase: &str) -> SyncResult<EncryptedKeypair> {
        let mut salt = [0u8; 16];
        getrandom::getrandom(&mut salt)
            .map_err(|e| SyncError::KeyGeneration(format!("entropy unavailable: {}", e)))?;

        let key = derive_wrapping_key(passphrase, &salt)?;
        let mut seeds = [0u8; 64];
        seeds[..32].copy_from_slice(&self.signing.to_bytes());
        seeds[32..].copy_from_slice(&self.exchange.to_bytes());

        let sealed_seeds = PayloadCipher::new(&key).encrypt(&seeds)?;
        Ok(EncryptedKeypair { salt, sealed_seeds })
    }
}

impl std::fmt::Debug for SyncKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncKeypair")
            .field("fingerprint", &self.public_keys().fingerprint())
            .finish_non_exhaustive()
    }
}

/// Public halves of one identity's key pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyBundle {
    /// Ed25519 verifying key bytes
    pub signing: [u8; 32],
    /// X25519 public key bytes
    pub exchange: [u8; 32],
}

impl PublicKeyBundle {
    /// Verify an Ed25519 signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.signing) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &sig).is_ok()
    }

    /// Stable fingerprint for pinning and display: base58 BLAKE3 of
    /// both public halves.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.signing);
        hasher.update(&self.exchange);
        bs58::encode(hasher.finalize().as_bytes()).into_string()
    }

    /// The X25519 public key, for sealing session keys to this identity.
    pub(crate) fn exchange_public(&self) -> X25519PublicKey {
        X25519PublicKey::from(self.exchange)
    }
}

/// Passphrase-wrapped private halves, safe to persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedKeypair {
    /// Argon2id salt
    pub salt: [u8; 16],
    /// Wrapped `[signing seed (32)] + [exchange seed (32)]`
    pub sealed_seeds: Vec<u8>,
}

impl EncryptedKeypair {
    /// Recover the key pair. Fails with a [`SecurityError`] on a wrong
    /// passphrase or corrupted key material.
    pub fn unlock(&self, passphrase: &str) -> Result<SyncKeypair, SecurityError> {
        let key = derive_wrapping_key(passphrase, &self.salt)
            .map_err(|e| SecurityError::InvalidKey(e.to_string()))?;

        let seeds = PayloadCipher::new(&key)
            .decrypt(&self.sealed_seeds)
            .map_err(|_| {
                SecurityError::Decryption("wrong passphrase or corrupted key material".to_string())
            })?;

        if seeds.len() != 64 {
            return Err(SecurityError::InvalidKey(
                "unwrapped key material has wrong length".to_string(),
            ));
        }

        let signing_seed: [u8; 32] = seeds[..32].try_into().expect("length checked");
        let exchange_seed: [u8; 32] = seeds[32..].try_into().expect("length checked");

        Ok(SyncKeypair {
            signing: SigningKey::from_bytes(&signing_seed),
            exchange: X25519StaticSecret::from(exchange_seed),
        })
    }
}

/// A generated identity key pair: public bundle plus the wrapped
/// private halves, ready to persist in the key store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsymmetricKeyPair {
    /// Identity string the pair was generated for
    pub identity: String,
    /// Fingerprint of the public bundle
    pub fingerprint: String,
    /// Public halves, distributed out-of-band to counterparties
    pub public: PublicKeyBundle,
    /// Passphrase-wrapped private halves
    pub private: EncryptedKeypair,
    /// Generation time
    pub created_at: DateTime<Utc>,
}

/// Derive the 32-byte key-wrapping key from a passphrase.
fn derive_wrapping_key(passphrase: &str, salt: &[u8; 16]) -> SyncResult<[u8; 32]> {
    let params = Params::new(KDF_MEMORY_KIB, KDF_ITERATIONS, KDF_PARALLELISM, Some(32))
        .map_err(|e| SyncError::KeyGeneration(format!("bad KDF parameters: {}", e)))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| SyncError::KeyGeneration(format!("key derivation failed: {}", e)))?;
    Ok(key)
}
