//! End-to-end cryptographic envelope: compress, sign, hybrid-encrypt
//!
//! Turns a plaintext byte buffer into an authenticated-and-confidential
//! buffer addressed to one recipient and signed by one sender, and back.
//! Pure transform; no network, no shared state.
//!
//! ## Seal pipeline
//!
//! ```text
//! 1. literal   = zstd(plaintext)
//! 2. signature = ed25519_sign(sender, literal)
//! 3. bundle    = postcard(SignedBundle { signature, literal })
//! 4. body      = ChaCha20-Poly1305(session_key, bundle)
//! 5. kek       = HKDF-SHA256(x25519(ephemeral, recipient_pk))
//! 6. sealed    = ChaCha20-Poly1305(kek, session_key)
//! 7. output    = postcard(SealedEnvelope { ephemeral_pk, sealed, body })
//! ```
//!
//! Open reverses the pipeline and verifies the signature **before** any
//! plaintext is returned to the caller. The signed bundle is a tagged
//! container with three layouts (signature-first, one-pass, literal-first)
//! because real-world encoders vary in where they place the signature;
//! `open` accepts all three, `seal` always emits the one-pass layout.

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use crate::crypto::PayloadCipher;
use crate::error::{SecurityError, SyncError, SyncResult};
use crate::keys::{AsymmetricKeyPair, PublicKeyBundle, SyncKeypair};

/// Current envelope format version
pub const ENVELOPE_VERSION: u8 = 1;

/// Domain separation string for session-key derivation
const HKDF_INFO: &[u8] = b"foldersync-envelope-v1";

/// zstd compression level for the literal stage (0 = library default)
const COMPRESSION_LEVEL: i32 = 0;

/// Signed plaintext container inside the encrypted body.
///
/// All three layouts carry the same two fields; they differ only in
/// declared ordering, mirroring the orderings seen in the wild.
#[derive(Debug, Serialize, Deserialize)]
enum SignedBundle {
    /// Signature packet precedes the literal data
    SignatureThenLiteral {
        signature: Vec<u8>,
        literal: Vec<u8>,
    },
    /// One-pass signature header, then literal data
    OnePassSignature {
        signature: Vec<u8>,
        literal: Vec<u8>,
    },
    /// Literal data first, detached signature after
    LiteralThenSignature {
        literal: Vec<u8>,
        signature: Vec<u8>,
    },
}

impl SignedBundle {
    fn into_parts(self) -> (Vec<u8>, Vec<u8>) {
        match self {
            SignedBundle::SignatureThenLiteral { signature, literal }
            | SignedBundle::OnePassSignature { signature, literal }
            | SignedBundle::LiteralThenSignature { literal, signature } => (literal, signature),
        }
    }
}

/// Outer wire structure of a sealed envelope.
#[derive(Debug, Serialize, Deserialize)]
struct SealedEnvelope {
    /// Format version for future evolution
    version: u8,
    /// Ephemeral X25519 public key for this envelope
    ephemeral_public: [u8; 32],
    /// Session key wrapped under the HKDF-derived key (nonce prepended)
    sealed_session_key: Vec<u8>,
    /// Signed bundle encrypted under the session key (nonce prepended)
    body: Vec<u8>,
}

/// Compress + sign + hybrid-encrypt transform between two pinned
/// identities. Stateless; all methods are associated functions.
pub struct CryptoEnvelope;

impl CryptoEnvelope {
    /// Generate a long-lived key pair for `identity`, with the private
    /// halves wrapped under `passphrase`.
    ///
    /// Fails with [`SyncError::KeyGeneration`] on an invalid identity
    /// string or if system entropy is unavailable.
    pub fn generate_key_pair(identity: &str, passphrase: &str) -> SyncResult<AsymmetricKeyPair> {
        if identity.trim().is_empty() {
            return Err(SyncError::KeyGeneration(
                "identity must not be empty".to_string(),
            ));
        }
        if identity.chars().any(|c| c.is_control()) {
            return Err(SyncError::KeyGeneration(
                "identity must not contain control characters".to_string(),
            ));
        }

        let keypair = SyncKeypair::generate()?;
        let public = keypair.public_keys();
        Ok(AsymmetricKeyPair {
            identity: identity.to_string(),
            fingerprint: public.fingerprint(),
            public,
            private: keypair.lock(passphrase)?,
            created_at: chrono::Utc::now(),
        })
    }

    /// Seal `plaintext` for `recipient`, signed by `sender`.
    pub fn seal(
        plaintext: &[u8],
        recipient: &PublicKeyBundle,
        sender: &SyncKeypair,
    ) -> SyncResult<Vec<u8>> {
        // 1. Compress
        let literal = zstd::encode_all(plaintext, COMPRESSION_LEVEL)
            .map_err(|e| SyncError::Serialization(format!("compression failed: {}", e)))?;

        // 2. Sign the compressed bytes (Ed25519, SHA-512 internally)
        let signature = sender.sign(&literal);

        // 3. Bundle
        let bundle = postcard::to_allocvec(&SignedBundle::OnePassSignature { signature, literal })
            .map_err(|e| SyncError::Serialization(e.to_string()))?;

        // 4. Encrypt the bundle under a fresh session key
        let session_key = PayloadCipher::generate_key();
        let body = PayloadCipher::new(&session_key).encrypt(&bundle)?;

        // 5. Seal the session key for the recipient
        let mut ephemeral_seed = [0u8; 32];
        getrandom::getrandom(&mut ephemeral_seed)
            .map_err(|e| SyncError::KeyGeneration(format!("entropy unavailable: {}", e)))?;
        let ephemeral_secret = X25519StaticSecret::from(ephemeral_seed);
        let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

        let shared = ephemeral_secret.diffie_hellman(&recipient.exchange_public());
        let kek = derive_session_kek(shared.as_bytes());
        let sealed_session_key = PayloadCipher::new(&kek).encrypt(&session_key)?;

        postcard::to_allocvec(&SealedEnvelope {
            version: ENVELOPE_VERSION,
            ephemeral_public: ephemeral_public.to_bytes(),
            sealed_session_key,
            body,
        })
        .map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Open a sealed envelope addressed to `recipient`, verifying it
    /// was signed by `sender_public`.
    ///
    /// The signature is checked before the plaintext is decompressed or
    /// returned; any tampering fails with a [`SecurityError`].
    pub fn open(
        data: &[u8],
        recipient: &SyncKeypair,
        sender_public: &PublicKeyBundle,
    ) -> SyncResult<Vec<u8>> {
        let envelope: SealedEnvelope = postcard::from_bytes(data).map_err(|_| {
            SyncError::Security(SecurityError::Decryption(
                "malformed envelope structure".to_string(),
            ))
        })?;

        if envelope.version != ENVELOPE_VERSION {
            return Err(SyncError::Protocol(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }

        // Recover the session key
        let ephemeral = X25519PublicKey::from(envelope.ephemeral_public);
        let shared = recipient.exchange_secret().diffie_hellman(&ephemeral);
        let kek = derive_session_kek(shared.as_bytes());
        let session_key_bytes = PayloadCipher::new(&kek).decrypt(&envelope.sealed_session_key)?;

        let session_key: [u8; 32] = session_key_bytes.as_slice().try_into().map_err(|_| {
            SyncError::Security(SecurityError::Decryption(
                "session key has wrong length".to_string(),
            ))
        })?;

        // Decrypt the bundle, accepting any of the three layouts
        let bundle_bytes = PayloadCipher::new(&session_key).decrypt(&envelope.body)?;
        let bundle: SignedBundle = postcard::from_bytes(&bundle_bytes).map_err(|_| {
            SyncError::Security(SecurityError::Decryption(
                "malformed signed bundle".to_string(),
            ))
        })?;
        let (literal, signature) = bundle.into_parts();

        // Verify before releasing any plaintext
        if !sender_public.verify(&literal, &signature) {
            return Err(SyncError::Security(SecurityError::InvalidSignature(
                "payload signature does not match sender".to_string(),
            )));
        }

        zstd::decode_all(literal.as_slice())
            .map_err(|e| SyncError::Serialization(format!("decompression failed: {}", e)))
    }
}

/// Derive the key-encryption key from an X25519 shared secret.
fn derive_session_kek(shared_secret: &[u8]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut kek = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut kek)
        .expect("HKDF expand cannot fail for 32-byte output");
    kek
}
