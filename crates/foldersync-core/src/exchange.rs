//! Secure message exchange between pinned counterparties
//!
//! Wraps [`CryptoEnvelope`] with per-counterparty key lookup, an HMAC
//! transport signature under a per-counterparty shared secret, and
//! replay/expiry defenses. Stateful but network-agnostic: the host
//! decides how [`SecureMessage`] values travel.
//!
//! ## Verification order
//!
//! `open_message` short-circuits in this exact order:
//!
//! 1. timestamp older than the replay window → expired
//! 2. message ID already seen → replay
//! 3. counterparty not pinned → unknown client
//! 4. HMAC over the encrypted payload mismatches → invalid signature
//! 5. envelope decrypt + payload signature verify
//! 6. deserialize to the requested type
//!
//! The transport HMAC is checked before decryption is ever attempted.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::envelope::CryptoEnvelope;
use crate::error::{SecurityError, SyncError, SyncResult};
use crate::keys::{PublicKeyBundle, SyncKeypair};

type HmacSha256 = Hmac<Sha256>;

/// Messages older than this are rejected regardless of ID novelty.
pub const REPLAY_WINDOW: Duration = Duration::from_secs(5 * 60);

/// The cryptographic wire envelope exchanged between two identities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureMessage {
    /// Unique per message; the replay-detection key
    pub message_id: Uuid,

    /// Identity that created the message; the receiver resolves key
    /// material by this id, so it must match a pinned counterparty
    pub counterparty_id: String,

    /// Creation time, unix seconds
    pub timestamp: i64,

    /// Base64 HMAC-SHA256 of `encrypted_payload` under the shared
    /// secret for `counterparty_id`
    pub transport_signature: String,

    /// Base64 sealed [`CryptoEnvelope`] output
    pub encrypted_payload: String,
}

/// Pinned key material for one counterparty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counterparty {
    /// Public halves of the counterparty's key pair
    pub public_keys: PublicKeyBundle,
    /// Shared secret for the transport HMAC
    pub shared_secret: Vec<u8>,
}

/// Set of recently accepted message IDs with per-entry expiry.
///
/// Each ID is remembered for the full replay window and pruned
/// individually once its own window lapses; there is no bulk clear an
/// attacker could time a replay around. Pruning is amortized across
/// calls, which bounds memory to the IDs accepted in one window.
pub struct ReplayCache {
    window: Duration,
    seen: Mutex<HashMap<Uuid, Instant>>,
}

impl ReplayCache {
    /// Create a cache that remembers IDs for `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record `id` if it is new. Returns `false` when the ID was
    /// already accepted within the window. Safe to call from multiple
    /// threads.
    pub fn check_and_record(&self, id: Uuid) -> bool {
        let mut seen = self.seen.lock();
        let now = Instant::now();
        seen.retain(|_, at| now.duration_since(*at) < self.window);

        match seen.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    /// Number of IDs currently remembered.
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    /// Whether the cache is currently empty.
    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}

/// Produces and consumes [`SecureMessage`] values for a fixed set of
/// known counterparties.
pub struct SecureMessageExchange {
    local_id: String,
    keypair: SyncKeypair,
    counterparties: RwLock<HashMap<String, Counterparty>>,
    replay: ReplayCache,
    max_age: Duration,
}

impl SecureMessageExchange {
    /// Create an exchange for the local identity `local_id` holding an
    /// unlocked `keypair`.
    pub fn new(local_id: impl Into<String>, keypair: SyncKeypair) -> Self {
        Self {
            local_id: local_id.into(),
            keypair,
            counterparties: RwLock::new(HashMap::new()),
            replay: ReplayCache::new(REPLAY_WINDOW),
            max_age: REPLAY_WINDOW,
        }
    }

    /// Local identity string.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Pin a counterparty's public keys and transport shared secret.
    /// Re-pinning replaces the previous material.
    pub fn add_counterparty(
        &self,
        counterparty_id: impl Into<String>,
        public_keys: PublicKeyBundle,
        shared_secret: Vec<u8>,
    ) {
        let id = counterparty_id.into();
        debug!(counterparty = %id, fingerprint = %public_keys.fingerprint(), "Pinning counterparty keys");
        self.counterparties.write().insert(
            id,
            Counterparty {
                public_keys,
                shared_secret,
            },
        );
    }

    /// Remove a pinned counterparty. No-op if absent.
    pub fn remove_counterparty(&self, counterparty_id: &str) {
        self.counterparties.write().remove(counterparty_id);
    }

    /// Whether `counterparty_id` is pinned.
    pub fn knows(&self, counterparty_id: &str) -> bool {
        self.counterparties.read().contains_key(counterparty_id)
    }

    /// Serialize, seal, and transport-sign `payload` for one
    /// counterparty.
    pub fn create_message<T: Serialize>(
        &self,
        payload: &T,
        counterparty_id: &str,
    ) -> SyncResult<SecureMessage> {
        let counterparty = self
            .counterparty(counterparty_id)
            .ok_or_else(|| SecurityError::UnknownClient(counterparty_id.to_string()))?;

        let plaintext =
            serde_json::to_vec(payload).map_err(|e| SyncError::Serialization(e.to_string()))?;
        let sealed = CryptoEnvelope::seal(&plaintext, &counterparty.public_keys, &self.keypair)?;
        let encrypted_payload = BASE64.encode(&sealed);

        let transport_signature =
            BASE64.encode(compute_hmac(&counterparty.shared_secret, &encrypted_payload)?);

        Ok(SecureMessage {
            message_id: Uuid::new_v4(),
            counterparty_id: self.local_id.clone(),
            timestamp: Utc::now().timestamp(),
            transport_signature,
            encrypted_payload,
        })
    }

    /// Verify and open an inbound [`SecureMessage`], deserializing the
    /// plaintext to `T`.
    pub fn open_message<T: DeserializeOwned>(&self, message: &SecureMessage) -> SyncResult<T> {
        // 1. Expiry
        let age_secs = Utc::now().timestamp() - message.timestamp;
        if age_secs > self.max_age.as_secs() as i64 {
            warn!(message_id = %message.message_id, age_secs, "Rejecting expired message");
            return Err(SecurityError::Expired(age_secs).into());
        }

        // 2. Replay
        if !self.replay.check_and_record(message.message_id) {
            warn!(message_id = %message.message_id, "Rejecting replayed message");
            return Err(SecurityError::Replay(message.message_id.to_string()).into());
        }

        // 3. Counterparty lookup
        let counterparty = self
            .counterparty(&message.counterparty_id)
            .ok_or_else(|| SecurityError::UnknownClient(message.counterparty_id.clone()))?;

        // 4. Transport HMAC, before any decryption
        let presented = BASE64.decode(&message.transport_signature).map_err(|_| {
            SecurityError::InvalidSignature("transport signature is not valid base64".to_string())
        })?;
        let mut mac = HmacSha256::new_from_slice(&counterparty.shared_secret)
            .map_err(|e| SecurityError::InvalidKey(e.to_string()))?;
        mac.update(message.encrypted_payload.as_bytes());
        // verify_slice is constant time
        if mac.verify_slice(&presented).is_err() {
            return Err(SecurityError::InvalidSignature(
                "transport HMAC mismatch".to_string(),
            )
            .into());
        }

        // 5. Envelope open (decrypt, verify payload signature, decompress)
        let sealed = BASE64.decode(&message.encrypted_payload).map_err(|_| {
            SecurityError::Decryption("encrypted payload is not valid base64".to_string())
        })?;
        let plaintext = CryptoEnvelope::open(&sealed, &self.keypair, &counterparty.public_keys)?;

        // 6. Deserialize
        serde_json::from_slice(&plaintext).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    fn counterparty(&self, id: &str) -> Option<Counterparty> {
        self.counterparties.read().get(id).cloned()
    }
}

/// HMAC-SHA256 over the base64 encrypted payload as transmitted.
fn compute_hmac(shared_secret: &[u8], encrypted_payload: &str) -> Result<Vec<u8>, SecurityError> {
    let mut mac = HmacSha256::new_from_slice(shared_secret)
        .map_err(|e| SecurityError::InvalidKey(e.to_string()))?;
    mac.update(encrypted_payload.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}
