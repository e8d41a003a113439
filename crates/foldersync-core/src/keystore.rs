//! Persistent key store backed by redb.
//!
//! Holds the two kinds of long-lived key material the protocol needs
//! between runs:
//!
//! - our own identity key pairs, passphrase-wrapped (never plaintext
//!   at rest)
//! - pinned counterparty records: public key bundle plus the transport
//!   HMAC secret, keyed by counterparty ID
//!
//! Records are postcard-encoded. All operations run in their own
//! transaction; redb gives ACID semantics, so a crashed write never
//! leaves a half-written record.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use crate::keys::{AsymmetricKeyPair, PublicKeyBundle};

const KEYPAIRS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("keypairs");
const COUNTERPARTIES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("counterparties");

/// A pinned counterparty: everything needed to exchange secure
/// messages with one remote identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterpartyRecord {
    /// Counterparty identifier (the protocol client ID)
    pub counterparty_id: String,
    /// Pinned public key bundle
    pub public_keys: PublicKeyBundle,
    /// Shared secret for the transport HMAC
    pub shared_secret: Vec<u8>,
    /// When the keys were pinned
    pub pinned_at: DateTime<Utc>,
}

impl CounterpartyRecord {
    /// Pin a counterparty's key material, stamped with the current time.
    pub fn new(
        counterparty_id: impl Into<String>,
        public_keys: PublicKeyBundle,
        shared_secret: Vec<u8>,
    ) -> Self {
        Self {
            counterparty_id: counterparty_id.into(),
            public_keys,
            shared_secret,
            pinned_at: Utc::now(),
        }
    }
}

/// Key store using redb for ACID-compliant persistence.
#[derive(Clone)]
pub struct KeyStore {
    db: Arc<RwLock<Database>>,
}

impl KeyStore {
    /// Open (or create) the key store at the given path.
    pub fn new(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(KEYPAIRS_TABLE)?;
            let _ = write_txn.open_table(COUNTERPARTIES_TABLE)?;
        }
        write_txn.commit()?;

        info!(path = %path.display(), "Key store opened");
        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Save an identity key pair. The private halves inside are already
    /// passphrase-wrapped; an existing pair for the same identity is
    /// overwritten.
    pub fn save_keypair(&self, pair: &AsymmetricKeyPair) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(KEYPAIRS_TABLE)?;
            let data =
                postcard::to_allocvec(pair).map_err(|e| SyncError::Serialization(e.to_string()))?;
            table.insert(pair.identity.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        debug!(identity = %pair.identity, fingerprint = %pair.fingerprint, "Saved key pair");
        Ok(())
    }

    /// Load the key pair for an identity.
    pub fn load_keypair(&self, identity: &str) -> SyncResult<AsymmetricKeyPair> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(KEYPAIRS_TABLE)?;

        match table.get(identity)? {
            Some(v) => postcard::from_bytes(v.value())
                .map_err(|e| SyncError::Serialization(e.to_string())),
            None => Err(SyncError::KeyNotFound(identity.to_string())),
        }
    }

    /// Whether a key pair exists for an identity.
    pub fn has_keypair(&self, identity: &str) -> SyncResult<bool> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(KEYPAIRS_TABLE)?;
        Ok(table.get(identity)?.is_some())
    }

    /// Delete the key pair for an identity. Returns whether a record
    /// was removed.
    pub fn delete_keypair(&self, identity: &str) -> SyncResult<bool> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(KEYPAIRS_TABLE)?;
            // Drop the access guard before the table
            let removed = table.remove(identity)?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Pin a counterparty record, replacing any previous pin for the
    /// same counterparty.
    pub fn save_counterparty(&self, record: &CounterpartyRecord) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(COUNTERPARTIES_TABLE)?;
            let data = postcard::to_allocvec(record)
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            table.insert(record.counterparty_id.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        debug!(
            counterparty = %record.counterparty_id,
            fingerprint = %record.public_keys.fingerprint(),
            "Pinned counterparty"
        );
        Ok(())
    }

    /// Load one counterparty record.
    pub fn load_counterparty(&self, counterparty_id: &str) -> SyncResult<CounterpartyRecord> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(COUNTERPARTIES_TABLE)?;

        match table.get(counterparty_id)? {
            Some(v) => postcard::from_bytes(v.value())
                .map_err(|e| SyncError::Serialization(e.to_string())),
            None => Err(SyncError::KeyNotFound(counterparty_id.to_string())),
        }
    }

    /// Load every pinned counterparty, for seeding a
    /// [`SecureMessageExchange`](crate::exchange::SecureMessageExchange)
    /// at startup.
    pub fn list_counterparties(&self) -> SyncResult<Vec<CounterpartyRecord>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(COUNTERPARTIES_TABLE)?;

        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let record: CounterpartyRecord = postcard::from_bytes(value.value())
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Remove a counterparty pin. Returns whether a record was removed.
    pub fn delete_counterparty(&self, counterparty_id: &str) -> SyncResult<bool> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(COUNTERPARTIES_TABLE)?;
            // Drop the access guard before the table
            let removed = table.remove(counterparty_id)?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::CryptoEnvelope;
    use crate::keys::SyncKeypair;

    fn temp_store() -> (KeyStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path().join("keys.redb")).unwrap();
        (store, dir)
    }

    #[test]
    fn test_keypair_roundtrip() {
        let (store, _dir) = temp_store();
        let pair = CryptoEnvelope::generate_key_pair("server", "passphrase").unwrap();

        store.save_keypair(&pair).unwrap();
        assert!(store.has_keypair("server").unwrap());

        let loaded = store.load_keypair("server").unwrap();
        assert_eq!(loaded.identity, "server");
        assert_eq!(loaded.fingerprint, pair.fingerprint);
        assert_eq!(loaded.public, pair.public);

        // The wrapped private halves survived storage intact.
        let unlocked = loaded.private.unlock("passphrase").unwrap();
        assert_eq!(unlocked.public_keys(), pair.public);
    }

    #[test]
    fn test_missing_keypair_is_not_found() {
        let (store, _dir) = temp_store();
        let result = store.load_keypair("nobody");
        assert!(matches!(result, Err(SyncError::KeyNotFound(_))));
    }

    #[test]
    fn test_delete_keypair() {
        let (store, _dir) = temp_store();
        let pair = CryptoEnvelope::generate_key_pair("server", "pw").unwrap();
        store.save_keypair(&pair).unwrap();

        assert!(store.delete_keypair("server").unwrap());
        assert!(!store.has_keypair("server").unwrap());
        assert!(!store.delete_keypair("server").unwrap());
    }

    #[test]
    fn test_counterparty_roundtrip_and_list() {
        let (store, _dir) = temp_store();
        let a = SyncKeypair::generate().unwrap();
        let b = SyncKeypair::generate().unwrap();

        store
            .save_counterparty(&CounterpartyRecord::new(
                "client-1",
                a.public_keys(),
                b"secret-1".to_vec(),
            ))
            .unwrap();
        store
            .save_counterparty(&CounterpartyRecord::new(
                "client-2",
                b.public_keys(),
                b"secret-2".to_vec(),
            ))
            .unwrap();

        let loaded = store.load_counterparty("client-1").unwrap();
        assert_eq!(loaded.public_keys, a.public_keys());
        assert_eq!(loaded.shared_secret, b"secret-1");

        let all = store.list_counterparties().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_delete_counterparty() {
        let (store, _dir) = temp_store();
        let kp = SyncKeypair::generate().unwrap();
        store
            .save_counterparty(&CounterpartyRecord::new(
                "client-1",
                kp.public_keys(),
                b"s".to_vec(),
            ))
            .unwrap();

        assert!(store.delete_counterparty("client-1").unwrap());
        assert!(store.load_counterparty("client-1").is_err());
        assert!(!store.delete_counterparty("client-1").unwrap());
    }

    #[test]
    fn test_repin_replaces_previous_keys() {
        let (store, _dir) = temp_store();
        let old = SyncKeypair::generate().unwrap();
        let new = SyncKeypair::generate().unwrap();

        store
            .save_counterparty(&CounterpartyRecord::new(
                "client-1",
                old.public_keys(),
                b"s".to_vec(),
            ))
            .unwrap();
        store
            .save_counterparty(&CounterpartyRecord::new(
                "client-1",
                new.public_keys(),
                b"s".to_vec(),
            ))
            .unwrap();

        let loaded = store.load_counterparty("client-1").unwrap();
        assert_eq!(loaded.public_keys, new.public_keys());
    }

    #[test]
    fn test_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.redb");
        let pair = CryptoEnvelope::generate_key_pair("server", "pw").unwrap();

        {
            let store = KeyStore::new(&path).unwrap();
            store.save_keypair(&pair).unwrap();
        }

        let reopened = KeyStore::new(&path).unwrap();
        let loaded = reopened.load_keypair("server").unwrap();
        assert_eq!(loaded.fingerprint, pair.fingerprint);
    }
}
