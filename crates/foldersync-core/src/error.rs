//! Error types for the folder synchronization protocol

use thiserror::Error;

/// Security-critical failures from the cryptographic envelope and
/// secure message exchange.
///
/// These are surfaced as typed failures so the host application can
/// distinguish an attack indicator (replay, tampering) from an
/// operational problem (expired clock skew, missing counterparty key).
#[derive(Error, Debug)]
pub enum SecurityError {
    /// Message timestamp is older than the replay window
    #[error("message expired: sent {0} seconds ago")]
    Expired(i64),

    /// Message ID was already accepted within the replay window
    #[error("replay detected: {0}")]
    Replay(String),

    /// No pinned key material for the counterparty
    #[error("unknown client: {0}")]
    UnknownClient(String),

    /// Transport HMAC or payload signature did not verify
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Decryption failed (wrong key, wrong passphrase, or tampered data)
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Malformed or truncated key material
    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// Main error type for folder synchronization operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Malformed frame or missing required field
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket-level failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Operation requires an active connection
    #[error("not connected")]
    NotConnected,

    /// Key pair generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Error during serialization/deserialization
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Security-critical failure (tampering, replay, expiry, unknown client)
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// Key store record was not found
    #[error("key store entry not found: {0}")]
    KeyNotFound(String),

    /// Database creation/opening error
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
