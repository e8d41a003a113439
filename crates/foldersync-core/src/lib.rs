//! Folder Synchronization Core Library
//!
//! Secure file-change synchronization over TCP with newline-delimited
//! JSON framing. Clients register with a folder subscription set; the
//! server fans each file-change notification out to every other
//! subscriber of that folder.
//!
//! ## Overview
//!
//! - **Line protocol**: one JSON message per line, typed payloads,
//!   unknown types ignored for forward compatibility
//! - **Hybrid payload protection**: zstd compress, Ed25519 sign, then
//!   ChaCha20-Poly1305 under a session key sealed to the recipient via
//!   ephemeral X25519
//! - **Transport authentication**: per-message HMAC-SHA-256 under a
//!   pre-shared secret, with expiry and replay rejection
//! - **Liveness**: heartbeats on the client, stale-client eviction on
//!   the server
//!
//! ## Quick Start
//!
//! ```ignore
//! use foldersync_core::{
//!     ClientConfig, ClientIdentity, FileChangeNotification, ServerConfig,
//!     SyncClient, SyncServer,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = SyncServer::new(ServerConfig::default());
//!     let addr = server.start(9090).await?;
//!
//!     let identity = ClientIdentity::new("c1", "Front desk", ["Reports".to_string()]);
//!     let client = SyncClient::new(identity, ClientConfig::default());
//!     client.connect(&addr.to_string()).await?;
//!
//!     client
//!         .announce(FileChangeNotification::new("f1", "Reports", "abc123", "c1"))
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod exchange;
pub mod keys;
pub mod keystore;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod types;

/// Protocol version announced in registrations.
pub const PROTOCOL_VERSION: &str = "1.0";

// Re-exports
pub use client::{ClientConfig, ClientEvent, ConnectionState, SyncClient};
pub use crypto::PayloadCipher;
pub use envelope::{CryptoEnvelope, ENVELOPE_VERSION};
pub use error::{SecurityError, SyncError, SyncResult};
pub use exchange::{ReplayCache, SecureMessage, SecureMessageExchange, REPLAY_WINDOW};
pub use keys::{AsymmetricKeyPair, EncryptedKeypair, PublicKeyBundle, SyncKeypair};
pub use keystore::{CounterpartyRecord, KeyStore};
pub use protocol::{SyncMessage, SyncPayload};
pub use registry::{ConnectionRegistry, OutboundSender};
pub use server::{ServerConfig, SyncServer};
pub use types::{ClientIdentity, FileChangeNotification};
