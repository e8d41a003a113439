//! Wire protocol: newline-delimited JSON transport envelopes
//!
//! One [`SyncMessage`] per line, UTF-8 JSON, terminated by `\n`, over a
//! persistent TCP connection. No length prefixing.
//!
//! ## Wire Shape
//!
//! ```text
//! { "type": "FileChange",
//!   "messageId": "<uuid>",
//!   "timestamp": "<ISO-8601>",
//!   "payload": { "notification": { ... } } }
//! ```
//!
//! The `type`/`payload` pair is an adjacently tagged [`SyncPayload`] so
//! each message type's payload is statically known and exhaustively
//! handled. Unrecognized types deserialize to [`SyncPayload::Unknown`]
//! and are logged and ignored rather than killing the connection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::types::{ClientIdentity, FileChangeNotification};

/// Typed payload of a [`SyncMessage`], discriminated by the wire `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SyncPayload {
    /// First message on a connection; carries the client's identity
    Registration {
        #[serde(rename = "clientInfo")]
        client_info: ClientIdentity,
    },

    /// A file changed in a subscribed folder
    FileChange { notification: FileChangeNotification },

    /// Keep-alive; refreshes the sender's `last_seen`
    Heartbeat {},

    /// Receipt for a previously received message
    Acknowledgment {
        #[serde(rename = "messageId")]
        message_id: Uuid,
    },

    /// Server accepted the registration
    RegistrationConfirmed {
        #[serde(rename = "clientId")]
        client_id: String,
    },

    /// Server is shutting down; the connection will close
    ServerShutdown { reason: String },

    /// Peer-reported error
    Error { message: String },

    /// Any type this build does not know about. Never sent.
    #[serde(other)]
    Unknown,
}

impl SyncPayload {
    /// Short name of the payload type, for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncPayload::Registration { .. } => "Registration",
            SyncPayload::FileChange { .. } => "FileChange",
            SyncPayload::Heartbeat {} => "Heartbeat",
            SyncPayload::Acknowledgment { .. } => "Acknowledgment",
            SyncPayload::RegistrationConfirmed { .. } => "RegistrationConfirmed",
            SyncPayload::ServerShutdown { .. } => "ServerShutdown",
            SyncPayload::Error { .. } => "Error",
            SyncPayload::Unknown => "Unknown",
        }
    }
}

/// One wire message. Never reused: every send stamps a fresh
/// `message_id` and `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    /// Unique per message
    pub message_id: Uuid,

    /// When the sender created the message
    pub timestamp: DateTime<Utc>,

    /// Typed payload (serialized as the `type` + `payload` fields)
    #[serde(flatten)]
    pub payload: SyncPayload,
}

impl SyncMessage {
    /// Wrap a payload in a fresh envelope.
    pub fn new(payload: SyncPayload) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Serialize to a single JSON line (without the trailing newline;
    /// the codec appends it).
    pub fn to_line(&self) -> SyncResult<String> {
        serde_json::to_string(self).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Parse one received line.
    pub fn from_line(line: &str) -> SyncResult<Self> {
        serde_json::from_str(line).map_err(|e| SyncError::Protocol(format!("bad frame: {}", e)))
    }
}
