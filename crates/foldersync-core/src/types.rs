//! Core data types shared by the server and client

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a connected (or connecting) client.
///
/// Created by the client and carried in its `Registration` message.
/// The server stamps `remote_address` on accept and refreshes
/// `last_seen` on every inbound message from that client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientIdentity {
    /// Unique client identifier
    pub client_id: String,

    /// Human-readable name for logs and dashboards
    pub display_name: String,

    /// Folder names this client wants change notifications for
    pub subscribed_folders: BTreeSet<String>,

    /// Last time a message was seen from this client
    pub last_seen: DateTime<Utc>,

    /// Remote socket address, filled in by the server on accept
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,

    /// Protocol version the client speaks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,

    /// Free-form client metadata (OS, app version, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl ClientIdentity {
    /// Create a new identity subscribed to the given folders.
    pub fn new(
        client_id: impl Into<String>,
        display_name: impl Into<String>,
        folders: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            display_name: display_name.into(),
            subscribed_folders: folders.into_iter().collect(),
            last_seen: Utc::now(),
            remote_address: None,
            protocol_version: Some(crate::PROTOCOL_VERSION.to_string()),
            metadata: BTreeMap::new(),
        }
    }

    /// Whether this client is subscribed to `folder`.
    pub fn is_subscribed(&self, folder: &str) -> bool {
        self.subscribed_folders.contains(folder)
    }
}

/// A single file-change event, created by the originating client and
/// fanned out by the server to every other subscriber of the folder.
///
/// Immutable once created; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChangeNotification {
    /// Identifier of the changed file
    pub file_id: String,

    /// Folder the file belongs to (the fan-out key)
    pub folder_name: String,

    /// Content hash of the new file state
    pub content_hash: String,

    /// Client that made the change (excluded from fan-out)
    pub source_client_id: String,

    /// When the change was observed
    pub timestamp: DateTime<Utc>,
}

impl FileChangeNotification {
    /// Create a notification stamped with the current time.
    pub fn new(
        file_id: impl Into<String>,
        folder_name: impl Into<String>,
        content_hash: impl Into<String>,
        source_client_id: impl Into<String>,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            folder_name: folder_name.into(),
            content_hash: content_hash.into(),
            source_client_id: source_client_id.into(),
            timestamp: Utc::now(),
        }
    }
}
