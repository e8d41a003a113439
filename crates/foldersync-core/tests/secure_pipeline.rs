//! Secure Pipeline End-to-End Tests
//!
//! Exercises the full protection path the way two deployed peers would
//! use it: key pairs generated and persisted in the key store,
//! counterparty material pinned, then notifications carried through
//! the secure message exchange (compress, sign, seal, HMAC).

use foldersync_core::{
    CounterpartyRecord, CryptoEnvelope, FileChangeNotification, KeyStore, SecureMessageExchange,
    SecurityError, SyncError,
};
use tempfile::tempdir;

/// Build two exchanges whose key material went through a key store
/// round trip, exactly as a restart would.
fn provisioned_pair() -> (SecureMessageExchange, SecureMessageExchange) {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = tempdir().unwrap();
    let store = KeyStore::new(dir.path().join("keys.redb")).unwrap();

    let server_pair = CryptoEnvelope::generate_key_pair("server", "server pw").unwrap();
    let client_pair = CryptoEnvelope::generate_key_pair("client-1", "client pw").unwrap();
    store.save_keypair(&server_pair).unwrap();
    store.save_keypair(&client_pair).unwrap();

    let shared_secret = b"out-of-band transport secret".to_vec();
    store
        .save_counterparty(&CounterpartyRecord::new(
            "client-1",
            client_pair.public.clone(),
            shared_secret.clone(),
        ))
        .unwrap();
    store
        .save_counterparty(&CounterpartyRecord::new(
            "server",
            server_pair.public.clone(),
            shared_secret,
        ))
        .unwrap();

    // Reload everything from disk before use.
    let server_keys = store
        .load_keypair("server")
        .unwrap()
        .private
        .unlock("server pw")
        .unwrap();
    let client_keys = store
        .load_keypair("client-1")
        .unwrap()
        .private
        .unlock("client pw")
        .unwrap();

    let server = SecureMessageExchange::new("server", server_keys);
    let client = SecureMessageExchange::new("client-1", client_keys);
    for record in store.list_counterparties().unwrap() {
        if record.counterparty_id == "client-1" {
            server.add_counterparty(
                record.counterparty_id.clone(),
                record.public_keys.clone(),
                record.shared_secret.clone(),
            );
        } else {
            client.add_counterparty(
                record.counterparty_id.clone(),
                record.public_keys.clone(),
                record.shared_secret.clone(),
            );
        }
    }
    (server, client)
}

#[tokio::test]
async fn test_notification_survives_full_pipeline() {
    let (server, client) = provisioned_pair();

    let original = FileChangeNotification::new("budget.xlsx", "Reports", "8c2f91", "client-1");
    let message = client.create_message(&original, "server").unwrap();

    let received: FileChangeNotification = server.open_message(&message).unwrap();
    assert_eq!(received, original);
}

#[tokio::test]
async fn test_replay_of_delivered_message_is_rejected() {
    let (server, client) = provisioned_pair();
    let notification = FileChangeNotification::new("f1", "Reports", "h1", "client-1");
    let message = client.create_message(&notification, "server").unwrap();

    let _: FileChangeNotification = server.open_message(&message).unwrap();
    let replayed = server.open_message::<FileChangeNotification>(&message);
    assert!(matches!(
        replayed,
        Err(SyncError::Security(SecurityError::Replay(_)))
    ));
}

#[tokio::test]
async fn test_tampered_ciphertext_is_rejected() {
    let (server, client) = provisioned_pair();
    let notification = FileChangeNotification::new("f1", "Reports", "h1", "client-1");
    let mut message = client.create_message(&notification, "server").unwrap();

    // Flip one character of the base64 body; the transport HMAC no
    // longer matches, so the envelope is never even opened.
    let mut chars: Vec<char> = message.encrypted_payload.chars().collect();
    chars[10] = if chars[10] == 'A' { 'B' } else { 'A' };
    message.encrypted_payload = chars.into_iter().collect();

    let result = server.open_message::<FileChangeNotification>(&message);
    assert!(matches!(
        result,
        Err(SyncError::Security(SecurityError::InvalidSignature(_)))
    ));
}

#[tokio::test]
async fn test_message_from_unpinned_sender_is_rejected() {
    let (server, _client) = provisioned_pair();

    let stranger_keys = CryptoEnvelope::generate_key_pair("stranger", "pw")
        .unwrap()
        .private
        .unlock("pw")
        .unwrap();
    let stranger = SecureMessageExchange::new("stranger", stranger_keys);
    // The stranger knows the server's public keys and the shared
    // secret, but the server has never pinned the stranger.
    stranger.add_counterparty(
        "server",
        CryptoEnvelope::generate_key_pair("server-fake", "pw")
            .unwrap()
            .public,
        b"out-of-band transport secret".to_vec(),
    );

    let notification = FileChangeNotification::new("f1", "Reports", "h1", "stranger");
    let message = stranger.create_message(&notification, "server").unwrap();

    let result = server.open_message::<FileChangeNotification>(&message);
    assert!(matches!(
        result,
        Err(SyncError::Security(SecurityError::UnknownClient(_)))
    ));
}
