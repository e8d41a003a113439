//! TCP synchronization server
//!
//! Accepts connections, performs the line-delimited JSON registration
//! handshake, and fans out file-change notifications to subscribed
//! clients.
//!
//! ## Per-connection state machine
//!
//! ```text
//! AwaitingRegistration ──registration ok──▶ Registered/Active ──▶ Closed
//!         │                                        │
//!         └── timeout / bad frame ─────────────────┴── read error, eviction,
//!                         │                            or server shutdown
//!                         ▼
//!                       Closed (never entered the registry)
//! ```
//!
//! Each accepted connection runs one reader task and one writer task.
//! The writer owns the sink half and drains that connection's outbound
//! channel, so writes are never interleaved. A shared cancellation
//! token (one child per connection) makes shutdown cooperative:
//! in-flight reads are cancelled at a frame boundary, never mid-line.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::protocol::{SyncMessage, SyncPayload};
use crate::registry::ConnectionRegistry;
use crate::types::FileChangeNotification;

type LineSink = SplitSink<Framed<TcpStream, LinesCodec>, String>;
type LineStream = SplitStream<Framed<TcpStream, LinesCodec>>;

/// Tunables for the server. The defaults match the protocol's
/// recommended values.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long a new connection may take to send its registration line
    pub registration_timeout: Duration,
    /// Clients silent for longer than this are evicted
    pub stale_timeout: Duration,
    /// How often the eviction pass runs
    pub eviction_interval: Duration,
    /// Outbound channel capacity per connection
    pub outbound_capacity: usize,
    /// Maximum accepted line length in bytes
    pub max_line_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            registration_timeout: Duration::from_secs(30),
            stale_timeout: Duration::from_secs(5 * 60),
            eviction_interval: Duration::from_secs(60),
            outbound_capacity: 64,
            max_line_length: 1024 * 1024,
        }
    }
}

/// The synchronization server.
///
/// `start` binds the listener and spawns the accept and eviction
/// tasks; `stop` broadcasts `ServerShutdown` best-effort, drains the
/// registry, and cancels all connection tasks cooperatively.
pub struct SyncServer {
    registry: Arc<ConnectionRegistry>,
    config: ServerConfig,
    shutdown: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncServer {
    /// Create a server with the given configuration. Nothing is bound
    /// until [`start`](Self::start).
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            config,
            shutdown: CancellationToken::new(),
            local_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The connection registry, for host-application introspection.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The bound listen address, once started. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Bind `0.0.0.0:port` and start accepting connections. Returns
    /// the bound address (relevant when `port` is 0).
    pub async fn start(&self, port: u16) -> SyncResult<SocketAddr> {
        if self.local_addr().is_some() {
            return Err(SyncError::Connection("server already started".to_string()));
        }

        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        info!(%addr, "Sync server listening");

        let accept = tokio::spawn(accept_loop(
            listener,
            self.registry.clone(),
            self.config.clone(),
            self.shutdown.clone(),
        ));
        let eviction = tokio::spawn(eviction_loop(
            self.registry.clone(),
            self.config.clone(),
            self.shutdown.clone(),
        ));

        let mut tasks = self.tasks.lock();
        tasks.push(accept);
        tasks.push(eviction);
        Ok(addr)
    }

    /// Fan a notification out to every subscriber of its folder except
    /// the originating client.
    pub fn notify(&self, notification: &FileChangeNotification) {
        fan_out(&self.registry, notification);
    }

    /// Broadcast `ServerShutdown` to all registered clients
    /// (best-effort), unregister everyone, and stop listening.
    pub async fn stop(&self) {
        info!("Stopping sync server");

        for (client_id, outbound) in self.registry.all_clients() {
            let msg = SyncMessage::new(SyncPayload::ServerShutdown {
                reason: "server stopping".to_string(),
            });
            if outbound.try_send(msg).is_err() {
                warn!(client_id = %client_id, "Could not deliver shutdown notice");
            }
        }

        // Give writer tasks a moment to flush the shutdown notices.
        tokio::time::sleep(Duration::from_millis(100)).await;

        for (client_id, _) in self.registry.all_clients() {
            self.registry.unregister(&client_id);
        }

        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        *self.local_addr.lock() = None;
    }
}

/// Accept connections until shutdown, one handler task per connection.
async fn accept_loop(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    config: ServerConfig,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Accept loop cancelled");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Accepted connection");
                    tokio::spawn(handle_connection(
                        stream,
                        peer,
                        registry.clone(),
                        config.clone(),
                        shutdown.child_token(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                }
            },
        }
    }
}

/// Periodic eviction of clients whose heartbeats stopped.
async fn eviction_loop(
    registry: Arc<ConnectionRegistry>,
    config: ServerConfig,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.eviction_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = registry.evict_stale(config.stale_timeout);
                if !evicted.is_empty() {
                    info!(count = evicted.len(), clients = ?evicted, "Evicted stale clients");
                }
            }
        }
    }
}

/// One connection's lifecycle: registration handshake, then the active
/// read loop until close, error, or cancellation.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    config: ServerConfig,
    conn_token: CancellationToken,
) {
    let framed = Framed::new(
        stream,
        LinesCodec::new_with_max_length(config.max_line_length),
    );
    let (sink, mut lines) = framed.split();

    // AwaitingRegistration: exactly one line within the timeout, or the
    // connection is dropped without ever entering the registry.
    let first = tokio::select! {
        _ = conn_token.cancelled() => return,
        line = timeout(config.registration_timeout, lines.next()) => line,
    };

    let mut identity = match first {
        Err(_) => {
            warn!(%peer, "Registration timed out");
            return;
        }
        Ok(None) => {
            debug!(%peer, "Connection closed before registration");
            return;
        }
        Ok(Some(Err(e))) => {
            warn!(%peer, error = %e, "Read error during registration");
            return;
        }
        Ok(Some(Ok(line))) => match SyncMessage::from_line(&line) {
            Ok(SyncMessage {
                payload: SyncPayload::Registration { client_info },
                ..
            }) => client_info,
            Ok(msg) => {
                warn!(%peer, kind = msg.payload.kind(), "First frame was not a registration");
                return;
            }
            Err(e) => {
                warn!(%peer, error = %e, "Malformed registration frame");
                return;
            }
        },
    };

    identity.remote_address = Some(peer.to_string());
    identity.last_seen = chrono::Utc::now();
    let client_id = identity.client_id.clone();

    let (outbound, outbound_rx) = mpsc::channel(config.outbound_capacity);
    // Weak handle for cleanup: lets the registry entry drop (and so the
    // channel close) on eviction or replacement, while still letting
    // this connection prove the entry was its own.
    let outbound_weak = outbound.downgrade();
    registry.register(identity, outbound.clone());

    let writer = tokio::spawn(writer_loop(
        sink,
        outbound_rx,
        client_id.clone(),
        conn_token.clone(),
    ));

    // Registered: confirm, then enter the active loop.
    let confirmation = SyncMessage::new(SyncPayload::RegistrationConfirmed {
        client_id: client_id.clone(),
    });
    if outbound.send(confirmation).await.is_err() {
        warn!(client_id = %client_id, "Writer gone before confirmation");
        registry.unregister_connection(&client_id, &outbound);
        return;
    }
    drop(outbound);

    active_loop(&mut lines, &client_id, &registry, &conn_token).await;

    // Only remove the entry if it is still this connection's. The
    // client may have re-registered over a fresh connection, in which
    // case the map already holds the replacement and this channel has
    // no live senders left to upgrade.
    if let Some(current) = outbound_weak.upgrade() {
        registry.unregister_connection(&client_id, &current);
    }
    conn_token.cancel();
    let _ = writer.await;
    debug!(client_id = %client_id, "Connection closed");
}

/// Read frames from one registered client and dispatch by type.
async fn active_loop(
    lines: &mut LineStream,
    client_id: &str,
    registry: &Arc<ConnectionRegistry>,
    conn_token: &CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = conn_token.cancelled() => return,
            next = lines.next() => next,
        };

        let line = match next {
            None => {
                debug!(client_id, "Peer closed the connection");
                return;
            }
            Some(Err(e)) => {
                warn!(client_id, error = %e, "Read error");
                return;
            }
            Some(Ok(line)) => line,
        };

        let msg = match SyncMessage::from_line(&line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(client_id, error = %e, "Malformed frame, closing connection");
                return;
            }
        };

        match msg.payload {
            SyncPayload::FileChange { notification } => {
                debug!(
                    client_id,
                    folder = %notification.folder_name,
                    file_id = %notification.file_id,
                    "File change received"
                );
                registry.touch(client_id);
                fan_out(registry, &notification);
            }
            SyncPayload::Heartbeat {} => {
                registry.touch(client_id);
            }
            SyncPayload::Acknowledgment { message_id } => {
                debug!(client_id, %message_id, "Acknowledgment");
                registry.touch(client_id);
            }
            SyncPayload::Registration { client_info } => {
                // Mid-stream re-registration updates the subscription set.
                debug!(client_id, "Re-registration");
                if let Some(current) = registry.identity(client_id) {
                    let mut updated = client_info;
                    updated.remote_address = current.remote_address;
                    if let Some((_, outbound)) = registry
                        .all_clients()
                        .into_iter()
                        .find(|(id, _)| id == client_id)
                    {
                        registry.register(updated, outbound);
                    }
                }
            }
            other => {
                // Forward compatibility: unknown or unexpected types are
                // logged and ignored, never fatal.
                debug!(client_id, kind = other.kind(), "Ignoring message");
            }
        }
    }
}

/// Drain one connection's outbound channel into its socket. Exits when
/// the channel closes (unregistration/eviction) or a write fails.
async fn writer_loop(
    mut sink: LineSink,
    mut outbound_rx: mpsc::Receiver<SyncMessage>,
    client_id: String,
    conn_token: CancellationToken,
) {
    while let Some(msg) = outbound_rx.recv().await {
        let line = match msg.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "Dropping unserializable message");
                continue;
            }
        };
        if let Err(e) = sink.send(line).await {
            warn!(client_id = %client_id, error = %e, "Write failed");
            break;
        }
    }
    let _ = sink.close().await;
    // Ends the reader too: a closed outbound channel means this
    // connection is done (evicted, unregistered, or socket dead).
    conn_token.cancel();
}

/// Deliver a notification to every subscriber of its folder except the
/// origin. A failed delivery unregisters that subscriber and never
/// affects the rest.
fn fan_out(registry: &Arc<ConnectionRegistry>, notification: &FileChangeNotification) {
    let subscribers =
        registry.subscribers_of(&notification.folder_name, &notification.source_client_id);

    for (subscriber_id, outbound) in subscribers {
        let msg = SyncMessage::new(SyncPayload::FileChange {
            notification: notification.clone(),
        });
        if let Err(e) = outbound.try_send(msg) {
            warn!(
                subscriber = %subscriber_id,
                error = %e,
                "Delivery failed, unregistering subscriber"
            );
            registry.unregister_connection(&subscriber_id, &outbound);
        }
    }
}
