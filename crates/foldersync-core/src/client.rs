//! TCP synchronization client
//!
//! Connects to a sync server, announces its identity, and surfaces
//! inbound messages to the host application through a broadcast
//! channel. Outbound writes are serialized through a single writer
//! task, so concurrent `send` calls never interleave frames.
//!
//! Connection lifecycle:
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──registration sent──▶ Registered
//!      ▲                                                          │
//!      │                                   RegistrationConfirmed  │
//!      └────── disconnect / read error / server gone ◀── Active ◀─┘
//! ```
//!
//! There is no automatic reconnection. When the connection drops, a
//! [`ClientEvent::ConnectionLost`] is broadcast and the client returns
//! to `Disconnected`; reconnecting is the host application's call.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::protocol::{SyncMessage, SyncPayload};
use crate::types::{ClientIdentity, FileChangeNotification};

/// Connection state as seen by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Registered,
    Active,
}

/// Events surfaced to the host application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A message arrived from the server
    Message(SyncMessage),
    /// The connection dropped (read error, server shutdown, or close)
    ConnectionLost,
}

/// Tunables for the client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Interval for automatic heartbeats; `None` disables them
    pub heartbeat_interval: Option<Duration>,
    /// Outbound channel capacity
    pub outbound_capacity: usize,
    /// Maximum accepted line length in bytes
    pub max_line_length: usize,
    /// Event broadcast channel capacity
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Some(Duration::from_secs(60)),
            outbound_capacity: 64,
            max_line_length: 1024 * 1024,
            event_capacity: 256,
        }
    }
}

struct Connection {
    outbound: mpsc::Sender<SyncMessage>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// The synchronization client.
pub struct SyncClient {
    identity: ClientIdentity,
    config: ClientConfig,
    state: Arc<Mutex<ConnectionState>>,
    events: broadcast::Sender<ClientEvent>,
    connection: Mutex<Option<Connection>>,
}

impl SyncClient {
    /// Create a client for the given identity. Nothing connects until
    /// [`connect`](Self::connect).
    pub fn new(identity: ClientIdentity, config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            identity,
            config,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            events,
            connection: Mutex::new(None),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Subscribe to client events. Each subscriber gets every event
    /// from the point of subscription on.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// The identity this client announces.
    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// Connect to `addr`, send the registration message, and spawn the
    /// reader, writer, and heartbeat tasks. Returns once registration
    /// has been written; the state moves to `Active` when the server's
    /// `RegistrationConfirmed` arrives.
    pub async fn connect(&self, addr: &str) -> SyncResult<()> {
        if self.state() != ConnectionState::Disconnected {
            return Err(SyncError::Connection("already connected".to_string()));
        }
        *self.state.lock() = ConnectionState::Connecting;

        let stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                *self.state.lock() = ConnectionState::Disconnected;
                return Err(SyncError::Connection(format!(
                    "connect to {} failed: {}",
                    addr, e
                )));
            }
        };
        info!(%addr, client_id = %self.identity.client_id, "Connected to sync server");

        let framed = Framed::new(
            stream,
            LinesCodec::new_with_max_length(self.config.max_line_length),
        );
        let (sink, lines) = framed.split();

        let token = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::channel(self.config.outbound_capacity);

        let mut tasks = vec![
            tokio::spawn(writer_loop(sink, outbound_rx, token.clone())),
            tokio::spawn(reader_loop(
                lines,
                self.events.clone(),
                self.state.clone(),
                token.clone(),
            )),
        ];
        if let Some(interval) = self.config.heartbeat_interval {
            tasks.push(tokio::spawn(heartbeat_loop(
                outbound.clone(),
                interval,
                token.clone(),
            )));
        }

        // Move to Registered before the registration can be written;
        // the reader promotes to Active on confirmation and must never
        // be overwritten afterwards.
        *self.state.lock() = ConnectionState::Registered;
        let registration = SyncMessage::new(SyncPayload::Registration {
            client_info: self.identity.clone(),
        });
        if outbound.send(registration).await.is_err() {
            token.cancel();
            *self.state.lock() = ConnectionState::Disconnected;
            return Err(SyncError::Connection(
                "connection closed before registration".to_string(),
            ));
        }

        *self.connection.lock() = Some(Connection {
            outbound,
            token,
            tasks,
        });
        Ok(())
    }

    /// Send a message to the server. Requires the `Active` state: a
    /// connection whose registration the server has not yet confirmed
    /// cannot send.
    pub async fn send(&self, message: SyncMessage) -> SyncResult<()> {
        if self.state() != ConnectionState::Active {
            return Err(SyncError::NotConnected);
        }
        let outbound = {
            let connection = self.connection.lock();
            match connection.as_ref() {
                Some(conn) => conn.outbound.clone(),
                None => return Err(SyncError::NotConnected),
            }
        };
        outbound
            .send(message)
            .await
            .map_err(|_| SyncError::NotConnected)
    }

    /// Announce a file change to the server for fan-out.
    pub async fn announce(&self, notification: FileChangeNotification) -> SyncResult<()> {
        self.send(SyncMessage::new(SyncPayload::FileChange { notification }))
            .await
    }

    /// Send a heartbeat now, independent of the automatic interval.
    pub async fn heartbeat(&self) -> SyncResult<()> {
        self.send(SyncMessage::new(SyncPayload::Heartbeat {})).await
    }

    /// Close the connection and stop all tasks. Idempotent; calling it
    /// while disconnected is a no-op.
    pub async fn disconnect(&self) {
        let connection = self.connection.lock().take();
        let Some(connection) = connection else {
            return;
        };
        debug!(client_id = %self.identity.client_id, "Disconnecting");

        connection.token.cancel();
        drop(connection.outbound);
        for task in connection.tasks {
            let _ = task.await;
        }
        *self.state.lock() = ConnectionState::Disconnected;
    }
}

type LineSink = futures::stream::SplitSink<Framed<TcpStream, LinesCodec>, String>;
type LineStream = futures::stream::SplitStream<Framed<TcpStream, LinesCodec>>;

/// Serialize and write outbound messages, one frame at a time.
async fn writer_loop(
    mut sink: LineSink,
    mut outbound_rx: mpsc::Receiver<SyncMessage>,
    token: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => break,
            msg = outbound_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let line = match msg.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Dropping unserializable message");
                continue;
            }
        };
        if let Err(e) = sink.send(line).await {
            warn!(error = %e, "Write failed");
            token.cancel();
            break;
        }
    }
    let _ = sink.close().await;
}

/// Read inbound frames, track the registration handshake, and surface
/// everything through the event channel.
async fn reader_loop(
    mut lines: LineStream,
    events: broadcast::Sender<ClientEvent>,
    state: Arc<Mutex<ConnectionState>>,
    token: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => return,
            next = lines.next() => next,
        };

        let line = match next {
            None => {
                debug!("Server closed the connection");
                break;
            }
            Some(Err(e)) => {
                warn!(error = %e, "Read error");
                break;
            }
            Some(Ok(line)) => line,
        };

        let msg = match SyncMessage::from_line(&line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Malformed frame from server");
                break;
            }
        };

        match &msg.payload {
            SyncPayload::RegistrationConfirmed { client_id } => {
                info!(%client_id, "Registration confirmed");
                *state.lock() = ConnectionState::Active;
            }
            SyncPayload::ServerShutdown { reason } => {
                info!(%reason, "Server is shutting down");
            }
            SyncPayload::Unknown => {
                debug!("Ignoring unknown message type");
            }
            _ => {}
        }
        let _ = events.send(ClientEvent::Message(msg));
    }

    // Reaching here means the connection is gone, not a local
    // disconnect; tell the host application.
    *state.lock() = ConnectionState::Disconnected;
    token.cancel();
    let _ = events.send(ClientEvent::ConnectionLost);
}

/// Periodic heartbeats keep the server's eviction timer at bay.
async fn heartbeat_loop(
    outbound: mpsc::Sender<SyncMessage>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // the first tick fires immediately
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if outbound
                    .send(SyncMessage::new(SyncPayload::Heartbeat {}))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}
