//! Duplex request/response transport over the relay's realtime WebSocket
//!
//! One physical connection multiplexes every subscribe/publish/unsubscribe
//! operation. Operations are correlated with their acks through the
//! [`PendingTable`]; the connection is replaced wholesale on reconnect.

mod pending;


pub use pending::{Completion, DataHandler, OperationKind, PendingTable};

use crate::config::RelayConfig;
use crate::credentials::CredentialSource;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use live_lambda_common::{
    Authorization, PublishAck, RelayError, RelayMessage, Result, SigningRequest, TunnelError,
    constants::{CLOSE_TIMEOUT_SECS, RELAY_EVENT_PATH, RELAY_SIGNING_SERVICE, RELAY_SUBPROTOCOL},
    generate_correlation_id, header_subprotocol, sign,
};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message as WsMessage,
};
use tracing::{debug, error, info, warn};

type WebSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Lifecycle of the transport's connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Handshaking,
    Ready,
    Closing,
    Closed,
}

/// Notifications emitted towards whoever supervises the transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The connection with this id is gone
    Closed {
        connection: u64,
        code: Option<u16>,
        reason: String,
    },
    /// A relay-reported or socket error; a close may or may not follow
    Error { connection: u64, message: String },
}

/// An active subscription and the connection it was made on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub connection: u64,
}

/// Result of an unsubscribe call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    Unsubscribed,
    /// No subscription with that id is active; nothing was sent
    NotSubscribed,
}

/// Client side of the relay protocol. Cheap to clone.
#[derive(Clone)]
pub struct TunnelTransport {
    shared: Arc<Shared>,
}

struct Shared {
    config: RelayConfig,
    credentials: Arc<dyn CredentialSource>,
    events: mpsc::UnboundedSender<TransportEvent>,
    connect_lock: Mutex<()>,
    current: StdMutex<Option<Arc<Connection>>>,
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// One physical socket and the operations in flight on it
struct Connection {
    id: u64,
    outgoing: mpsc::Sender<WsMessage>,
    pending: Arc<PendingTable>,
    open: Arc<AtomicBool>,
    closed: watch::Receiver<bool>,
    read_task: AbortHandle,
    write_task: AbortHandle,
}

impl Connection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, message: &RelayMessage) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.outgoing
            .send(WsMessage::Text(json.into()))
            .await
            .map_err(|_| TunnelError::ConnectionClosed)
    }

    /// Send an operation frame and wait for its terminal ack
    async fn request(&self, id: &str, message: RelayMessage, completion: Completion) -> Result<RelayMessage> {
        if let Err(e) = self.send(&message).await {
            self.pending.remove(id);
            return Err(e);
        }
        completion.await.map_err(|_| TunnelError::ConnectionClosed)?
    }
}

impl TunnelTransport {
    /// Create a transport and the receiver of its close/error notifications
    pub fn new(
        config: RelayConfig,
        credentials: Arc<dyn CredentialSource>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (shutdown, _) = watch::channel(false);

        let transport = Self {
            shared: Arc::new(Shared {
                config,
                credentials,
                events,
                connect_lock: Mutex::new(()),
                current: StdMutex::new(None),
                state,
                generation: AtomicU64::new(0),
                shutdown,
            }),
        };
        (transport, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Id of the ready connection, if any
    pub fn connection_id(&self) -> Option<u64> {
        self.ready_connection().map(|c| c.id)
    }

    fn ready_connection(&self) -> Option<Arc<Connection>> {
        self.shared
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .filter(|c| c.is_open())
            .cloned()
    }

    /// Open the connection and complete the handshake.
    ///
    /// Idempotent: returns immediately when a connection is ready, and
    /// concurrent callers wait for the attempt already in flight.
    pub async fn connect(&self) -> Result<()> {
        if self.ready_connection().is_some() {
            return Ok(());
        }

        let _attempt = self.shared.connect_lock.lock().await;
        if self.ready_connection().is_some() {
            return Ok(());
        }

        self.shared.shutdown.send_replace(false);
        let mut shutdown = self.shared.shutdown.subscribe();

        tokio::select! {
            result = self.establish() => {
                if result.is_err() {
                    self.shared.state.send_replace(ConnectionState::Closed);
                }
                result
            }
            _ = shutdown.wait_for(|stop| *stop) => {
                info!("Connection attempt aborted");
                self.shared.state.send_replace(ConnectionState::Closed);
                Err(TunnelError::ConnectionError(
                    "Connection attempt aborted".to_string(),
                ))
            }
        }
    }

    /// Sign the handshake, open the socket and wait for `connection_ack`
    async fn establish(&self) -> Result<()> {
        let shared = &self.shared;
        let config = &shared.config;
        shared.state.send_replace(ConnectionState::Connecting);

        debug!("Connecting to {}", config.realtime_url);

        let headers = self.authorize("{}").await?;
        let protocols = format!("{}, {}", RELAY_SUBPROTOCOL, header_subprotocol(&headers)?);

        let mut request = config
            .realtime_url
            .as_str()
            .into_client_request()
            .map_err(|e| TunnelError::ConnectionError(format!("Invalid URL: {}", e)))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_str(&protocols)
                .map_err(|e| TunnelError::ConnectionError(format!("Invalid subprotocol: {}", e)))?,
        );

        let (mut ws_stream, _) = tokio::time::timeout(config.connect_timeout, connect_async(request))
            .await
            .map_err(|_| TunnelError::HandshakeTimeout)?
            .map_err(|e| TunnelError::ConnectionError(e.to_string()))?;

        shared.state.send_replace(ConnectionState::Handshaking);
        debug!("WebSocket open, sending connection_init");

        let init = serde_json::to_string(&RelayMessage::ConnectionInit)?;
        ws_stream
            .send(WsMessage::Text(init.into()))
            .await
            .map_err(|e| TunnelError::WebSocketError(format!("Failed to send connection_init: {}", e)))?;

        let keepalive = tokio::time::timeout(config.connect_timeout, wait_for_ack(&mut ws_stream))
            .await
            .map_err(|_| TunnelError::HandshakeTimeout)??
            .unwrap_or(config.default_keepalive);

        let id = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (write, read) = ws_stream.split();
        let (outgoing_tx, outgoing_rx) = mpsc::channel(100);
        let pending = Arc::new(PendingTable::new());
        let open = Arc::new(AtomicBool::new(true));
        let (closed_tx, closed_rx) = watch::channel(false);

        let write_handle = tokio::spawn(spawn_write_task(write, outgoing_rx));
        let write_task = write_handle.abort_handle();

        let read_handle = tokio::spawn(spawn_read_task(ReadContext {
            shared: self.shared.clone(),
            connection: id,
            read,
            outgoing: outgoing_tx.clone(),
            pending: pending.clone(),
            open: open.clone(),
            closed: closed_tx,
            watchdog: keepalive + config.keepalive_grace,
            write_task: write_task.clone(),
        }));

        let connection = Arc::new(Connection {
            id,
            outgoing: outgoing_tx,
            pending,
            open,
            closed: closed_rx,
            read_task: read_handle.abort_handle(),
            write_task,
        });

        *shared
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(connection);
        shared.state.send_replace(ConnectionState::Ready);

        info!(
            "Relay connection {} ready (keep-alive {:?})",
            id, keepalive
        );
        Ok(())
    }

    /// Signed headers for a request body posted to the relay's event path
    async fn authorize(&self, body: &str) -> Result<Authorization> {
        let config = &self.shared.config;
        let credentials = self.shared.credentials.credentials().await?;
        sign(
            &SigningRequest {
                method: "POST",
                host: &config.api_host,
                path: RELAY_EVENT_PATH,
                body,
                region: &config.region,
                service: RELAY_SIGNING_SERVICE,
            },
            &credentials,
            Utc::now(),
        )
    }

    async fn ready_or_connect(&self) -> Result<Arc<Connection>> {
        self.connect().await?;
        self.ready_connection().ok_or(TunnelError::ConnectionClosed)
    }

    /// Subscribe to `channel`; `on_data` runs for every data frame on the
    /// returned subscription
    pub async fn subscribe(&self, channel: &str, on_data: DataHandler) -> Result<Subscription> {
        let connection = self.ready_or_connect().await?;
        let channel = self.shared.config.qualify(channel);
        let body = json!({ "channel": channel }).to_string();
        let authorization = self.authorize(&body).await?;

        let id = generate_correlation_id();
        let completion = connection
            .pending
            .register(&id, OperationKind::Subscribe, Some(on_data));

        debug!("Subscribing to {} ({})", channel, id);
        connection
            .request(
                &id,
                RelayMessage::Subscribe {
                    id: id.clone(),
                    channel,
                    authorization,
                },
                completion,
            )
            .await?;

        Ok(Subscription {
            id,
            connection: connection.id,
        })
    }

    /// Publish pre-serialized events to `channel`
    pub async fn publish(&self, channel: &str, events: Vec<String>) -> Result<PublishAck> {
        let connection = self.ready_or_connect().await?;
        let channel = self.shared.config.qualify(channel);
        let body = json!({ "channel": channel, "events": events }).to_string();
        let authorization = self.authorize(&body).await?;

        let id = generate_correlation_id();
        let completion = connection
            .pending
            .register(&id, OperationKind::Publish, None);

        debug!("Publishing {} event(s) to {} ({})", events.len(), channel, id);
        let ack = connection
            .request(
                &id,
                RelayMessage::Publish {
                    id: id.clone(),
                    channel,
                    events,
                    authorization,
                },
                completion,
            )
            .await?;

        match ack {
            RelayMessage::PublishSuccess {
                successful, failed, ..
            } => Ok(PublishAck { successful, failed }),
            other => Err(TunnelError::InvalidMessage(format!(
                "Unexpected publish ack: {}",
                other.kind()
            ))),
        }
    }

    /// Stop a subscription; a no-op when the id is not active
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<UnsubscribeOutcome> {
        let Some(connection) = self.ready_connection() else {
            return Ok(UnsubscribeOutcome::NotSubscribed);
        };
        let Some(completion) = connection.pending.begin_unsubscribe(subscription_id) else {
            debug!("Subscription {} is not active", subscription_id);
            return Ok(UnsubscribeOutcome::NotSubscribed);
        };

        connection
            .request(
                subscription_id,
                RelayMessage::Unsubscribe {
                    id: subscription_id.to_string(),
                },
                completion,
            )
            .await?;
        Ok(UnsubscribeOutcome::Unsubscribed)
    }

    /// Close gracefully and wait for the socket to finish closing.
    ///
    /// A connection attempt still in flight is aborted instead.
    pub async fn disconnect(&self) -> Result<()> {
        self.shared.shutdown.send_replace(true);

        let connection = self
            .shared
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(connection) = connection else {
            return Ok(());
        };

        self.shared.state.send_replace(ConnectionState::Closing);
        let mut closed = connection.closed.clone();

        if connection.is_open() {
            let _ = connection.outgoing.send(WsMessage::Close(None)).await;
        }

        let wait = tokio::time::timeout(
            Duration::from_secs(CLOSE_TIMEOUT_SECS),
            closed.wait_for(|closed| *closed),
        )
        .await;

        if wait.is_err() {
            warn!(
                "Relay did not acknowledge close of connection {}, dropping socket",
                connection.id
            );
            connection.read_task.abort();
            connection.write_task.abort();
            connection.open.store(false, Ordering::SeqCst);
            connection.pending.fail_all();
        }

        self.shared.state.send_replace(ConnectionState::Closed);
        info!("Relay connection {} closed", connection.id);
        Ok(())
    }
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("No transport event listener");
        }
    }

    /// Bookkeeping once a connection's read loop ends
    fn connection_closed(&self, connection: u64, code: Option<u16>, reason: String) {
        {
            let mut current = self
                .current
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if current.as_ref().is_some_and(|c| c.id == connection) {
                *current = None;
                self.state.send_replace(ConnectionState::Closed);
            }
        }
        self.emit(TransportEvent::Closed {
            connection,
            code,
            reason,
        });
    }
}

/// Read frames until `connection_ack`; returns the advertised keep-alive
async fn wait_for_ack(ws_stream: &mut WebSocket) -> Result<Option<Duration>> {
    while let Some(message) = ws_stream.next().await {
        match message {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<RelayMessage>(&text) {
                Ok(RelayMessage::ConnectionAck {
                    connection_timeout_ms,
                }) => return Ok(connection_timeout_ms.map(Duration::from_millis)),
                Ok(RelayMessage::ConnectionError { errors }) => {
                    return Err(TunnelError::OperationRejected {
                        operation: "connection_init",
                        errors,
                    });
                }
                Ok(other) => debug!("Ignoring {} during handshake", other.kind()),
                Err(e) => warn!("Unparseable frame during handshake: {}", e),
            },
            Ok(WsMessage::Close(_)) => {
                return Err(TunnelError::ConnectionError(
                    "Relay closed connection during handshake".to_string(),
                ));
            }
            Err(e) => {
                return Err(TunnelError::WebSocketError(e.to_string()));
            }
            _ => {}
        }
    }
    Err(TunnelError::ConnectionError(
        "Connection closed before handshake".to_string(),
    ))
}

/// Write task sends outgoing messages through WebSocket
async fn spawn_write_task(
    mut write: SplitSink<WebSocket, WsMessage>,
    mut outgoing_rx: mpsc::Receiver<WsMessage>,
) {
    while let Some(message) = outgoing_rx.recv().await {
        if let Err(e) = write.send(message).await {
            error!("Failed to send message: {}", e);
            break;
        }
    }

    debug!("Write task exiting");
}

struct ReadContext {
    shared: Arc<Shared>,
    connection: u64,
    read: SplitStream<WebSocket>,
    outgoing: mpsc::Sender<WsMessage>,
    pending: Arc<PendingTable>,
    open: Arc<AtomicBool>,
    closed: watch::Sender<bool>,
    watchdog: Duration,
    write_task: AbortHandle,
}

/// Read task receives frames, resolves operations and runs the keep-alive
/// watchdog. Its exit is the single point where a connection dies.
async fn spawn_read_task(ctx: ReadContext) {
    let ReadContext {
        shared,
        connection,
        mut read,
        outgoing,
        pending,
        open,
        closed,
        watchdog,
        write_task,
    } = ctx;

    let deadline = tokio::time::sleep(watchdog);
    tokio::pin!(deadline);

    let (code, reason) = loop {
        tokio::select! {
            message = read.next() => match message {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<RelayMessage>(&text) {
                        Ok(RelayMessage::Ka) => {
                            deadline.as_mut().reset(Instant::now() + watchdog);
                        }
                        Ok(frame) => handle_frame(&shared, connection, &pending, frame),
                        Err(e) => warn!("Unparseable relay frame: {} ({})", e, text.as_str()),
                    }
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    debug!("Received WebSocket ping");
                    if outgoing.send(WsMessage::Pong(data)).await.is_err() {
                        break (None, "write side closed".to_string());
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    info!("Relay closed connection {}", connection);
                    break match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_string()),
                        None => (None, "closed by relay".to_string()),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    shared.emit(TransportEvent::Error {
                        connection,
                        message: e.to_string(),
                    });
                    break (None, e.to_string());
                }
                None => break (None, "stream ended".to_string()),
            },
            _ = &mut deadline => {
                let err = TunnelError::KeepAliveTimeout(watchdog.as_millis() as u64);
                warn!("Connection {}: {}", connection, err);
                shared.emit(TransportEvent::Error {
                    connection,
                    message: err.to_string(),
                });
                break (None, err.to_string());
            }
        }
    };

    open.store(false, Ordering::SeqCst);
    write_task.abort();
    let failed = pending.fail_all();
    if failed > 0 {
        warn!(
            "Failed {} pending operation(s) on connection {}",
            failed, connection
        );
    }
    shared.connection_closed(connection, code, reason);
    let _ = closed.send(true);

    debug!("Read task exiting");
}

/// Route one relay frame to the operation it belongs to
fn handle_frame(shared: &Shared, connection: u64, pending: &PendingTable, frame: RelayMessage) {
    match frame {
        RelayMessage::SubscribeSuccess { id } => {
            let key = id.clone();
            pending.resolve(&key, OperationKind::Subscribe, RelayMessage::SubscribeSuccess { id });
        }
        RelayMessage::PublishSuccess {
            id,
            successful,
            failed,
        } => {
            let key = id.clone();
            let ack = RelayMessage::PublishSuccess {
                id,
                successful,
                failed,
            };
            pending.resolve(&key, OperationKind::Publish, ack);
        }
        RelayMessage::UnsubscribeSuccess { id } => {
            let key = id.clone();
            pending.resolve(&key, OperationKind::Unsubscribe, RelayMessage::UnsubscribeSuccess { id });
        }

        RelayMessage::SubscribeError { id, errors } => {
            reject(shared, connection, pending, "subscribe", id, errors)
        }
        RelayMessage::PublishError { id, errors } => {
            reject(shared, connection, pending, "publish", id, errors)
        }
        RelayMessage::UnsubscribeError { id, errors } => {
            reject(shared, connection, pending, "unsubscribe", id, errors)
        }
        RelayMessage::Error { id, errors } => {
            reject(shared, connection, pending, "operation", id, errors)
        }
        RelayMessage::ConnectionError { errors } => {
            let err = TunnelError::OperationRejected {
                operation: "connection",
                errors,
            };
            error!("{}", err);
            shared.emit(TransportEvent::Error {
                connection,
                message: err.to_string(),
            });
        }

        RelayMessage::Data { id, event } => {
            let payload = match event {
                Value::String(payload) => payload,
                other => other.to_string(),
            };
            if !pending.deliver(&id, payload) {
                debug!("Data for inactive subscription {}", id);
            }
        }

        other => debug!("Ignoring unexpected {} frame", other.kind()),
    }
}

fn reject(
    shared: &Shared,
    connection: u64,
    pending: &PendingTable,
    operation: &'static str,
    id: Option<String>,
    errors: Vec<RelayError>,
) {
    let err = TunnelError::OperationRejected { operation, errors };
    warn!("{} (id: {:?})", err, id);
    shared.emit(TransportEvent::Error {
        connection,
        message: err.to_string(),
    });
    if let Some(id) = id {
        pending.reject(&id, err);
    }
}
