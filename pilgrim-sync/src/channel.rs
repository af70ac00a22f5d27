//! Reconnecting realtime channel client.
//!
//! One driver task owns the WebSocket and walks the connection state machine:
//!
//! ```text
//!            ┌──────────── online signal (backoff reset) ───────────┐
//!            ▼                                                      │
//!   ┌────────────┐  open ok   ┌───────────┐  close/error  ┌──────────────┐
//!   │ Connecting │ ─────────► │ Connected │ ────────────► │ Disconnected │
//!   └────────────┘            └───────────┘               └──────────────┘
//!         ▲   open failed                                        │
//!         └──────────────────── sleep(backoff) ◄─────────────────┘
//! ```
//!
//! While offline the driver parks in `Disconnected` and makes no attempts.
//! On every successful open the stored join context is replayed before the
//! status flips to `Connected`, so listeners reacting to `Connected` always
//! talk to a joined socket.
//!
//! Handles talk to the driver through a bounded mpsc of encoded frames.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::backoff::{Backoff, BackoffConfig};
use crate::connectivity::Connectivity;
use crate::listeners::{ListenerSet, Subscription};
use crate::protocol::{
    Beacon, ClientMessage, GroupId, Location, ProtocolError, ServerMessage, ServerMessageKind,
    UserId,
};
use crate::queue::{Mutation, MutationQueue};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Observable state of the logical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Outcome of a typed send helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the live socket.
    Sent,
    /// Appended to the mutation queue for a later drain.
    Queued,
}

/// Last `join_group` issued through this client; replayed on every reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinContext {
    pub user_id: UserId,
    pub group_id: GroupId,
}

/// Channel client configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket URL, e.g. `ws://host:port/ws`
    pub url: String,
    /// Full cookie pair sent on the handshake, e.g. `pilgrim.sid=abc`
    pub session_cookie: Option<String>,
    pub backoff: BackoffConfig,
    /// Frames buffered between handles and the driver (default: 256)
    pub outgoing_capacity: usize,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            session_cookie: None,
            backoff: BackoffConfig::default(),
            outgoing_capacity: 256,
        }
    }

    pub fn with_session_cookie(mut self, name: &str, value: &str) -> Self {
        self.session_cookie = Some(format!("{name}={value}"));
        self
    }
}

/// Channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid channel configuration: {0}")]
    Config(String),
    #[error("handshake rejected with HTTP {0}")]
    Rejected(u16),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<tokio_tungstenite::tungstenite::Error> for ChannelError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        match e {
            tokio_tungstenite::tungstenite::Error::Http(resp) => {
                ChannelError::Rejected(resp.status().as_u16())
            }
            other => ChannelError::Connect(other.to_string()),
        }
    }
}

struct Shared {
    status: watch::Sender<ConnectionStatus>,
    status_listeners: ListenerSet<ConnectionStatus>,
    // Serializes status transitions with listener registration.
    status_gate: Mutex<()>,
    message_listeners: Mutex<HashMap<ServerMessageKind, ListenerSet<ServerMessage>>>,
    join: Mutex<Option<JoinContext>>,
    outgoing: Mutex<Option<mpsc::Sender<String>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn set_status(&self, status: ConnectionStatus) {
        let _gate = lock(&self.status_gate);
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            log::debug!("Channel status: {status:?}");
            self.status_listeners.notify(&status);
        }
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    fn set_outgoing(&self, tx: Option<mpsc::Sender<String>>) {
        *lock(&self.outgoing) = tx;
    }

    fn transmit(&self, frame: String) -> bool {
        match lock(&self.outgoing).as_ref() {
            Some(tx) => tx.try_send(frame).is_ok(),
            None => false,
        }
    }

    fn outgoing(&self) -> Option<mpsc::Sender<String>> {
        lock(&self.outgoing).clone()
    }

    fn dispatch(&self, text: &str) {
        let message = match ServerMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("Dropping inbound frame: {e}");
                return;
            }
        };
        let listeners = lock(&self.message_listeners).get(&message.kind()).cloned();
        if let Some(listeners) = listeners {
            listeners.notify(&message);
        }
    }
}

pub struct ChannelClient {
    shared: Arc<Shared>,
    queue: Arc<MutationQueue>,
    connectivity: Connectivity,
    driver: JoinHandle<()>,
}

impl ChannelClient {
    /// Spawn the driver and start connecting. Must be called inside a tokio runtime.
    pub fn start(
        config: ChannelConfig,
        queue: Arc<MutationQueue>,
        connectivity: Connectivity,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let shared = Arc::new(Shared {
            status,
            status_listeners: ListenerSet::new(),
            status_gate: Mutex::new(()),
            message_listeners: Mutex::new(HashMap::new()),
            join: Mutex::new(None),
            outgoing: Mutex::new(None),
        });

        let driver = tokio::spawn(drive(shared.clone(), config, connectivity.clone()));

        Self { shared, queue, connectivity, driver }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status()
    }

    /// Connected and believed online.
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected && self.connectivity.is_online()
    }

    /// Resolve once the channel reaches `status`.
    pub async fn wait_for(&self, status: ConnectionStatus) {
        let mut rx = self.shared.status.subscribe();
        let _ = rx.wait_for(|current| *current == status).await;
    }

    /// Transmit now if connected. Never queues.
    pub fn send(&self, message: &ClientMessage) -> bool {
        if !self.is_connected() {
            return false;
        }
        match message.encode() {
            Ok(frame) => self.shared.transmit(frame),
            Err(e) => {
                log::warn!("Failed to encode outbound message: {e}");
                false
            }
        }
    }

    /// Transmit if connected, waiting for room in the outgoing buffer.
    ///
    /// Returns `false` when disconnected or when the session ends before the
    /// frame was buffered.
    pub async fn send_when_ready(&self, message: &ClientMessage) -> bool {
        if !self.is_connected() {
            return false;
        }
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Failed to encode outbound message: {e}");
                return false;
            }
        };
        match self.shared.outgoing() {
            Some(tx) => tx.send(frame).await.is_ok(),
            None => false,
        }
    }

    /// Remember the group to (re)join and join it now if a session is open.
    ///
    /// A session that is still handshaking already has its outgoing buffer,
    /// so the join is never lost between the replay and `Connected`.
    pub fn join_group(&self, user_id: UserId, group_id: GroupId) -> bool {
        *lock(&self.shared.join) = Some(JoinContext { user_id, group_id });
        match (ClientMessage::JoinGroup { user_id: Some(user_id), group_id }).encode() {
            Ok(frame) => self.shared.transmit(frame),
            Err(e) => {
                log::warn!("Failed to encode join: {e}");
                false
            }
        }
    }

    pub fn join_context(&self) -> Option<JoinContext> {
        *lock(&self.shared.join)
    }

    pub fn send_location(&self, location: Location) -> Delivery {
        self.send_or_queue(Mutation::LocationUpdate(location))
    }

    pub fn send_beacon(&self, signal: Beacon) -> Delivery {
        self.send_or_queue(Mutation::BeaconSignal(signal))
    }

    pub fn send_sitrep(&self, text: impl Into<String>) -> Delivery {
        self.send_or_queue(Mutation::Sitrep(text.into()))
    }

    /// Status updates are ephemeral and never queued.
    pub fn send_status(&self, status: impl Into<String>) -> bool {
        self.send(&ClientMessage::StatusUpdate { status: status.into() })
    }

    // A pending backlog means a fresh action must wait its turn behind it.
    fn send_or_queue(&self, mutation: Mutation) -> Delivery {
        if self.queue.is_empty() {
            if let Some(message) = mutation.to_client_message() {
                if self.send(&message) {
                    return Delivery::Sent;
                }
            }
        }
        self.queue.push(mutation);
        Delivery::Queued
    }

    /// Listen for one kind of server message.
    pub fn on(
        &self,
        kind: ServerMessageKind,
        listener: impl Fn(&ServerMessage) + Send + Sync + 'static,
    ) -> Subscription {
        lock(&self.shared.message_listeners)
            .entry(kind)
            .or_default()
            .clone()
            .add(listener)
    }

    /// Listen for status changes; the listener is called with the current status immediately.
    pub fn on_status_change(
        &self,
        listener: impl Fn(&ConnectionStatus) + Send + Sync + 'static,
    ) -> Subscription {
        let _gate = lock(&self.shared.status_gate);
        let listener = Arc::new(listener);
        let registered = listener.clone();
        let subscription = self.shared.status_listeners.add(move |status| registered(status));
        listener(&self.status());
        subscription
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Stop the driver and drop the socket.
    pub fn shutdown(&self) {
        self.driver.abort();
        self.shared.set_outgoing(None);
        self.shared.set_status(ConnectionStatus::Disconnected);
    }
}

impl Drop for ChannelClient {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Closed,
    WentOffline,
}

async fn drive(shared: Arc<Shared>, config: ChannelConfig, connectivity: Connectivity) {
    let mut backoff = Backoff::new(config.backoff);
    let mut online = connectivity.watch();

    loop {
        if !*online.borrow_and_update() {
            shared.set_status(ConnectionStatus::Disconnected);
            if online.wait_for(|up| *up).await.is_err() {
                return;
            }
            backoff.reset();
        }

        shared.set_status(ConnectionStatus::Connecting);
        let end = match connect(&config).await {
            Ok(socket) => {
                log::info!("Channel connected to {}", config.url);
                backoff.reset();
                run_session(&shared, socket, &mut online, config.outgoing_capacity).await
            }
            Err(e) => {
                log::warn!("Channel connect to {} failed: {e}", config.url);
                SessionEnd::Closed
            }
        };

        shared.set_outgoing(None);
        shared.set_status(ConnectionStatus::Disconnected);
        if end == SessionEnd::WentOffline {
            continue;
        }

        let delay = backoff.next_delay(&mut rand::thread_rng());
        log::info!("Reconnecting in {} ms", delay.as_millis());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = online.changed() => {
                if changed.is_err() {
                    return;
                }
                if *online.borrow() {
                    backoff.reset();
                }
            }
        }
    }
}

async fn connect(config: &ChannelConfig) -> Result<Socket, ChannelError> {
    let mut request = config.url.as_str().into_client_request()?;
    if let Some(cookie) = &config.session_cookie {
        let value =
            HeaderValue::from_str(cookie).map_err(|e| ChannelError::Config(e.to_string()))?;
        request.headers_mut().insert(COOKIE, value);
    }
    let (socket, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(socket)
}

async fn run_session(
    shared: &Shared,
    socket: Socket,
    online: &mut watch::Receiver<bool>,
    capacity: usize,
) -> SessionEnd {
    let (mut sink, mut stream) = socket.split();

    // Install the buffer first: a join_group racing this replay lands in it.
    let (tx, mut rx) = mpsc::channel::<String>(capacity.max(1));
    shared.set_outgoing(Some(tx));

    let join = *lock(&shared.join);
    if let Some(join) = join {
        let rejoin = ClientMessage::JoinGroup { user_id: Some(join.user_id), group_id: join.group_id };
        match rejoin.encode() {
            Ok(frame) => {
                if let Err(e) = sink.send(Message::text(frame)).await {
                    log::warn!("Rejoin of group {} failed: {e}", join.group_id);
                    return SessionEnd::Closed;
                }
                log::debug!("Rejoined group {}", join.group_id);
            }
            Err(e) => log::warn!("Failed to encode rejoin: {e}"),
        }
    }

    shared.set_status(ConnectionStatus::Connected);

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => shared.dispatch(text.as_str()),
                Some(Ok(Message::Close(frame))) => {
                    log::info!("Channel closed by server: {frame:?}");
                    return SessionEnd::Closed;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("Channel transport error: {e}");
                    return SessionEnd::Closed;
                }
                None => return SessionEnd::Closed,
            },
            outgoing = rx.recv() => match outgoing {
                Some(frame) => {
                    if let Err(e) = sink.send(Message::text(frame)).await {
                        log::warn!("Channel write failed: {e}");
                        return SessionEnd::Closed;
                    }
                }
                None => return SessionEnd::Closed,
            },
            changed = online.changed() => {
                if changed.is_err() || !*online.borrow_and_update() {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::WentOffline;
                }
            }
        }
    }
}
