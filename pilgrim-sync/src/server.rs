//! WebSocket group hub.
//!
//! Architecture:
//! ```text
//!   upgrade GET /ws ──► SessionResolver ──(none)──► 401, socket closed
//!          │ user id
//!          ▼
//!   connection task ── join_group ──► GroupStore check ──(fail)──► close frame
//!          │                               │ ok
//!          │                               ▼
//!          │                      GroupRegistry (fan-out) ◄── member_update, replay
//!          ▼
//!   location_update ─► GeofenceService ─► broadcast to others (+ ARRIVED/DEPARTED sitrep)
//!   beacon_signal   ─► status + audit sitrep ─► broadcast to all
//!   sitrep          ─► SitrepStore ─► broadcast to all
//!   status_update   ─► broadcast to all
//! ```
//!
//! Every connection is handled by one task that processes its inbound frames
//! in order and forwards group envelopes from its broadcast receiver.
//! Delivery is best-effort and at-most-once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::geofence::{GeofenceConfig, GeofenceService};
use crate::hub::{ConnectionId, Envelope, GroupRegistry};
use crate::protocol::{
    Beacon, ClientMessage, GroupId, Location, Presence, ProtocolError, ServerMessage, SitrepKind,
    UserId,
};
use crate::store::{Collaborators, MemberStatusPatch};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Only upgrades on this path are accepted
    pub ws_path: String,
    /// Broadcast buffer per connection
    pub broadcast_capacity: usize,
    pub geofence: GeofenceConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            ws_path: "/ws".to_string(),
            broadcast_capacity: 256,
            geofence: GeofenceConfig::default(),
        }
    }
}

/// Hub errors.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub messages_received: u64,
    pub active_groups: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
    messages_received: AtomicU64,
}

struct HubState {
    config: HubConfig,
    registry: GroupRegistry,
    geofence: GeofenceService,
    stores: Collaborators,
    stats: AtomicServerStats,
}

/// The group hub. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct HubServer {
    state: Arc<HubState>,
}

/// Per-connection state.
struct Session {
    conn: ConnectionId,
    user_id: UserId,
    group: Option<GroupId>,
    rx: Option<broadcast::Receiver<Arc<Envelope>>>,
}

enum Flow {
    Continue,
    Close(CloseFrame),
}

impl HubServer {
    pub fn new(config: HubConfig, stores: Collaborators) -> Self {
        let geofence = GeofenceService::new(
            config.geofence.clone(),
            stores.waypoints.clone(),
            stores.member_status.clone(),
            stores.movement.clone(),
        );
        Self {
            state: Arc::new(HubState {
                registry: GroupRegistry::new(config.broadcast_capacity),
                geofence,
                stores,
                stats: AtomicServerStats::default(),
                config,
            }),
        }
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), HubError> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), HubError> {
        log::info!(
            "Group hub listening on {} (path {})",
            listener.local_addr()?,
            self.state.config.ws_path
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.clone();
            tokio::spawn(async move {
                if let Err(e) = hub.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), HubError> {
        let stats = &self.state.stats;
        let ws_path = self.state.config.ws_path.as_str();
        let sessions = self.state.stores.sessions.clone();
        let mut resolved: Option<UserId> = None;

        let handshake = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                if request.uri().path() != ws_path {
                    return Err(reject(StatusCode::NOT_FOUND, "Not Found"));
                }
                match sessions.resolve(request) {
                    Some(user_id) => {
                        resolved = Some(user_id);
                        Ok(response)
                    }
                    None => Err(reject(StatusCode::UNAUTHORIZED, "Unauthorized")),
                }
            },
        )
        .await;

        let ws = match handshake {
            Ok(ws) => ws,
            Err(e) if resolved.is_none() => {
                stats.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
                log::info!("Rejected upgrade from {addr}: {}", handshake_error(e));
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let Some(user_id) = resolved else {
            return Ok(());
        };

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("User {user_id} connected from {addr}");

        let (mut sink, mut stream) = ws.split();
        let mut session = Session { conn: Uuid::new_v4(), user_id, group: None, rx: None };

        let result = self.session_loop(&mut session, &mut sink, &mut stream).await;

        if let Some(group_id) = session.group.take() {
            self.leave_group(&session, group_id).await;
        }
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("User {user_id} disconnected from {addr}");
        result
    }

    async fn session_loop(
        &self,
        session: &mut Session,
        sink: &mut WsSink,
        stream: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    ) -> Result<(), HubError> {
        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.state.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                        if let Flow::Close(frame) = self.handle_text(session, text.as_str(), sink).await? {
                            sink.send(Message::Close(Some(frame))).await?;
                            return Ok(());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("WebSocket error for user {}: {e}", session.user_id);
                        return Ok(());
                    }
                },

                envelope = next_envelope(&mut session.rx) => match envelope {
                    Ok(envelope) => {
                        if envelope.is_for(session.conn) {
                            sink.send(Message::text(envelope.text.to_string())).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("User {} lagged by {n} messages", session.user_id);
                    }
                    Err(broadcast::error::RecvError::Closed) => session.rx = None,
                },
            }
        }
    }

    async fn handle_text(
        &self,
        session: &mut Session,
        text: &str,
        sink: &mut WsSink,
    ) -> Result<Flow, HubError> {
        let message = match ClientMessage::decode(text) {
            Ok(message) => message,
            Err(ProtocolError::Malformed(e)) => {
                log::debug!("Dropping malformed frame from user {}: {e}", session.user_id);
                return Ok(Flow::Continue);
            }
            Err(e) => {
                log::warn!("Dropping invalid message from user {}: {e}", session.user_id);
                return Ok(Flow::Continue);
            }
        };

        if let ClientMessage::JoinGroup { group_id, .. } = message {
            return self.join_group(session, group_id, sink).await;
        }

        let Some(group_id) = session.group else {
            log::debug!("Ignoring message from user {} before join", session.user_id);
            return Ok(Flow::Continue);
        };
        let user_id = session.user_id;

        match message {
            ClientMessage::JoinGroup { .. } => {}
            ClientMessage::LocationUpdate { location } => {
                self.location_update(session.conn, user_id, group_id, location).await?;
            }
            ClientMessage::BeaconSignal { signal } => {
                self.beacon(user_id, group_id, signal).await?;
            }
            ClientMessage::Sitrep { text } => {
                match self
                    .state
                    .stores
                    .sitreps
                    .create(group_id, user_id, text.trim(), SitrepKind::Info)
                    .await
                {
                    Ok(sitrep) => {
                        self.broadcast(group_id, &ServerMessage::Sitrep { sitrep }, None).await?;
                    }
                    Err(e) => log::warn!("Failed to store sitrep from user {user_id}: {e}"),
                }
            }
            ClientMessage::StatusUpdate { status } => {
                self.broadcast(group_id, &ServerMessage::StatusUpdate { user_id, status }, None)
                    .await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn join_group(
        &self,
        session: &mut Session,
        group_id: GroupId,
        sink: &mut WsSink,
    ) -> Result<Flow, HubError> {
        let user_id = session.user_id;
        match self.state.stores.groups.get_user_group(user_id).await {
            Ok(Some(member_of)) if member_of == group_id => {}
            Ok(_) => {
                log::warn!("User {user_id} tried to join group {group_id} without membership");
                return Ok(Flow::Close(CloseFrame {
                    code: CloseCode::Policy,
                    reason: "not a member of this group".into(),
                }));
            }
            Err(e) => {
                log::error!("Membership check for user {user_id} failed: {e}");
                return Ok(Flow::Close(CloseFrame {
                    code: CloseCode::Error,
                    reason: "membership check failed".into(),
                }));
            }
        }

        if session.group != Some(group_id) {
            if let Some(previous) = session.group.take() {
                self.leave_group(session, previous).await;
            }
            session.rx = Some(self.state.registry.join(group_id, session.conn, user_id).await);
            session.group = Some(group_id);
            log::info!("User {user_id} joined group {group_id}");

            self.broadcast(
                group_id,
                &ServerMessage::MemberUpdate { user_id, status: Presence::Online },
                Some(session.conn),
            )
            .await?;
        }

        // Bring the joiner up to date with who is here and where they were last seen.
        for other in self.state.registry.online_users(group_id).await {
            if other != user_id {
                let update = ServerMessage::MemberUpdate { user_id: other, status: Presence::Online };
                sink.send(Message::text(update.encode()?)).await?;
            }
        }
        for (other, location) in self.state.geofence.last_known(group_id).await {
            if other != user_id {
                let update = ServerMessage::LocationUpdate { user_id: other, location };
                sink.send(Message::text(update.encode()?)).await?;
            }
        }

        let groups = self.state.registry.group_count().await;
        log::debug!("{groups} active group(s)");
        Ok(Flow::Continue)
    }

    async fn leave_group(&self, session: &Session, group_id: GroupId) {
        let Some(departure) = self.state.registry.leave(group_id, session.conn).await else {
            return;
        };
        log::info!("User {} left group {group_id}", departure.user_id);
        if departure.user_still_present {
            return;
        }
        self.state.geofence.forget(group_id, departure.user_id).await;
        if departure.group_removed {
            return;
        }
        let offline = ServerMessage::MemberUpdate {
            user_id: departure.user_id,
            status: Presence::Offline,
        };
        if let Err(e) = self.broadcast(group_id, &offline, None).await {
            log::warn!("Failed to announce departure of user {}: {e}", departure.user_id);
        }
    }

    async fn location_update(
        &self,
        conn: ConnectionId,
        user_id: UserId,
        group_id: GroupId,
        location: Location,
    ) -> Result<(), HubError> {
        let transition = self.state.geofence.process_location(user_id, group_id, location).await;

        self.broadcast(group_id, &ServerMessage::LocationUpdate { user_id, location }, Some(conn))
            .await?;

        if let Some(transition) = transition {
            match self
                .state
                .stores
                .sitreps
                .create(group_id, user_id, &transition.sitrep_text(), transition.sitrep_kind())
                .await
            {
                Ok(sitrep) => {
                    self.broadcast(group_id, &ServerMessage::Sitrep { sitrep }, None).await?;
                }
                Err(e) => log::warn!("Failed to store geofence sitrep for user {user_id}: {e}"),
            }
        }
        Ok(())
    }

    async fn beacon(&self, user_id: UserId, group_id: GroupId, signal: Beacon) -> Result<(), HubError> {
        let stores = &self.state.stores;
        if let Err(e) = stores
            .member_status
            .update_status(user_id, group_id, MemberStatusPatch::status(signal.member_status()))
            .await
        {
            log::warn!("Failed to store beacon status for user {user_id}: {e}");
        }

        let audit = stores
            .sitreps
            .create(group_id, user_id, &format!("Beacon Signal: {signal}"), SitrepKind::Warning)
            .await;

        log::info!("User {user_id} signalled {signal} in group {group_id}");
        self.broadcast(group_id, &ServerMessage::BeaconSignal { user_id, signal }, None).await?;

        match audit {
            Ok(sitrep) => {
                self.broadcast(group_id, &ServerMessage::Sitrep { sitrep }, None).await?;
            }
            Err(e) => log::warn!("Failed to store beacon sitrep for user {user_id}: {e}"),
        }
        Ok(())
    }

    async fn broadcast(
        &self,
        group_id: GroupId,
        message: &ServerMessage,
        exclude: Option<ConnectionId>,
    ) -> Result<usize, HubError> {
        let reached = self.state.registry.broadcast(group_id, message, exclude).await?;
        log::trace!("{:?} to group {group_id} reached {reached} receiver(s)", message.kind());
        Ok(reached)
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let stats = &self.state.stats;
        ServerStats {
            total_connections: stats.total_connections.load(Ordering::Relaxed),
            active_connections: stats.active_connections.load(Ordering::Relaxed),
            rejected_handshakes: stats.rejected_handshakes.load(Ordering::Relaxed),
            messages_received: stats.messages_received.load(Ordering::Relaxed),
            active_groups: self.state.registry.group_count().await,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.state.config
    }

    pub fn registry(&self) -> &GroupRegistry {
        &self.state.registry
    }

    pub fn geofence(&self) -> &GeofenceService {
        &self.state.geofence
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

fn handshake_error(e: tokio_tungstenite::tungstenite::Error) -> String {
    match e {
        tokio_tungstenite::tungstenite::Error::Http(resp) => format!("HTTP {}", resp.status()),
        other => other.to_string(),
    }
}

async fn next_envelope(
    rx: &mut Option<broadcast::Receiver<Arc<Envelope>>>,
) -> Result<Arc<Envelope>, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
