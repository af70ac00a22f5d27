//! # pilgrim-sync: Group coordination and offline resilience for pilgrim parties
//!
//! Client side keeps mutations durable while the network is away; server side
//! fans group traffic out and watches waypoints.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────────── client ────────────────────┐        ┌──────── server ────────┐
//!  │                                                │        │                        │
//!  │  send_beacon ──► ChannelClient ─── WebSocket ──┼──JSON──┼─► HubServer            │
//!  │      │ (offline)      ▲  backoff + jitter      │        │     │        │         │
//!  │      ▼                │                        │        │     ▼        ▼         │
//!  │  MutationQueue ──► SyncCoordinator             │        │  GroupRegistry  Geofence│
//!  │  (LocalStore)     (head-of-line drain) ──HTTP──┼─visits─┼─►  (fan-out)   Service │
//!  └────────────────────────────────────────────────┘        └────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages exchanged over the group channel
//! - [`queue`]: Durable, capped FIFO of pending mutations
//! - [`storage`]: Key/value persistence behind the queue (RocksDB or memory)
//! - [`channel`]: Reconnecting WebSocket client
//! - [`sync`]: Queue drain with head-of-line blocking
//! - [`hub`] / [`server`]: Session-authenticated group broadcast hub
//! - [`geofence`]: Waypoint arrival/departure and movement logging
//! - [`store`]: Collaborator traits used by the hub, with in-memory impls

pub mod backoff;
pub mod channel;
pub mod connectivity;
pub mod geofence;
pub mod hub;
pub mod listeners;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod storage;
pub mod store;
pub mod sync;
pub mod telemetry;

// Re-exports for convenience
pub use backoff::{Backoff, BackoffConfig};
pub use channel::{ChannelClient, ChannelConfig, ChannelError, ConnectionStatus, Delivery};
pub use connectivity::Connectivity;
pub use geofence::{GeofenceConfig, GeofenceService, Transition};
pub use hub::{GroupRegistry, RegistryStats};
pub use listeners::Subscription;
pub use protocol::{
    Beacon, ClientMessage, GroupId, Location, MemberStatus, Presence, ProtocolError,
    ServerMessage, ServerMessageKind, SitrepKind, SitrepRecord, UserId,
};
pub use queue::{Mutation, MutationQueue, QueueConfig, QueueItem, VisitPayload};
pub use server::{HubConfig, HubError, HubServer, ServerStats};
pub use storage::{LocalStore, LocalStoreConfig, MemoryLocalStore, RocksLocalStore, StorageError};
pub use store::{Collaborators, CookieSessions, MemoryStore, Seed, SessionResolver, StoreError};
pub use sync::{DrainReport, HttpVisitSubmitter, SubmitError, SyncCoordinator, VisitSubmitter};
pub use telemetry::{Telemetry, TelemetryConfig, TelemetryLevel};
