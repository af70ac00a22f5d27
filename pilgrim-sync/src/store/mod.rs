//! Server-side collaborators the hub and geofence service depend on.
//!
//! ```text
//!   HubServer ─┬─ SessionResolver      (handshake → user id)
//!              ├─ GroupStore           (membership check on join)
//!              ├─ SitrepStore          (beacon audit, sitreps, arrivals)
//!              └─ GeofenceService ─┬─ WaypointStore
//!                                  ├─ MemberStatusStore
//!                                  └─ MovementLogStore
//! ```
//!
//! The real system keeps these in a relational database owned by another
//! service. [`MemoryStore`] implements every store trait in process and is
//! what the binary and the tests run against.

pub mod memory;
pub mod session;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{
    GroupId, Location, MemberStatus, SitrepKind, SitrepRecord, UserId, WaypointId,
};

pub use memory::{MemoryStore, Seed};
pub use session::{CookieSessions, SessionResolver, DEFAULT_SESSION_COOKIE};

/// Store errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid seed data: {0}")]
    Seed(String),
}

/// A named circular area a group cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Waypoint {
    pub id: WaypointId,
    pub group_id: GroupId,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Metres.
    pub radius: f64,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Partial update of a member's stored state; `None` fields are untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemberStatusPatch {
    pub status: Option<MemberStatus>,
    pub last_location: Option<Location>,
    pub last_seen_at: Option<DateTime<Utc>>,
    /// `Some(None)` clears the marker.
    pub last_waypoint: Option<Option<WaypointId>>,
}

impl MemberStatusPatch {
    pub fn status(status: MemberStatus) -> Self {
        Self { status: Some(status), ..Self::default() }
    }

    pub fn seen_at(location: Location, at: DateTime<Utc>) -> Self {
        Self {
            last_location: Some(location),
            last_seen_at: Some(at),
            ..Self::default()
        }
    }

    pub fn waypoint(waypoint: Option<WaypointId>) -> Self {
        Self { last_waypoint: Some(waypoint), ..Self::default() }
    }
}

/// One row of a member's movement trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementLogEntry {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub lat: f64,
    pub lng: f64,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait GroupStore: Send + Sync {
    /// The group the user currently belongs to.
    async fn get_user_group(&self, user_id: UserId) -> Result<Option<GroupId>, StoreError>;
}

#[async_trait]
pub trait WaypointStore: Send + Sync {
    async fn get_waypoints(&self, group_id: GroupId) -> Result<Vec<Waypoint>, StoreError>;
}

#[async_trait]
pub trait MemberStatusStore: Send + Sync {
    async fn update_status(
        &self,
        user_id: UserId,
        group_id: GroupId,
        patch: MemberStatusPatch,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SitrepStore: Send + Sync {
    async fn create(
        &self,
        group_id: GroupId,
        user_id: UserId,
        content: &str,
        kind: SitrepKind,
    ) -> Result<SitrepRecord, StoreError>;
}

#[async_trait]
pub trait MovementLogStore: Send + Sync {
    async fn append(
        &self,
        group_id: GroupId,
        user_id: UserId,
        lat: f64,
        lng: f64,
        status: &str,
    ) -> Result<(), StoreError>;
}

/// Handles to every store, passed to the hub as one bundle.
#[derive(Clone)]
pub struct Collaborators {
    pub sessions: Arc<dyn SessionResolver>,
    pub groups: Arc<dyn GroupStore>,
    pub waypoints: Arc<dyn WaypointStore>,
    pub member_status: Arc<dyn MemberStatusStore>,
    pub sitreps: Arc<dyn SitrepStore>,
    pub movement: Arc<dyn MovementLogStore>,
}

impl Collaborators {
    /// Every store backed by one in-memory instance.
    pub fn in_memory(store: Arc<MemoryStore>, sessions: Arc<dyn SessionResolver>) -> Self {
        Self {
            sessions,
            groups: store.clone(),
            waypoints: store.clone(),
            member_status: store.clone(),
            sitreps: store.clone(),
            movement: store,
        }
    }
}
