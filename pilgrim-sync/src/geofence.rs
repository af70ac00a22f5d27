//! Geofence and movement service.
//!
//! Every location update from a joined member passes through
//! [`GeofenceService::process_location`]:
//!
//! ```text
//!   location ─► last-seen persisted + cached
//!            ─► movement log (≤ 1 write / interval / user, fire-and-forget)
//!            ─► waypoints(group)  [TTL cache, lazy refresh]
//!            ─► first waypoint with distance ≤ radius
//!            ─► compare with residency marker ─► Entered / Exited / nothing
//! ```
//!
//! Only transitions produce events; a member standing still inside a
//! waypoint is silent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use crate::protocol::{GroupId, Location, SitrepKind, UserId};
use crate::store::{
    MemberStatusPatch, MemberStatusStore, MovementLogStore, StoreError, Waypoint, WaypointStore,
};

/// Mean Earth radius in metres.
const EARTH_RADIUS_M: f64 = 6_371e3;

/// Geofence configuration.
#[derive(Debug, Clone)]
pub struct GeofenceConfig {
    /// How long a group's waypoint list is reused (default: 10s)
    pub waypoint_ttl: Duration,
    /// Minimum spacing of movement log writes per user (default: 5s)
    pub movement_interval: Duration,
    /// Status recorded with each movement log row (default: "MOVING")
    pub movement_status: String,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            waypoint_ttl: Duration::from_secs(10),
            movement_interval: Duration::from_secs(5),
            movement_status: "MOVING".to_string(),
        }
    }
}

/// A change in which waypoint a member is inside.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Entered(Waypoint),
    /// Left a waypoint without entering another.
    Exited(Waypoint),
}

impl Transition {
    pub fn waypoint(&self) -> &Waypoint {
        match self {
            Transition::Entered(wp) | Transition::Exited(wp) => wp,
        }
    }

    /// Timeline text for the synthetic sitrep.
    pub fn sitrep_text(&self) -> String {
        match self {
            Transition::Entered(wp) => format!("ARRIVED at {}", wp.name),
            Transition::Exited(wp) => format!("DEPARTED {}", wp.name),
        }
    }

    pub fn sitrep_kind(&self) -> SitrepKind {
        SitrepKind::Status
    }
}

/// Great-circle distance in metres.
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lng2 - lng1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// The first waypoint, in stored order, containing `location`.
pub fn containing_waypoint<'a>(waypoints: &'a [Waypoint], location: &Location) -> Option<&'a Waypoint> {
    waypoints.iter().find(|wp| {
        wp.radius > 0.0
            && haversine_m(location.lat, location.lng, wp.latitude, wp.longitude) <= wp.radius
    })
}

struct CachedWaypoints {
    waypoints: Arc<Vec<Waypoint>>,
    fetched_at: Instant,
}

pub struct GeofenceService {
    config: GeofenceConfig,
    waypoint_store: Arc<dyn WaypointStore>,
    member_status: Arc<dyn MemberStatusStore>,
    movement: Arc<dyn MovementLogStore>,
    cache: RwLock<HashMap<GroupId, CachedWaypoints>>,
    inside: RwLock<HashMap<(GroupId, UserId), Waypoint>>,
    last_movement_write: Mutex<HashMap<(GroupId, UserId), Instant>>,
    last_known: RwLock<HashMap<GroupId, HashMap<UserId, Location>>>,
}

impl GeofenceService {
    pub fn new(
        config: GeofenceConfig,
        waypoint_store: Arc<dyn WaypointStore>,
        member_status: Arc<dyn MemberStatusStore>,
        movement: Arc<dyn MovementLogStore>,
    ) -> Self {
        Self {
            config,
            waypoint_store,
            member_status,
            movement,
            cache: RwLock::new(HashMap::new()),
            inside: RwLock::new(HashMap::new()),
            last_movement_write: Mutex::new(HashMap::new()),
            last_known: RwLock::new(HashMap::new()),
        }
    }

    /// Record a member's new position and report any waypoint transition.
    ///
    /// Store failures are logged; they never prevent the caller from
    /// broadcasting the location.
    pub async fn process_location(
        &self,
        user_id: UserId,
        group_id: GroupId,
        location: Location,
    ) -> Option<Transition> {
        self.last_known
            .write()
            .await
            .entry(group_id)
            .or_default()
            .insert(user_id, location);

        if let Err(e) = self
            .member_status
            .update_status(user_id, group_id, MemberStatusPatch::seen_at(location, Utc::now()))
            .await
        {
            log::warn!("Failed to record last location of user {user_id}: {e}");
        }

        self.maybe_log_movement(user_id, group_id, location).await;

        let waypoints = match self.waypoints(group_id).await {
            Ok(waypoints) => waypoints,
            Err(e) => {
                log::warn!("Waypoints unavailable for group {group_id}: {e}");
                return None;
            }
        };

        let current = containing_waypoint(&waypoints, &location).cloned();
        let transition = {
            let mut inside = self.inside.write().await;
            let previous_id = inside.get(&(group_id, user_id)).map(|wp| wp.id);
            match current {
                Some(wp) if previous_id != Some(wp.id) => {
                    inside.insert((group_id, user_id), wp.clone());
                    Some(Transition::Entered(wp))
                }
                Some(_) => None,
                None => inside.remove(&(group_id, user_id)).map(Transition::Exited),
            }
        }?;

        let marker = match &transition {
            Transition::Entered(wp) => Some(wp.id),
            Transition::Exited(_) => None,
        };
        if let Err(e) = self
            .member_status
            .update_status(user_id, group_id, MemberStatusPatch::waypoint(marker))
            .await
        {
            log::warn!("Failed to persist waypoint marker for user {user_id}: {e}");
        }

        log::info!("User {user_id} in group {group_id}: {}", transition.sitrep_text());
        Some(transition)
    }

    /// Cached waypoints for `group_id`, refreshed when older than the TTL.
    pub async fn waypoints(&self, group_id: GroupId) -> Result<Arc<Vec<Waypoint>>, StoreError> {
        if let Some(cached) = self.cache.read().await.get(&group_id) {
            if cached.fetched_at.elapsed() < self.config.waypoint_ttl {
                return Ok(cached.waypoints.clone());
            }
        }

        let fetched = self.waypoint_store.get_waypoints(group_id).await?;
        let (valid, invalid): (Vec<_>, Vec<_>) = fetched
            .into_iter()
            .partition(|wp| wp.radius.is_finite() && wp.radius > 0.0);
        for wp in &invalid {
            log::warn!("Ignoring waypoint {} ({}) with radius {}", wp.id, wp.name, wp.radius);
        }

        let waypoints = Arc::new(valid);
        self.cache.write().await.insert(
            group_id,
            CachedWaypoints { waypoints: waypoints.clone(), fetched_at: Instant::now() },
        );
        Ok(waypoints)
    }

    /// Last reported position of each member of `group_id`.
    pub async fn last_known(&self, group_id: GroupId) -> Vec<(UserId, Location)> {
        self.last_known
            .read()
            .await
            .get(&group_id)
            .map(|members| members.iter().map(|(user, loc)| (*user, *loc)).collect())
            .unwrap_or_default()
    }

    /// Waypoint the member is currently marked inside.
    pub async fn residency(&self, group_id: GroupId, user_id: UserId) -> Option<Waypoint> {
        self.inside.read().await.get(&(group_id, user_id)).cloned()
    }

    /// Drop everything cached about a member who left the group.
    pub async fn forget(&self, group_id: GroupId, user_id: UserId) {
        self.inside.write().await.remove(&(group_id, user_id));
        self.last_movement_write.lock().await.remove(&(group_id, user_id));

        let mut last_known = self.last_known.write().await;
        if let Some(members) = last_known.get_mut(&group_id) {
            members.remove(&user_id);
            if members.is_empty() {
                last_known.remove(&group_id);
            }
        }
    }

    async fn maybe_log_movement(&self, user_id: UserId, group_id: GroupId, location: Location) {
        {
            let mut last = self.last_movement_write.lock().await;
            let now = Instant::now();
            let due = last
                .get(&(group_id, user_id))
                .map_or(true, |at| now.duration_since(*at) > self.config.movement_interval);
            if !due {
                return;
            }
            last.insert((group_id, user_id), now);
        }

        let movement = self.movement.clone();
        let status = self.config.movement_status.clone();
        tokio::spawn(async move {
            if let Err(e) = movement
                .append(group_id, user_id, location.lat, location.lng, &status)
                .await
            {
                log::warn!("Failed to append movement log for user {user_id}: {e}");
            }
        });
    }
}
