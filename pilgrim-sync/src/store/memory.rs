//! In-memory implementation of every store trait.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;

use super::{
    GroupStore, MemberStatusPatch, MemberStatusStore, MovementLogEntry, MovementLogStore,
    SitrepStore, StoreError, Waypoint, WaypointStore,
};
use crate::protocol::{
    GroupId, Location, MemberStatus, SitrepKind, SitrepRecord, UserId, WaypointId,
};

/// Stored state of one member.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberRecord {
    pub group_id: GroupId,
    pub status: MemberStatus,
    pub last_location: Option<Location>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_waypoint: Option<WaypointId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedMembership {
    pub user_id: UserId,
    pub group_id: GroupId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedSession {
    pub token: String,
    pub user_id: UserId,
}

/// Startup data for the standalone server.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub memberships: Vec<SeedMembership>,
    pub waypoints: Vec<Waypoint>,
    pub sessions: Vec<SeedSession>,
}

impl Seed {
    pub fn from_json(text: &str) -> Result<Self, StoreError> {
        serde_json::from_str(text).map_err(|e| StoreError::Seed(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Seed(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    memberships: RwLock<HashMap<UserId, GroupId>>,
    waypoints: RwLock<HashMap<GroupId, Vec<Waypoint>>>,
    members: RwLock<HashMap<UserId, MemberRecord>>,
    sitreps: RwLock<Vec<SitrepRecord>>,
    movement: RwLock<Vec<MovementLogEntry>>,
    next_sitrep_id: AtomicI64,
    waypoint_fetches: AtomicUsize,
    fail_group_lookups: AtomicBool,
    fail_movement: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: &Seed) -> Self {
        let mut memberships = HashMap::new();
        for m in &seed.memberships {
            memberships.insert(m.user_id, m.group_id);
        }
        let mut waypoints: HashMap<GroupId, Vec<Waypoint>> = HashMap::new();
        for wp in &seed.waypoints {
            waypoints.entry(wp.group_id).or_default().push(wp.clone());
        }
        Self {
            memberships: RwLock::new(memberships),
            waypoints: RwLock::new(waypoints),
            ..Self::default()
        }
    }

    pub async fn add_member(&self, user_id: UserId, group_id: GroupId) {
        self.memberships.write().await.insert(user_id, group_id);
    }

    pub async fn remove_member(&self, user_id: UserId) {
        self.memberships.write().await.remove(&user_id);
    }

    /// Replace a group's waypoints, in evaluation order.
    pub async fn set_waypoints(&self, group_id: GroupId, waypoints: Vec<Waypoint>) {
        self.waypoints.write().await.insert(group_id, waypoints);
    }

    pub async fn member(&self, user_id: UserId) -> Option<MemberRecord> {
        self.members.read().await.get(&user_id).cloned()
    }

    pub async fn sitreps(&self, group_id: GroupId) -> Vec<SitrepRecord> {
        self.sitreps
            .read()
            .await
            .iter()
            .filter(|s| s.group_id == group_id)
            .cloned()
            .collect()
    }

    pub async fn movement_log(&self) -> Vec<MovementLogEntry> {
        self.movement.read().await.clone()
    }

    /// How many times `get_waypoints` has been called.
    pub fn waypoint_fetches(&self) -> usize {
        self.waypoint_fetches.load(Ordering::SeqCst)
    }

    pub fn set_fail_group_lookups(&self, fail: bool) {
        self.fail_group_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_movement(&self, fail: bool) {
        self.fail_movement.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl GroupStore for MemoryStore {
    async fn get_user_group(&self, user_id: UserId) -> Result<Option<GroupId>, StoreError> {
        if self.fail_group_lookups.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("group lookup".to_string()));
        }
        Ok(self.memberships.read().await.get(&user_id).copied())
    }
}

#[async_trait]
impl WaypointStore for MemoryStore {
    async fn get_waypoints(&self, group_id: GroupId) -> Result<Vec<Waypoint>, StoreError> {
        self.waypoint_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.waypoints.read().await.get(&group_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl MemberStatusStore for MemoryStore {
    async fn update_status(
        &self,
        user_id: UserId,
        group_id: GroupId,
        patch: MemberStatusPatch,
    ) -> Result<(), StoreError> {
        let mut members = self.members.write().await;
        let record = members.entry(user_id).or_insert_with(|| MemberRecord {
            group_id,
            status: MemberStatus::Ok,
            last_location: None,
            last_seen_at: None,
            last_waypoint: None,
        });
        record.group_id = group_id;
        if let Some(status) = patch.status {
            record.status = status;
        }
        if let Some(location) = patch.last_location {
            record.last_location = Some(location);
        }
        if let Some(at) = patch.last_seen_at {
            record.last_seen_at = Some(at);
        }
        if let Some(waypoint) = patch.last_waypoint {
            record.last_waypoint = waypoint;
        }
        Ok(())
    }
}

#[async_trait]
impl SitrepStore for MemoryStore {
    async fn create(
        &self,
        group_id: GroupId,
        user_id: UserId,
        content: &str,
        kind: SitrepKind,
    ) -> Result<SitrepRecord, StoreError> {
        let record = SitrepRecord {
            id: self.next_sitrep_id.fetch_add(1, Ordering::SeqCst) + 1,
            group_id,
            user_id,
            content: content.to_string(),
            kind,
            created_at: Utc::now(),
        };
        self.sitreps.write().await.push(record.clone());
        Ok(record)
    }
}

#[async_trait]
impl MovementLogStore for MemoryStore {
    async fn append(
        &self,
        group_id: GroupId,
        user_id: UserId,
        lat: f64,
        lng: f64,
        status: &str,
    ) -> Result<(), StoreError> {
        if self.fail_movement.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("movement log".to_string()));
        }
        self.movement.write().await.push(MovementLogEntry {
            group_id,
            user_id,
            lat,
            lng,
            status: status.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }
}
