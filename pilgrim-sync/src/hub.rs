//! Per-group fan-out.
//!
//! Each group with at least one live connection owns a tokio broadcast
//! channel. Frames are encoded once and shared as `Arc<Envelope>`; each
//! connection task filters out envelopes addressed away from it.
//!
//! ```text
//!   GroupRegistry
//!     group 7 ── broadcast::Sender ──┬─► conn a (user 1)
//!              members {a:1, b:2, c:1} ├─► conn b (user 2)
//!                                    └─► conn c (user 1, second tab)
//! ```
//!
//! Membership changes happen under the registry write lock, so a group is
//! never removed while a concurrent join is adding to it. Sends take the read
//! lock only for the non-blocking `broadcast::Sender::send`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{GroupId, ProtocolError, ServerMessage, UserId};

/// Identity of one live socket.
pub type ConnectionId = Uuid;

/// An encoded frame on its way to a group.
#[derive(Debug)]
pub struct Envelope {
    /// Connection that must not receive this frame.
    pub exclude: Option<ConnectionId>,
    pub text: Arc<str>,
}

impl Envelope {
    pub fn is_for(&self, conn: ConnectionId) -> bool {
        self.exclude != Some(conn)
    }
}

struct GroupChannel {
    sender: broadcast::Sender<Arc<Envelope>>,
    members: HashMap<ConnectionId, UserId>,
}

/// What a leave did to the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    pub user_id: UserId,
    /// The same user still has another connection in the group.
    pub user_still_present: bool,
    pub group_removed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub messages_sent: u64,
    pub active_groups: usize,
    pub connections: usize,
}

pub struct GroupRegistry {
    groups: RwLock<HashMap<GroupId, GroupChannel>>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl GroupRegistry {
    /// `capacity` is the per-connection buffer; slower receivers skip ahead.
    pub fn new(capacity: usize) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Add a connection, creating the group if needed.
    pub async fn join(
        &self,
        group_id: GroupId,
        conn: ConnectionId,
        user_id: UserId,
    ) -> broadcast::Receiver<Arc<Envelope>> {
        let mut groups = self.groups.write().await;
        let group = groups.entry(group_id).or_insert_with(|| {
            log::debug!("Group {group_id} opened");
            let (sender, _) = broadcast::channel(self.capacity);
            GroupChannel { sender, members: HashMap::new() }
        });
        group.members.insert(conn, user_id);
        group.sender.subscribe()
    }

    /// Remove a connection; an emptied group is discarded.
    pub async fn leave(&self, group_id: GroupId, conn: ConnectionId) -> Option<Departure> {
        let mut groups = self.groups.write().await;
        let group = groups.get_mut(&group_id)?;
        let user_id = group.members.remove(&conn)?;

        let user_still_present = group.members.values().any(|u| *u == user_id);
        let group_removed = group.members.is_empty();
        if group_removed {
            groups.remove(&group_id);
            log::debug!("Group {group_id} closed (empty)");
        }
        Some(Departure { user_id, user_still_present, group_removed })
    }

    /// Encode once and fan out. Returns the number of receivers reached.
    pub async fn broadcast(
        &self,
        group_id: GroupId,
        message: &ServerMessage,
        exclude: Option<ConnectionId>,
    ) -> Result<usize, ProtocolError> {
        let envelope = Arc::new(Envelope { exclude, text: Arc::from(message.encode()?) });
        Ok(self.broadcast_raw(group_id, envelope).await)
    }

    pub async fn broadcast_raw(&self, group_id: GroupId, envelope: Arc<Envelope>) -> usize {
        let groups = self.groups.read().await;
        let Some(group) = groups.get(&group_id) else {
            return 0;
        };
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        group.sender.send(envelope).unwrap_or(0)
    }

    /// Distinct users with at least one live connection.
    pub async fn online_users(&self, group_id: GroupId) -> Vec<UserId> {
        let groups = self.groups.read().await;
        let Some(group) = groups.get(&group_id) else {
            return Vec::new();
        };
        let mut users: Vec<UserId> = group.members.values().copied().collect::<HashSet<_>>().into_iter().collect();
        users.sort_unstable();
        users
    }

    pub async fn connection_count(&self, group_id: GroupId) -> usize {
        self.groups.read().await.get(&group_id).map_or(0, |g| g.members.len())
    }

    pub async fn group_count(&self) -> usize {
        self.groups.read().await.len()
    }

    pub async fn stats(&self) -> RegistryStats {
        let groups = self.groups.read().await;
        RegistryStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_groups: groups.len(),
            connections: groups.values().map(|g| g.members.len()).sum(),
        }
    }
}
