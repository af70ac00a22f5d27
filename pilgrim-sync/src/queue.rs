//! Durable offline mutation queue.
//!
//! Actions taken while the channel is down are appended here and drained by
//! the [`SyncCoordinator`](crate::sync::SyncCoordinator) once connectivity
//! returns. The queue is FIFO, bounded, and rewritten to the local store
//! after every mutation:
//!
//! ```text
//!   push ──► [ oldest … newest ] ──► peek / pop_if (after remote ack)
//!              │ len == cap? evict oldest (warn)
//!              ▼
//!   LocalStore["offline_mutation_queue"] = JSON array of QueueItem
//! ```
//!
//! The in-memory deque is authoritative for the session. Storage write
//! failures are logged and otherwise ignored.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::listeners::{ListenerSet, Subscription};
use crate::protocol::{Beacon, ClientMessage, Location};
use crate::storage::LocalStore;

/// Storage key holding the serialized queue.
pub const QUEUE_STORAGE_KEY: &str = "offline_mutation_queue";

/// Default maximum number of retained items.
pub const DEFAULT_MAX_ITEMS: usize = 1000;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Oldest items are evicted once this many are held (default: 1000)
    pub max_items: usize,
    /// Key in the local store (default: "offline_mutation_queue")
    pub storage_key: String,
}

impl QueueConfig {
    /// Effective cap; a queue always holds at least one item.
    pub fn capacity(&self) -> usize {
        self.max_items.max(1)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_ITEMS,
            storage_key: QUEUE_STORAGE_KEY.to_string(),
        }
    }
}

/// Check-in recorded while offline, submitted over HTTP rather than the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitPayload {
    pub shrine_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub is_virtual: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

/// A queued user action, stored as `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Mutation {
    LocationUpdate(Location),
    BeaconSignal(Beacon),
    Sitrep(String),
    Visit(VisitPayload),
}

impl Mutation {
    pub fn type_name(&self) -> &'static str {
        match self {
            Mutation::LocationUpdate(_) => "location_update",
            Mutation::BeaconSignal(_) => "beacon_signal",
            Mutation::Sitrep(_) => "sitrep",
            Mutation::Visit(_) => "visit",
        }
    }

    /// The channel message that applies this mutation, or `None` for visits.
    pub fn to_client_message(&self) -> Option<ClientMessage> {
        match self {
            Mutation::LocationUpdate(location) => {
                Some(ClientMessage::LocationUpdate { location: *location })
            }
            Mutation::BeaconSignal(signal) => Some(ClientMessage::BeaconSignal { signal: *signal }),
            Mutation::Sitrep(text) => Some(ClientMessage::Sitrep { text: text.clone() }),
            Mutation::Visit(_) => None,
        }
    }
}

/// One entry of the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    #[serde(flatten)]
    pub mutation: Mutation,
    /// Epoch milliseconds; non-decreasing front to back.
    pub created_at: i64,
}

/// What changed, delivered to queue subscribers after the change is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueChange {
    Pushed(QueueItem),
    Popped(QueueItem),
    Removed(QueueItem),
    Cleared,
}

pub struct MutationQueue {
    items: Mutex<VecDeque<QueueItem>>,
    store: Arc<dyn LocalStore>,
    config: QueueConfig,
    listeners: ListenerSet<QueueChange>,
}

impl MutationQueue {
    /// Load the queue from `store`. Missing or unreadable data yields an empty queue.
    pub fn open(store: Arc<dyn LocalStore>, config: QueueConfig) -> Self {
        let items = load(store.as_ref(), &config);
        if !items.is_empty() {
            log::info!("Restored {} queued mutations", items.len());
        }
        Self {
            items: Mutex::new(items),
            store,
            config,
            listeners: ListenerSet::new(),
        }
    }

    pub fn with_defaults(store: Arc<dyn LocalStore>) -> Self {
        Self::open(store, QueueConfig::default())
    }

    /// Append a mutation, evicting the oldest item when full.
    pub fn push(&self, mutation: Mutation) -> QueueItem {
        let item = {
            let mut items = self.lock();
            while items.len() >= self.config.capacity() {
                if let Some(dropped) = items.pop_front() {
                    log::warn!(
                        "Mutation queue full ({}), evicting {} {}",
                        self.config.capacity(),
                        dropped.mutation.type_name(),
                        dropped.id
                    );
                }
            }

            let now = chrono::Utc::now().timestamp_millis();
            let created_at = items.back().map_or(now, |last| now.max(last.created_at));
            let item = QueueItem {
                id: uuid::Uuid::new_v4().to_string(),
                mutation,
                created_at,
            };
            items.push_back(item.clone());
            self.persist(&items);
            item
        };

        log::debug!("Queued {} {}", item.mutation.type_name(), item.id);
        self.listeners.notify(&QueueChange::Pushed(item.clone()));
        item
    }

    /// Oldest item, left in place.
    pub fn peek(&self) -> Option<QueueItem> {
        self.lock().front().cloned()
    }

    /// Remove and return the oldest item.
    pub fn pop(&self) -> Option<QueueItem> {
        let popped = {
            let mut items = self.lock();
            let popped = items.pop_front();
            if popped.is_some() {
                self.persist(&items);
            }
            popped
        };
        if let Some(item) = &popped {
            self.listeners.notify(&QueueChange::Popped(item.clone()));
        }
        popped
    }

    /// Pop the head only if it is still the item with `id`.
    pub fn pop_if(&self, id: &str) -> Option<QueueItem> {
        let popped = {
            let mut items = self.lock();
            if items.front().is_some_and(|head| head.id == id) {
                let popped = items.pop_front();
                self.persist(&items);
                popped
            } else {
                None
            }
        };
        if let Some(item) = &popped {
            self.listeners.notify(&QueueChange::Popped(item.clone()));
        }
        popped
    }

    /// Discard an arbitrary item. Returns whether it was present.
    pub fn remove(&self, id: &str) -> bool {
        let removed = {
            let mut items = self.lock();
            let removed = items
                .iter()
                .position(|item| item.id == id)
                .and_then(|idx| items.remove(idx));
            if removed.is_some() {
                self.persist(&items);
            }
            removed
        };
        match removed {
            Some(item) => {
                self.listeners.notify(&QueueChange::Removed(item));
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        {
            let mut items = self.lock();
            items.clear();
            self.persist(&items);
        }
        self.listeners.notify(&QueueChange::Cleared);
    }

    /// Snapshot of all items, oldest first.
    pub fn items(&self) -> Vec<QueueItem> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Be told about every change.
    pub fn subscribe(
        &self,
        callback: impl Fn(&QueueChange) + Send + Sync + 'static,
    ) -> Subscription {
        self.listeners.add(callback)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueueItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, items: &VecDeque<QueueItem>) {
        let bytes = match serde_json::to_vec(items) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to serialize mutation queue: {e}");
                return;
            }
        };
        if let Err(e) = self.store.set(&self.config.storage_key, &bytes) {
            log::error!("Failed to persist mutation queue: {e}");
        }
    }
}

fn load(store: &dyn LocalStore, config: &QueueConfig) -> VecDeque<QueueItem> {
    let bytes = match store.get(&config.storage_key) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return VecDeque::new(),
        Err(e) => {
            log::error!("Failed to read mutation queue: {e}");
            return VecDeque::new();
        }
    };

    let mut items: VecDeque<QueueItem> = match serde_json::from_slice::<Vec<QueueItem>>(&bytes) {
        Ok(items) => items.into(),
        Err(e) => {
            log::warn!("Discarding unreadable mutation queue: {e}");
            return VecDeque::new();
        }
    };

    let excess = items.len().saturating_sub(config.capacity());
    if excess > 0 {
        log::warn!("Stored queue exceeds {} items, dropping {excess} oldest", config.capacity());
        items.drain(..excess);
    }
    items
}
