//! Online/offline signal shared by the channel client and the sync coordinator.
//!
//! The platform layer calls [`Connectivity::set_online`]; consumers either
//! read the current belief or `watch` for changes.

use std::sync::Arc;

use tokio::sync::watch;

use crate::listeners::{ListenerSet, Subscription};

#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
    listeners: ListenerSet<bool>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx), listeners: ListenerSet::new() }
    }

    /// Whether the network is believed available.
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Report a connectivity change. Repeated reports of the same state are ignored.
    pub fn set_online(&self, online: bool) {
        let previous = self.tx.send_replace(online);
        if previous != online {
            log::info!("Connectivity: {}", if online { "online" } else { "offline" });
            self.listeners.notify(&online);
        }
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Called with the new state after every change.
    pub fn on_change(&self, callback: impl Fn(&bool) + Send + Sync + 'static) -> Subscription {
        self.listeners.add(callback)
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}
