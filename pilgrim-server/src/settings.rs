//! Process settings read from the environment.

use std::path::PathBuf;

use pilgrim_sync::store::DEFAULT_SESSION_COOKIE;
use pilgrim_sync::HubConfig;

#[derive(Debug, Clone)]
pub struct Settings {
    pub hub: HubConfig,
    /// Name of the cookie carrying the session token.
    pub session_cookie: String,
    /// JSON file with memberships, waypoints and sessions.
    pub seed_path: Option<PathBuf>,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut hub = HubConfig::default();
        if let Some(addr) = lookup("PILGRIM_BIND_ADDR") {
            hub.bind_addr = addr;
        }
        if let Some(path) = lookup("PILGRIM_WS_PATH") {
            hub.ws_path = if path.starts_with('/') { path } else { format!("/{path}") };
        }
        if let Some(capacity) = lookup("PILGRIM_BROADCAST_CAPACITY") {
            match capacity.parse() {
                Ok(n) => hub.broadcast_capacity = n,
                Err(_) => log::warn!("Ignoring PILGRIM_BROADCAST_CAPACITY={capacity}"),
            }
        }

        Self {
            hub,
            session_cookie: lookup("PILGRIM_SESSION_COOKIE")
                .unwrap_or_else(|| DEFAULT_SESSION_COOKIE.to_string()),
            seed_path: lookup("PILGRIM_SEED").map(PathBuf::from),
        }
    }
}
