//! Session resolution for the upgrade handshake.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::http::header::COOKIE;

use crate::protocol::UserId;

/// Cookie carrying the session token unless configured otherwise.
pub const DEFAULT_SESSION_COOKIE: &str = "pilgrim.sid";

/// Maps an upgrade request to the authenticated user.
///
/// Runs inside the synchronous handshake callback, so implementations must
/// not block for long.
pub trait SessionResolver: Send + Sync {
    fn resolve(&self, request: &Request) -> Option<UserId>;
}

/// Token table keyed by the value of one cookie.
pub struct CookieSessions {
    cookie_name: String,
    sessions: RwLock<HashMap<String, UserId>>,
}

impl CookieSessions {
    pub fn new(cookie_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub fn insert(&self, token: impl Into<String>, user_id: UserId) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.into(), user_id);
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
            .is_some()
    }

    fn lookup(&self, token: &str) -> Option<UserId> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .copied()
    }
}

impl Default for CookieSessions {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_COOKIE)
    }
}

impl SessionResolver for CookieSessions {
    fn resolve(&self, request: &Request) -> Option<UserId> {
        request
            .headers()
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|header| header.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == self.cookie_name)
            .and_then(|(_, token)| self.lookup(token.trim_matches('"')))
    }
}
