//! Pilgrim group hub: standalone WebSocket server.
//!
//! Loads memberships, waypoints and sessions from an optional JSON seed,
//! keeps everything else in memory, and serves the group channel.
//!
//! Configured through the environment: `PILGRIM_BIND_ADDR`, `PILGRIM_WS_PATH`,
//! `PILGRIM_BROADCAST_CAPACITY`, `PILGRIM_SESSION_COOKIE`, `PILGRIM_SEED`.
//! Log verbosity follows `RUST_LOG` (default `info`).

mod settings;

use std::sync::Arc;

use log::{error, info};
use pilgrim_sync::store::{Collaborators, CookieSessions, MemoryStore, Seed};
use pilgrim_sync::{HubServer, StoreError};

use settings::Settings;

fn load_seed(settings: &Settings) -> Result<Seed, StoreError> {
    match &settings.seed_path {
        Some(path) => {
            let seed = Seed::from_file(path)?;
            info!(
                "Loaded seed from {}: {} membership(s), {} waypoint(s), {} session(s)",
                path.display(),
                seed.memberships.len(),
                seed.waypoints.len(),
                seed.sessions.len()
            );
            Ok(seed)
        }
        None => {
            info!("No PILGRIM_SEED set; starting with empty stores");
            Ok(Seed::default())
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting pilgrim group hub...");

    let settings = Settings::from_env();
    let seed = match load_seed(&settings) {
        Ok(seed) => seed,
        Err(e) => {
            error!("Failed to load seed: {e}");
            std::process::exit(1);
        }
    };

    let sessions = Arc::new(CookieSessions::new(settings.session_cookie.clone()));
    for session in &seed.sessions {
        sessions.insert(session.token.clone(), session.user_id);
    }
    let store = Arc::new(MemoryStore::from_seed(&seed));

    let server = HubServer::new(settings.hub, Collaborators::in_memory(store, sessions));
    if let Err(e) = server.run().await {
        error!("Hub stopped: {e}");
        std::process::exit(1);
    }
}
