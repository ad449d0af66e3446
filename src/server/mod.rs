pub mod error;
pub mod extract;
pub mod http;

use crate::auth::{OAuthProvider, StateStore};
use crate::config::Config;
use crate::store::MemoryStore;
use anyhow::Result;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

/// Build the application and serve HTTP until the listener fails
pub async fn run(config: Config) -> Result<()> {
    let sweep_every = Duration::from_secs(config.server.state_sweep_secs);
    let provider = Arc::new(OAuthProvider::new(&config.oauth)?);

    let state = http::AppState::new(config, MemoryStore::new(), provider)?;

    // Abandoned logins never reach the callback; expire them in the background
    let sweeper = tokio::spawn(sweep_states(state.states.clone(), sweep_every));

    info!("HTTP server starting on {}", state.config.server.bind);
    let result = http::serve(state).await;

    sweeper.abort();
    result
}

async fn sweep_states(states: Arc<StateStore>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let removed = states.purge_expired();
        if removed > 0 {
            debug!("Expired {} pending login states", removed);
        }
    }
}
