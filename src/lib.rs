pub mod api;
pub mod auth;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod filters;
pub mod listing;
pub mod models;
pub mod opd;
pub mod pagination;
pub mod pdf;
pub mod server;
pub mod toast;
pub mod web_api;

use std::sync::Arc;
use std::time::Duration;

use auth::SessionEvent;
use commands::AppState;
use config::AppConfig;
use db::LocalStore;
use error::AppResult;

/// How often other processes' logins and logouts are picked up
const SESSION_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Opens local storage, starts the session watcher and serves the local HTTP API.
pub async fn run(config: AppConfig) -> AppResult<()> {
    let store = Arc::new(LocalStore::open(&config.storage_path())?);
    let port = config.http_port;
    log::info!("[app] backend at {}", config.api_base_url);

    let state = Arc::new(AppState::new(config, store)?);

    let watcher = state.session.spawn_watcher(SESSION_POLL_INTERVAL);
    let mut events = state.session.subscribe();
    let opd_state = Arc::clone(&state);
    let listener = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::LoggedOut { external } => {
                    log::info!("[app] session ended (other window: {})", external);
                    opd_state.opd.lock().await.reset();
                    opd_state.toaster.info("Signed out", "Please log in again");
                }
                SessionEvent::LoggedIn { user } => {
                    log::info!(
                        "[app] signed in as {}",
                        user.map(|u| u.email).unwrap_or_else(|| "unknown user".into())
                    );
                }
            }
        }
    });

    let result = server::start_server(state, port).await;
    watcher.abort();
    listener.abort();
    result
}
