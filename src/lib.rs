// Harvest proxy - OpenAI-compatible gateway over a harvested upstream session

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod proxy;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use auth::harvester::HarvesterHub;
use auth::refresh::{RefreshCoordinator, RefreshPolicy, RefreshSignals};
use auth::CredentialStore;
use proxy::client::UpstreamClient;
use proxy::Gateway;

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

pub async fn run() -> anyhow::Result<()> {
    let config = config::init_config(None)?;
    init_tracing(config.debug);
    if let Some(path) = config::get_config_path() {
        tracing::info!("Using config {:?}", path);
    }

    let signals = Arc::new(RefreshSignals::new());
    let store = Arc::new(CredentialStore::new(
        Some(config.credentials_path()),
        signals.clone(),
        Duration::from_secs(config.refresh.stale_warn_secs),
    ));
    store.load();

    let hub = Arc::new(HarvesterHub::new());
    let coordinator = Arc::new(RefreshCoordinator::new(
        store.clone(),
        signals,
        hub.clone(),
        RefreshPolicy::from(&config.refresh),
    ));

    let client = UpstreamClient::new(&config.upstream)?;
    let gateway = Arc::new(Gateway::new(client, coordinator.clone(), config.models_path()));

    let keep_alive = if config.refresh.keep_alive_secs > 0 {
        Some(coordinator.spawn_keep_alive(config.refresh.keep_alive_interval()))
    } else {
        tracing::info!("Keep-alive refresh disabled");
        None
    };

    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down...");
            if let Err(e) = api::stop_server().await {
                tracing::error!("Failed to stop server: {}", e);
            }
        }
    });

    if config.api_keys.is_empty() {
        tracing::warn!("No API keys configured; the API is open to anyone who can reach it");
    }

    let state = api::AppState {
        gateway,
        store,
        hub,
        api_keys: Arc::new(config.api_keys.clone()),
    };
    let result = api::start_server(&config.bind_address(), state).await;

    if let Some(handle) = keep_alive {
        handle.abort();
    }
    result
}
