//! Backend assembly: construct the stores and services, wire the long-
//! lived tasks, and serve until shutdown.

use anyhow::{Context, Result};
use engram_db::EngramDb;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::info;

use crate::api::{self, AppState};
use crate::db::hubs::HubStore;
use crate::db::queue::TaskQueue;
use crate::db::sessions::SessionStore;
use crate::db::tokens::TokenStore;
use crate::dispatcher::Dispatcher;
use crate::events::EventBus;
use crate::federation::FederationClient;
use crate::hub::WorkerHub;
use crate::reaper::Reaper;
use crate::registry::HubRegistry;
use crate::router::FederatedRouter;
use crate::tokens::TokenService;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Backend configuration.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub bind_addr: String,
    pub db_path: PathBuf,
    /// Bearer token required on /api in remote mode; None means
    /// localhost-only local mode.
    pub api_token: Option<String>,
    /// Shared secret for hub federation (both directions).
    pub hub_token: Option<String>,
}

/// Build everything and serve until ctrl-c.
pub async fn run(config: BackendConfig) -> Result<()> {
    let db = EngramDb::open(&config.db_path)
        .await
        .context("Failed to open database")?;

    let bus = EventBus::new();
    let dispatch_signal = Arc::new(Notify::new());

    let queue = TaskQueue::new(db.clone(), bus.clone());
    let sessions = SessionStore::new(db.clone(), bus.clone());
    let tokens = TokenService::new(TokenStore::new(db.clone()));
    let registry = HubRegistry::new(HubStore::new(db.clone()));
    registry.initialize().await?;

    let hub = Arc::new(WorkerHub::new(
        queue.clone(),
        tokens.clone(),
        bus.clone(),
        Arc::clone(&dispatch_signal),
    ));

    let federation = config.hub_token.clone().map(|token| {
        Arc::new(FederationClient::new(
            queue.clone(),
            Arc::clone(&dispatch_signal),
            token,
        ))
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher = Dispatcher::new(
        queue.clone(),
        FederatedRouter::new(registry.clone()),
        Arc::clone(&hub),
        federation.clone(),
        Arc::clone(&dispatch_signal),
    );
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown_rx.clone()));

    let reaper = Reaper::new(
        queue.clone(),
        sessions.clone(),
        Arc::clone(&hub),
        registry.clone(),
        federation,
        Arc::clone(&dispatch_signal),
    );
    let reaper_handle = tokio::spawn(reaper.run(shutdown_rx));

    let state = AppState {
        queue,
        sessions,
        tokens,
        registry: registry.clone(),
        hub,
        bus,
        dispatch_signal,
        api_token: config.api_token.map(Arc::new),
        hub_token: config.hub_token.map(Arc::new),
        version: VERSION,
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("Backend listening on {}", config.bind_addr);

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("HTTP server failed")?;

    // Stop the background loops and record the hub as offline.
    let _ = shutdown_tx.send(true);
    let _ = dispatcher_handle.await;
    let _ = reaper_handle.await;
    registry.mark_local_offline().await?;
    db.close().await;
    info!("Backend stopped");
    Ok(())
}
