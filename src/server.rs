//! Gateway wiring: ban store, monitor, router and the accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, middleware, routing::get};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::ban_store::{BanStore, JsonFileBanStore, MemoryBanStore};
use crate::clock::SystemClock;
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::handlers::{dump_handler, health_handler, metrics_handler, proxy_handler};
use crate::monitor::RateMonitor;
use crate::rate_limit::admission;
use crate::state::AppState;
use crate::worker::ban_writer;

/// Every route, with admission in front of all of them.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/monitor/dump", get(dump_handler))
        .fallback(proxy_handler)
        .layer(middleware::from_fn_with_state(state.clone(), admission))
        .with_state(state)
}

// An unreadable store must not keep the gateway down
fn open_store(config: &GatewayConfig) -> Arc<dyn BanStore> {
    match &config.ban_store {
        Some(path) => match JsonFileBanStore::open(path) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::error!(path = %path.display(), "ban store unavailable, bans will not survive a restart: {e}");
                Arc::new(MemoryBanStore::new())
            }
        },
        None => {
            tracing::warn!("no --ban-store given, bans are kept in memory only");
            Arc::new(MemoryBanStore::new())
        }
    }
}

/// Serve on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

/// Start the gateway and run until Ctrl-C.
pub async fn run(config: GatewayConfig) -> Result<()> {
    let store = open_store(&config);

    // spawn the background ban writer
    let (ban_tx, ban_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(ban_writer(ban_rx, Arc::clone(&store)));

    let monitor = RateMonitor::new(config.monitor, store, Arc::new(SystemClock))
        .persist_in_background(ban_tx);

    let state = Arc::new(AppState {
        client: reqwest::Client::new(),
        monitor: Arc::new(monitor),
        upstream: config.upstream_url(),
        trust_forwarded_for: config.trust_forwarded_for,
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("Gateway running on http://localhost:{}", config.port);
    tracing::info!("Forwarding to {}", state.upstream);
    tracing::info!(
        "IP monitor: more than {} requests per {} seconds gets an IP banned",
        config.monitor.monitor_limit_count,
        config.monitor.monitor_limit_seconds
    );

    serve(listener, state, shutdown_signal()).await?;

    // router and state are gone, so the writer's queue closes once drained
    match writer.await {
        Ok(written) => tracing::info!(written, "shutdown complete"),
        Err(e) => tracing::error!("ban writer did not finish: {e}"),
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("could not listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
