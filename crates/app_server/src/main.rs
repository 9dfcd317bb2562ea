mod channel;
mod config;
mod registry;
mod routes;
mod session;
mod state;
#[cfg(test)]
mod tests;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use feed_angel::{FeedClient, WsTransport};
use infra_clock::{MarketClock, SystemClock};
use paper_engine::{PaperConfig, PaperEngine};
use scrip_directory::{AngelRestOhlc, DirectoryConfig, OhlcProvider, ScripDirectory};
use session_store::SnapshotStore;
use tower_http::cors::CorsLayer;

use config::ServerConfig;
use registry::{RegistrySink, SessionIndex, SessionRegistry};
use session::SessionDeps;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = observability::init_tracing("levelwatch");
    let prometheus = observability::init_metrics();

    let config = Arc::new(ServerConfig::load()?);
    let window = config.square_off_window()?;
    let clock: Arc<dyn MarketClock> = Arc::new(SystemClock::ist(window));

    let store = Arc::new(
        SnapshotStore::open(config.data_dir.join("sessions")).context("open snapshot store")?,
    );
    match store.cleanup_older_than(config.session_ttl_cold()) {
        Ok(0) => {}
        Ok(removed) => tracing::info!(removed, "discarded cold snapshots at startup"),
        Err(err) => tracing::warn!(error = %err, "startup snapshot cleanup failed"),
    }
    let flush = session_store::spawn_flush_worker(store.clone(), config.persistence_flush_interval());

    let sessions: SessionIndex = Arc::new(DashMap::new());
    let transport = Arc::new(WsTransport::new(
        config.feed_endpoint.clone(),
        Duration::from_secs(10),
    ));
    let feed = FeedClient::spawn(
        config.feed_config(),
        transport,
        Arc::new(RegistrySink::new(sessions.clone())),
    );

    let paper = PaperEngine::new(PaperConfig {
        per_trade_cap: config.per_trade_cap,
        averaging_enabled: config.averaging_enabled,
    });
    let deps = SessionDeps {
        clock: clock.clone(),
        feed: feed.clone(),
        flush: flush.clone(),
        paper,
        auto_square_off: config.auto_square_off,
        alert_log_cap: config.alert_log_cap,
        command_queue: config.command_queue,
    };
    let registry = SessionRegistry::new(sessions, store, deps);
    registry.spawn_sweeper(config.session_ttl_warm(), config.session_ttl_cold());

    let scrips = Arc::new(ScripDirectory::new(DirectoryConfig {
        cache_path: config.data_dir.join("scripmaster.json"),
        ..DirectoryConfig::default()
    }));
    {
        let scrips = scrips.clone();
        tokio::spawn(async move {
            if let Err(err) = scrips.load().await {
                tracing::warn!(error = %err, "scrip master load failed, search disabled");
            }
        });
    }
    let ohlc: Arc<dyn OhlcProvider> = Arc::new(AngelRestOhlc::new(None));

    let state = AppState {
        config: config.clone(),
        registry: registry.clone(),
        clock,
        feed: feed.clone(),
        scrips,
        ohlc,
        channels: Arc::new(DashMap::new()),
        prometheus,
    };
    channel::spawn_heartbeat(state.clone());

    let app = Router::new()
        .merge(routes::api_router())
        .route("/stream/{session_id}", get(channel::stream_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .context("parse bind address")?;
    tracing::info!(%addr, "levelwatch listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;

    tracing::info!("draining sessions");
    registry.shutdown_all(config.shutdown_grace()).await;
    feed.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("install ctrl-c handler");
    tracing::info!("shutdown signal received");
}
