// ingest: Wake-protocol engine for battery-powered field sensors.
//
// Wires together the SQLite store, the protocol engine, the TTL sweeper,
// and the device WebSocket gateway.

use ingest::config;
use ingest::downstream::HttpDownstream;
use ingest::engine::{Engine, EngineConfig};
use ingest::lineage::HttpLineageResolver;
use ingest::publisher::SessionPublisher;
use ingest::state::AppState;
use ingest::storage::WakeStore;
use ingest::sweep;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config_path =
        env::var("INGEST_CONFIG").unwrap_or_else(|_| "/etc/glade/ingest.toml".to_owned());
    let cfg = config::load_config_from_path(Path::new(&config_path))
        .expect("failed to load config");

    let store = WakeStore::open(Path::new(&cfg.storage.sqlite_path))
        .expect("failed to open wake store");
    let store = Arc::new(Mutex::new(store));
    info!(path = %cfg.storage.sqlite_path, "wake store opened");

    let publisher = SessionPublisher::new();
    let lineage = HttpLineageResolver::new(
        &cfg.lineage.base_url,
        Duration::from_millis(cfg.lineage.timeout_ms),
    )
    .expect("failed to build lineage client");
    let downstream = HttpDownstream::new(
        &cfg.downstream.base_url,
        Duration::from_millis(cfg.downstream.timeout_ms),
    )
    .expect("failed to build downstream client");

    let engine = Arc::new(Engine::new(
        store,
        lineage,
        downstream,
        publisher.clone(),
        EngineConfig {
            fragment_ttl: chrono::Duration::minutes(i64::from(cfg.storage.fragment_ttl_minutes)),
            default_wake_hour: cfg.schedule.default_wake_hour,
        },
    ));

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(sweep::run_sweeper(
        engine.clone(),
        Duration::from_secs(cfg.storage.sweep_interval_secs),
        shutdown_rx,
    ));

    let state = AppState::new(engine, publisher);
    let router = ingest::build_router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
        .await
        .expect("failed to bind");
    info!(addr = %cfg.server.bind, "ingest listening");
    axum::serve(listener, router).await.expect("server error");
}
