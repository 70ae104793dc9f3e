// ingest: Library entry point.
// Exposes modules for integration testing.

pub mod config;
pub mod downstream;
pub mod engine;
pub mod finalizer;
pub mod gateway;
pub mod lineage;
pub mod publisher;
pub mod schedule;
pub mod state;
pub mod state_machine;
pub mod storage;
pub mod sweep;

pub use state::AppState;

use axum::{Router, routing::get};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/v1/devices", get(gateway::ws_device_handler))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .with_state(state)
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
