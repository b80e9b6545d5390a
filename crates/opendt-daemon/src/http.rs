//! HTTP status surface
//!
//! The daemon trio: `/health` for liveness, `/status` for the engine and
//! calibration snapshots, `/metrics` for raw counters.

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, response::Json, routing::get, Router};
use tower_http::cors::CorsLayer;

use opendt_calibrate::CalibrationMetrics;
use opendt_engine::EngineMetrics;

#[derive(Clone)]
pub struct AppState {
    pub started: Instant,
    pub worker_id: Option<String>,
    pub engine: Arc<EngineMetrics>,
    pub calibration: Option<Arc<CalibrationMetrics>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .layer(CorsLayer::new().allow_origin(axum::http::HeaderValue::from_static("*")))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.started.elapsed().as_secs(),
    }))
}

async fn status_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "worker_id": state.worker_id,
        "engine": state.engine.snapshot(),
        "calibration": state.calibration.as_ref().map(|m| m.snapshot()),
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let engine = state.engine.snapshot();
    let mut metrics = serde_json::json!({
        "windows_open": engine.windows_open,
        "windows_closed": engine.windows_closed,
        "windows_simulated": engine.windows_simulated,
        "windows_skipped": engine.windows_skipped,
        "backlog_depth": engine.backlog_depth,
        "invalid_events": engine.invalid_events,
        "integrity_warnings": engine.integrity_warnings,
        "cache_entries": engine.cache_entries,
        "topology_generation": engine.topology_generation,
        "watermark_ms": engine.watermark_ms,
    });
    if let Some(calibration) = &state.calibration {
        let snapshot = calibration.snapshot();
        metrics["calibration_epochs_completed"] = snapshot.epochs_completed.into();
        metrics["calibration_candidates_failed"] = snapshot.candidates_failed.into();
        metrics["calibration_published_updates"] = snapshot.published_updates.into();
    }
    Json(metrics)
}
