// Read-only HTTP surface: recording status and the raw config file.
//
// Config mutation goes through the queue contract and a process restart,
// never through HTTP.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use camgate_record::RecordingRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RecordingRegistry>,
    pub config_path: String,
}

pub fn router(registry: Arc<RecordingRegistry>, config_path: String) -> Router {
    Router::new()
        .route("/api/record/status", get(record_status))
        .route("/api/config", get(config_file))
        .with_state(AppState {
            registry,
            config_path,
        })
}

/// Snapshot of every active recording session.
async fn record_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.statuses().await)
}

/// The raw YAML config file, as on disk.
async fn config_file(State(state): State<AppState>) -> impl IntoResponse {
    match tokio::fs::read(&state.config_path).await {
        Ok(data) => ([(header::CONTENT_TYPE, "application/yaml")], data).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}
