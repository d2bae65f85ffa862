use crate::AppState;
use crate::config::ScanMode;
use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub scanner: String,
    pub scan_mode: String,
    pub active_sessions: usize,
    pub version: String,
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let dispatcher = &state.dispatcher;
    let scanner_status = match dispatcher.mode() {
        ScanMode::Inline => {
            if dispatcher.scanner().health_check().await {
                "healthy"
            } else {
                "unavailable"
            }
        }
        ScanMode::Async => "remote",
        ScanMode::Disabled => "disabled",
    };

    Json(HealthResponse {
        status: "ok".to_string(),
        scanner: scanner_status.to_string(),
        scan_mode: format!("{:?}", dispatcher.mode()).to_lowercase(),
        active_sessions: state.coordinator.monitor().len(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
