//! HTTP request handlers for the relay's health endpoint.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use tower_http::trace::TraceLayer;

use crate::relay::{HealthReport, HealthStatus, Supervisor};

/// Application state shared across handlers.
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
}

/// Health check endpoint.
///
/// Answers 503 while any worker is faulted.
pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthReport>) {
    let report = state.supervisor.health();
    let code = match report.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(report))
}

/// Routes served by the relay.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Settings;

    #[tokio::test]
    async fn test_health_without_workers_is_healthy() {
        let supervisor = Arc::new(Supervisor::from_settings(&Settings::default(), |_| None).unwrap());
        let state = Arc::new(AppState { supervisor });

        let (code, Json(report)) = health_check(State(state)).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.workers.is_empty());
        assert_eq!(report.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_health_report_json_shape() {
        let report = HealthReport {
            status: HealthStatus::Degraded,
            version: "1.2.3".to_string(),
            workers: Vec::new(),
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "status": "degraded", "version": "1.2.3", "workers": [] })
        );
    }
}
