use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;
use t2s_core::HealthState;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/health", get(get_health))
}

/// Unauthenticated liveness report. Ready while at least one provider can
/// still be selected.
#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let providers = state.orchestrator.router().snapshot();
    let count = |wanted: HealthState| providers.iter().filter(|p| p.state == wanted).count();
    let healthy = count(HealthState::Healthy);
    let degraded = count(HealthState::Degraded);
    let unavailable = count(HealthState::Unavailable);
    let ready = healthy + degraded > 0;
    let live_sessions = state.orchestrator.sessions().list().len();

    Json(serde_json::json!({
        "status": if ready { "ok" } else { "degraded" },
        "ready": ready,
        "checked_at": Utc::now(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "checks": {
            "providers": {
                "healthy": healthy,
                "degraded": degraded,
                "unavailable": unavailable,
            },
            "sessions": {
                "live": live_sessions,
            },
            "alerts": state.monitor.as_ref().map(|m| m.status()),
        }
    }))
}
