use super::{ApiError, owner_from_headers};
use crate::server::AppState;
use axum::extract::Query;
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;
use t2s_core::OrchestratorError;

const DEFAULT_LIMIT: usize = 20;

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    #[serde(default)]
    limit: Option<usize>,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/alerts", get(list_alerts))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_alerts(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let owner = owner_from_headers(&headers)?;
    if !state.orchestrator.is_authorized(&owner) {
        return Err(OrchestratorError::Unauthorized { owner }.into());
    }
    let Some(monitor) = state.monitor.as_ref() else {
        return Ok(Json(serde_json::json!({
            "enabled": false,
            "alerts": [],
        })));
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    Ok(Json(serde_json::json!({
        "enabled": true,
        "monitor": monitor.status(),
        "rules": monitor.engine().rule_states(),
        "alerts": monitor.recent(limit),
    })))
}
