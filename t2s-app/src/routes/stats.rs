use super::{ApiError, owner_from_headers};
use crate::server::AppState;
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Extension, Json};
use std::sync::Arc;
use t2s_core::{Command, Inbound, Reply};

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/stats", get(get_stats))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_stats(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let owner = owner_from_headers(&headers)?;
    match state
        .orchestrator
        .handle(Inbound::new(owner, Command::UsageStats))
        .await?
    {
        Reply::Usage(report) => Ok(Json(serde_json::json!({
            "stats": report.stats,
            "remaining": report.remaining,
            "rate_limit": state.orchestrator.limiter().config().limit,
        }))),
        other => Err(ApiError::unexpected(&other)),
    }
}
