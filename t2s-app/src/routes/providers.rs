use super::{ApiError, owner_from_headers};
use crate::server::AppState;
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Extension, Json};
use std::sync::Arc;
use t2s_core::{Command, Inbound, Reply};

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/providers", get(list_providers))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_providers(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let owner = owner_from_headers(&headers)?;
    match state
        .orchestrator
        .handle(Inbound::new(owner, Command::ProviderStatus))
        .await?
    {
        Reply::Providers(providers) => Ok(Json(serde_json::json!({ "providers": providers }))),
        other => Err(ApiError::unexpected(&other)),
    }
}
