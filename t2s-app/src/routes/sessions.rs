use super::{ApiError, owner_from_headers};
use crate::server::AppState;
use axum::extract::Path;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;
use t2s_core::{Command, Inbound, OrchestratorError, Reply, SessionId};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StartSessionRequest {
    #[serde(default)]
    workspace: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubmitTaskRequest {
    instruction: String,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/sessions", get(list_sessions).post(start_session))
        .route("/api/v1/sessions/{id}", get(get_session).delete(end_session))
        .route("/api/v1/sessions/{id}/tasks", post(submit_task))
        .route("/api/v1/sessions/{id}/summary", get(summarize_session))
}

fn parse_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid session id {raw:?}")))
}

async fn handle(
    state: &AppState,
    headers: &HeaderMap,
    command: Command,
) -> Result<Reply, ApiError> {
    let owner = owner_from_headers(headers)?;
    Ok(state.orchestrator.handle(Inbound::new(owner, command)).await?)
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_sessions(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let owner = owner_from_headers(&headers)?;
    if !state.orchestrator.is_authorized(&owner) {
        return Err(OrchestratorError::Unauthorized { owner }.into());
    }
    let sessions: Vec<_> = state
        .orchestrator
        .sessions()
        .list()
        .into_iter()
        .filter(|s| s.owner == owner)
        .collect();
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

#[tracing::instrument(level = "info", skip_all)]
async fn start_session(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<StartSessionRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    match handle(&state, &headers, Command::StartSession { workspace: req.workspace }).await? {
        Reply::SessionStarted(id) => Ok(Json(serde_json::json!({
            "status": "ok",
            "session_id": id,
        }))),
        other => Err(ApiError::unexpected(&other)),
    }
}

#[tracing::instrument(level = "debug", skip_all, fields(session_id = %id))]
async fn get_session(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = Some(parse_id(&id)?);
    match handle(&state, &headers, Command::SessionStatus { session }).await? {
        Reply::Session(session) => Ok(Json(serde_json::json!({
            "status": "ok",
            "session": session,
        }))),
        other => Err(ApiError::unexpected(&other)),
    }
}

#[tracing::instrument(level = "info", skip_all, fields(session_id = %id))]
async fn end_session(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = Some(parse_id(&id)?);
    match handle(&state, &headers, Command::EndSession { session }).await? {
        Reply::SessionEnded(session) => Ok(Json(serde_json::json!({
            "status": "ok",
            "session": session,
        }))),
        other => Err(ApiError::unexpected(&other)),
    }
}

/// Blocks until the agent finishes; the HTTP timeout layer bounds the wait.
#[tracing::instrument(level = "info", skip_all, fields(session_id = %id))]
async fn submit_task(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = Some(parse_id(&id)?);
    let command = Command::SubmitTask {
        session,
        instruction: req.instruction,
    };
    match handle(&state, &headers, command).await? {
        Reply::TaskAccepted(task) => {
            let output = task.wait().await?;
            Ok(Json(serde_json::json!({
                "status": "ok",
                "session_id": output.session_id,
                "output": output.output,
                "elapsed_ms": output.elapsed_ms,
            })))
        }
        other => Err(ApiError::unexpected(&other)),
    }
}

#[tracing::instrument(level = "info", skip_all, fields(session_id = %id))]
async fn summarize_session(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = Some(parse_id(&id)?);
    match handle(&state, &headers, Command::SummarizeSession { session }).await? {
        Reply::Summary(summary) => Ok(Json(serde_json::json!({
            "status": "ok",
            "summary": summary,
        }))),
        other => Err(ApiError::unexpected(&other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_id_rejects_garbage() {
        let id = SessionId::new();
        assert_eq!(parse_id(&id.to_string()).expect("parse"), id);
        assert!(matches!(parse_id("not-a-uuid"), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn start_request_workspace_is_optional() {
        let req: StartSessionRequest = serde_json::from_str("{}").expect("parse");
        assert!(req.workspace.is_none());
    }
}
