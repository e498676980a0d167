pub mod alerts;
pub mod health;
pub mod messages;
pub mod providers;
pub mod sessions;
pub mod stats;

use axum::Json;
use axum::Router;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use t2s_core::{AgentFailureKind, OrchestratorError, OwnerId, Reply, RouterError, SessionError};

/// Header carrying the caller's owner id; the transport in front of t2s is
/// responsible for authenticating it.
pub const OWNER_HEADER: &str = "x-t2s-owner";

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(messages::router())
        .merge(sessions::router())
        .merge(providers::router())
        .merge(stats::router())
        .merge(alerts::router())
}

#[derive(Debug)]
pub enum ApiError {
    MissingOwner,
    BadRequest(String),
    Internal(String),
    Orchestrator(OrchestratorError),
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self::Orchestrator(err)
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        Self::Orchestrator(err.into())
    }
}

impl From<RouterError> for ApiError {
    fn from(err: RouterError) -> Self {
        Self::Orchestrator(err.into())
    }
}

impl ApiError {
    pub fn unexpected(reply: &Reply) -> Self {
        Self::Internal(format!("unexpected orchestrator reply {reply:?}"))
    }

    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            Self::MissingOwner => (StatusCode::UNAUTHORIZED, "missing_owner"),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            Self::Orchestrator(err) => match err {
                OrchestratorError::Unauthorized { .. } => (StatusCode::FORBIDDEN, "unauthorized"),
                OrchestratorError::RateLimitExceeded { .. } => {
                    (StatusCode::TOO_MANY_REQUESTS, "rate_limit_exceeded")
                }
                OrchestratorError::Router(RouterError::InvalidRequest(_)) => {
                    (StatusCode::BAD_REQUEST, "invalid_request")
                }
                OrchestratorError::Router(RouterError::ProviderUnavailable { .. }) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "provider_unavailable")
                }
                OrchestratorError::Session(err) => match err {
                    SessionError::SessionAlreadyActive { .. } => {
                        (StatusCode::CONFLICT, "session_already_active")
                    }
                    SessionError::SessionBusy { .. } => (StatusCode::CONFLICT, "session_busy"),
                    SessionError::SessionNotFound(_) => (StatusCode::NOT_FOUND, "session_not_found"),
                    SessionError::AgentInvocationFailed { kind, .. } => match kind {
                        AgentFailureKind::TimedOut => {
                            (StatusCode::GATEWAY_TIMEOUT, "agent_invocation_failed")
                        }
                        AgentFailureKind::Internal | AgentFailureKind::Unreachable => {
                            (StatusCode::BAD_GATEWAY, "agent_invocation_failed")
                        }
                    },
                    SessionError::StatusQuery(_) => {
                        (StatusCode::SERVICE_UNAVAILABLE, "provider_unavailable")
                    }
                },
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        let message = match &self {
            Self::MissingOwner => format!("missing {OWNER_HEADER} header"),
            Self::BadRequest(msg) | Self::Internal(msg) => msg.clone(),
            Self::Orchestrator(err) => err.to_string(),
        };
        let mut body = serde_json::json!({
            "status": "error",
            "kind": kind,
            "error": message,
        });
        let mut retry_after = None;
        match &self {
            Self::Orchestrator(OrchestratorError::RateLimitExceeded { retry_after: wait, .. }) => {
                let secs = wait.as_secs().max(1);
                body["retry_after_seconds"] = serde_json::json!(secs);
                retry_after = Some(secs);
            }
            Self::Orchestrator(OrchestratorError::Router(RouterError::ProviderUnavailable {
                attempts,
            })) => {
                body["attempts"] = serde_json::json!(attempts);
            }
            Self::Orchestrator(OrchestratorError::Session(SessionError::AgentInvocationFailed {
                kind,
                ..
            })) => {
                body["failure"] = serde_json::json!(kind);
            }
            _ => {}
        }
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), kind, error = %message, "request failed");
        }
        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub fn owner_from_headers(headers: &HeaderMap) -> Result<OwnerId, ApiError> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(OwnerId::new)
        .ok_or(ApiError::MissingOwner)
}
