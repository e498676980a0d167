use super::{ApiError, owner_from_headers};
use crate::server::AppState;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json};
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use t2s_core::{Command, Inbound, Reply, ResponseEvent, RouterError, collect_completion};
use t2s_llm::ChatMessage;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChatRequest {
    text: String,
    #[serde(default)]
    context: Vec<ChatMessage>,
    /// Deliver the answer as `text/event-stream` while it is generated.
    #[serde(default)]
    stream: bool,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/messages", post(send_message))
}

#[tracing::instrument(level = "info", skip_all)]
async fn send_message(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let reply = state
        .orchestrator
        .handle(Inbound::new(
            owner,
            Command::Chat {
                text: req.text,
                context: req.context,
                streaming: req.stream,
            },
        ))
        .await?;
    let Reply::Stream(stream) = reply else {
        return Err(ApiError::unexpected(&reply));
    };

    if req.stream {
        let events = stream.map(to_sse_event);
        return Ok(Sse::new(events)
            .keep_alive(KeepAlive::default())
            .into_response());
    }

    let completion = collect_completion(stream).await?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "text": completion.text,
        "provider": completion.provider,
        "usage": completion.usage,
        "attempts": completion.attempts.len(),
    }))
    .into_response())
}

fn to_sse_event(item: Result<ResponseEvent, RouterError>) -> Result<Event, axum::Error> {
    match item {
        Ok(ResponseEvent::Delta { provider, text }) => Event::default()
            .event("delta")
            .json_data(serde_json::json!({ "provider": provider, "text": text })),
        Ok(ResponseEvent::Discard { provider }) => Event::default()
            .event("discard")
            .json_data(serde_json::json!({ "provider": provider })),
        Ok(ResponseEvent::Completed(summary)) => Event::default().event("completed").json_data(
            serde_json::json!({
                "provider": summary.provider,
                "usage": summary.usage,
                "attempts": summary.attempts.len(),
            }),
        ),
        Err(err) => {
            let attempts = match &err {
                RouterError::ProviderUnavailable { attempts } => attempts.len(),
                RouterError::InvalidRequest(_) => 0,
            };
            Event::default().event("error").json_data(serde_json::json!({
                "error": err.to_string(),
                "attempts": attempts,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_defaults_to_non_streaming() {
        let req: ChatRequest = serde_json::from_str(r#"{"text":"disk usage?"}"#).expect("parse");
        assert!(!req.stream);
        assert!(req.context.is_empty());
        assert!(serde_json::from_str::<ChatRequest>(r#"{"text":"x","model":"y"}"#).is_err());
    }

    #[test]
    fn router_failure_becomes_error_event() {
        let event = to_sse_event(Err(RouterError::ProviderUnavailable { attempts: vec![] }));
        assert!(event.is_ok());
    }
}
