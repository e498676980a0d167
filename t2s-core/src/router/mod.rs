//! Provider fallback routing.
//!
//! Providers are tried in strict priority order. Each one carries a health
//! state driven by consecutive failures: degraded providers get a short
//! timeout, unavailable ones are skipped until a cooldown elapses and a single
//! probe request succeeds.

mod dispatch;
mod health;

pub use dispatch::ResponseStream;
pub use health::HealthState;

use crate::audit::{AuditSink, ProviderAttempt};
use crate::error::RouterError;
use crate::ids::OwnerId;
use crate::rate_limit::to_chrono;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use health::{HealthPolicy, ProviderHealth};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use t2s_llm::{ChatMessage, ProviderClient, Usage};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub degraded_after: u32,
    pub unavailable_after: u32,
    pub attempt_timeout: Duration,
    pub degraded_timeout: Duration,
    pub probe_cooldown: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            degraded_after: 3,
            unavailable_after: 5,
            attempt_timeout: Duration::from_secs(60),
            degraded_timeout: Duration::from_secs(10),
            probe_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub id: Uuid,
    pub requester: OwnerId,
    pub prompt: String,
    pub context: Vec<ChatMessage>,
    pub streaming: bool,
    pub deadline: Option<tokio::time::Instant>,
}

impl LlmRequest {
    pub fn new(requester: OwnerId, prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            requester,
            prompt: prompt.into(),
            context: Vec::new(),
            streaming: false,
            deadline: None,
        }
    }

    pub fn with_context(mut self, context: Vec<ChatMessage>) -> Self {
        self.context = context;
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Overall time limit; caps each attempt's own timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(tokio::time::Instant::now() + timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    /// Text from the provider currently answering.
    Delta { provider: String, text: String },
    /// The provider that produced the preceding deltas failed. Drop them; the
    /// next provider starts over from scratch.
    Discard { provider: String },
    Completed(DispatchSummary),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSummary {
    pub provider: String,
    pub usage: Usage,
    pub attempts: Vec<ProviderAttempt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub provider: String,
    pub usage: Usage,
    pub attempts: Vec<ProviderAttempt>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub priority: usize,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub streaming: bool,
}

pub(crate) struct ProviderSlot {
    client: Arc<dyn ProviderClient>,
    health: Mutex<ProviderHealth>,
}

impl ProviderSlot {
    fn health(&self) -> MutexGuard<'_, ProviderHealth> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) struct RouterInner {
    config: RouterConfig,
    policy: HealthPolicy,
    providers: Vec<Arc<ProviderSlot>>,
    audit: Arc<dyn AuditSink>,
}

#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// `providers` is the priority order; index 0 is tried first.
    pub fn new(
        config: RouterConfig,
        providers: Vec<Arc<dyn ProviderClient>>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let policy = HealthPolicy {
            degraded_after: config.degraded_after.max(1),
            unavailable_after: config.unavailable_after.max(config.degraded_after.max(1)),
            probe_cooldown: to_chrono(config.probe_cooldown),
        };
        let providers = providers
            .into_iter()
            .map(|client| {
                Arc::new(ProviderSlot {
                    client,
                    health: Mutex::new(ProviderHealth::default()),
                })
            })
            .collect();
        Self {
            inner: Arc::new(RouterInner {
                config,
                policy,
                providers,
                audit,
            }),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    /// Starts answering `request`. Fails immediately when the prompt is empty
    /// or no provider is currently eligible; otherwise every later failure
    /// arrives as the stream's last item.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(request_id = %request.id, requester = %request.requester, streaming = request.streaming)
    )]
    pub fn dispatch(&self, request: LlmRequest) -> Result<ResponseStream, RouterError> {
        if request.prompt.trim().is_empty() {
            return Err(RouterError::InvalidRequest("prompt is empty".to_string()));
        }
        let now = Utc::now();
        let any_eligible = self
            .inner
            .providers
            .iter()
            .any(|slot| slot.health().is_selectable(&self.inner.policy, now));
        if !any_eligible {
            tracing::warn!("every provider is unavailable");
            return Err(RouterError::ProviderUnavailable {
                attempts: Vec::new(),
            });
        }
        Ok(dispatch::response_stream(self.inner.clone(), request))
    }

    /// Runs `request` to completion and returns the final provider's full text.
    pub async fn complete(&self, request: LlmRequest) -> Result<Completion, RouterError> {
        collect_completion(self.dispatch(request)?).await
    }

    pub fn snapshot(&self) -> Vec<ProviderStatus> {
        self.inner
            .providers
            .iter()
            .enumerate()
            .map(|(priority, slot)| {
                let health = slot.health();
                ProviderStatus {
                    name: slot.client.name().to_string(),
                    priority,
                    state: health.state(&self.inner.policy),
                    consecutive_failures: health.consecutive_failures(),
                    last_failure_at: health.last_failure_at(),
                    last_success_at: health.last_success_at(),
                    streaming: slot.client.supports_streaming(),
                }
            })
            .collect()
    }
}

/// Drains a dispatch stream into the text of the provider that finished.
pub async fn collect_completion(
    mut stream: ResponseStream,
) -> Result<Completion, RouterError> {
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        match event? {
            ResponseEvent::Delta { text: delta, .. } => text.push_str(&delta),
            ResponseEvent::Discard { .. } => text.clear(),
            ResponseEvent::Completed(summary) => {
                return Ok(Completion {
                    text,
                    provider: summary.provider,
                    usage: summary.usage,
                    attempts: summary.attempts,
                });
            }
        }
    }
    Err(RouterError::ProviderUnavailable {
        attempts: Vec::new(),
    })
}
