use super::health::Admission;
use super::{ProviderSlot, ResponseEvent, RouterInner};
use crate::audit::{AttemptOutcome, ProviderAttempt};
use crate::error::RouterError;
use crate::router::{DispatchSummary, LlmRequest};
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt, stream};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use t2s_llm::{ChunkStream, LlmError, StreamChunk, Usage};
use tokio::time::Instant;

pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<ResponseEvent, RouterError>> + Send>>;

pub(super) fn response_stream(inner: Arc<RouterInner>, request: LlmRequest) -> ResponseStream {
    let dispatch = Dispatch {
        inner,
        request,
        next_index: 0,
        attempts: Vec::new(),
        active: None,
        pending: VecDeque::new(),
        finished: false,
    };
    Box::pin(stream::unfold(dispatch, |mut dispatch| async move {
        let event = dispatch.next_event().await?;
        Some((event, dispatch))
    }))
}

/// Holds a provider's attempt reservation. Dropping it without an outcome
/// (caller went away mid-attempt) frees any probe slot it took.
struct AttemptGuard {
    slot: Arc<ProviderSlot>,
    settled: bool,
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.slot.health().release_probe();
        }
    }
}

struct ActiveAttempt {
    guard: AttemptGuard,
    stream: ChunkStream,
    started: Instant,
    started_at: DateTime<Utc>,
    budget: Duration,
    deadline: Instant,
    buffered: String,
    yielded: bool,
}

struct Dispatch {
    inner: Arc<RouterInner>,
    request: LlmRequest,
    next_index: usize,
    attempts: Vec<ProviderAttempt>,
    active: Option<ActiveAttempt>,
    pending: VecDeque<Result<ResponseEvent, RouterError>>,
    finished: bool,
}

impl Dispatch {
    async fn next_event(&mut self) -> Option<Result<ResponseEvent, RouterError>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.finished {
                return None;
            }

            let polled = match self.active.as_mut() {
                None => {
                    if !self.open_next().await {
                        self.finished = true;
                        tracing::warn!(
                            request_id = %self.request.id,
                            attempts = self.attempts.len(),
                            "no provider answered"
                        );
                        self.pending.push_back(Err(RouterError::ProviderUnavailable {
                            attempts: self.attempts.clone(),
                        }));
                    }
                    continue;
                }
                Some(active) => {
                    tokio::time::timeout_at(active.deadline, active.stream.next()).await
                }
            };

            match polled {
                Err(_) => {
                    self.fail_active(AttemptOutcome::Timeout, "no output within attempt budget".into())
                        .await
                }
                Ok(Some(Err(err))) => self.fail_active(classify(&err), err.to_string()).await,
                Ok(Some(Ok(StreamChunk::Delta { content }))) => self.on_delta(content),
                Ok(Some(Ok(StreamChunk::Done { usage }))) => self.succeed_active(usage).await,
                Ok(None) => self.succeed_active(Usage::default()).await,
            }
        }
    }

    /// Walks the provider list from where the last attempt left off and opens
    /// the first one that admits us. Returns false once the list is exhausted.
    async fn open_next(&mut self) -> bool {
        while let Some(slot) = self.inner.providers.get(self.next_index).cloned() {
            self.next_index += 1;
            if self.request.deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::debug!(request_id = %self.request.id, "request deadline passed");
                return false;
            }

            let started_at = Utc::now();
            let admission = slot.health().admit(&self.inner.policy, started_at);
            let Some(admission) = admission else {
                tracing::debug!(provider = %slot.client.name(), "skipping unavailable provider");
                continue;
            };
            let budget = match admission {
                Admission::Normal => self.inner.config.attempt_timeout,
                Admission::Degraded | Admission::Probe => self.inner.config.degraded_timeout,
            };
            let guard = AttemptGuard {
                slot: slot.clone(),
                settled: false,
            };
            let started = Instant::now();
            let deadline = self.cap(started + budget);
            let upstream_streaming = self.request.streaming && slot.client.supports_streaming();
            tracing::debug!(
                provider = %slot.client.name(),
                ?admission,
                budget_ms = budget.as_millis() as u64,
                "attempting provider"
            );

            let opened = tokio::time::timeout_at(
                deadline,
                slot.client.complete(
                    &self.request.prompt,
                    &self.request.context,
                    upstream_streaming,
                ),
            )
            .await;
            match opened {
                Ok(Ok(stream)) => {
                    self.active = Some(ActiveAttempt {
                        guard,
                        stream,
                        started,
                        started_at,
                        budget,
                        deadline,
                        buffered: String::new(),
                        yielded: false,
                    });
                    return true;
                }
                Ok(Err(err)) => {
                    tracing::warn!(provider = %slot.client.name(), error = %err, "provider attempt failed");
                    self.record(
                        guard,
                        started,
                        started_at,
                        classify(&err),
                        Some(err.to_string()),
                        None,
                    )
                    .await;
                }
                Err(_) => {
                    tracing::warn!(provider = %slot.client.name(), "provider did not respond in time");
                    self.record(
                        guard,
                        started,
                        started_at,
                        AttemptOutcome::Timeout,
                        Some("timed out waiting for response".to_string()),
                        None,
                    )
                    .await;
                }
            }
        }
        false
    }

    fn on_delta(&mut self, content: String) {
        let streaming = self.request.streaming;
        let deadline = match self.active.as_ref() {
            Some(active) => self.cap(Instant::now() + active.budget),
            None => return,
        };
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if content.is_empty() {
            return;
        }
        if streaming {
            active.yielded = true;
            active.deadline = deadline;
            let provider = active.guard.slot.client.name().to_string();
            self.pending.push_back(Ok(ResponseEvent::Delta {
                provider,
                text: content,
            }));
        } else {
            active.buffered.push_str(&content);
        }
    }

    async fn fail_active(&mut self, outcome: AttemptOutcome, detail: String) {
        let Some(active) = self.active.take() else {
            return;
        };
        let ActiveAttempt {
            guard,
            stream,
            started,
            started_at,
            yielded,
            ..
        } = active;
        drop(stream);
        let provider = guard.slot.client.name().to_string();
        tracing::warn!(provider = %provider, %outcome, detail = %detail, "provider attempt failed");
        if yielded {
            self.pending
                .push_back(Ok(ResponseEvent::Discard { provider }));
        }
        self.record(guard, started, started_at, outcome, Some(detail), None)
            .await;
    }

    async fn succeed_active(&mut self, usage: Usage) {
        let Some(active) = self.active.take() else {
            return;
        };
        let ActiveAttempt {
            guard,
            stream,
            started,
            started_at,
            buffered,
            ..
        } = active;
        drop(stream);
        let provider = guard.slot.client.name().to_string();
        if !buffered.is_empty() {
            self.pending.push_back(Ok(ResponseEvent::Delta {
                provider: provider.clone(),
                text: buffered,
            }));
        }
        self.record(
            guard,
            started,
            started_at,
            AttemptOutcome::Success,
            None,
            Some(usage),
        )
        .await;
        tracing::info!(
            request_id = %self.request.id,
            provider = %provider,
            attempts = self.attempts.len(),
            "request answered"
        );
        self.pending
            .push_back(Ok(ResponseEvent::Completed(DispatchSummary {
                provider,
                usage,
                attempts: self.attempts.clone(),
            })));
        self.finished = true;
    }

    async fn record(
        &mut self,
        mut guard: AttemptGuard,
        started: Instant,
        started_at: DateTime<Utc>,
        outcome: AttemptOutcome,
        detail: Option<String>,
        usage: Option<Usage>,
    ) {
        let now = Utc::now();
        let provider = guard.slot.client.name().to_string();
        {
            let policy = &self.inner.policy;
            let mut health = guard.slot.health();
            let before = health.state(policy);
            if outcome == AttemptOutcome::Success {
                health.record_success(now);
            } else {
                health.record_failure(now);
            }
            let after = health.state(policy);
            if before != after {
                tracing::info!(
                    provider = %provider,
                    from = %before,
                    to = %after,
                    failures = health.consecutive_failures(),
                    "provider health changed"
                );
            }
        }
        guard.settled = true;

        let attempt = ProviderAttempt {
            request_id: self.request.id,
            requester: self.request.requester.clone(),
            provider,
            started_at,
            latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            outcome,
            detail,
            usage,
        };
        if let Err(err) = self.inner.audit.record_attempt(&attempt).await {
            tracing::warn!(error = %err, "audit sink rejected attempt");
        }
        self.attempts.push(attempt);
    }

    fn cap(&self, at: Instant) -> Instant {
        match self.request.deadline {
            Some(deadline) if deadline < at => deadline,
            _ => at,
        }
    }
}

fn classify(err: &LlmError) -> AttemptOutcome {
    match err {
        LlmError::Timeout(_) => AttemptOutcome::Timeout,
        LlmError::RateLimited(_) => AttemptOutcome::RateLimited,
        _ => AttemptOutcome::Error,
    }
}
