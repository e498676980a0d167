//! Single entry point for the message transport: authorization, admission
//! control, then routing to the router or the session manager.

use crate::audit::{AuditLog, UsageStats};
use crate::error::{OrchestratorError, SessionError};
use crate::ids::{OwnerId, SessionId};
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::router::{LlmRequest, ProviderStatus, ResponseStream, Router};
use crate::session::{Session, SessionManager, TaskHandle};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use t2s_llm::{ChatMessage, Role};

#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    /// Owners allowed to talk to the assistant. Empty means nobody.
    pub allowed_users: Vec<OwnerId>,
    pub system_prompt: Option<String>,
    /// Overall limit for one chat request across all fallback attempts.
    pub request_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub enum Command {
    Chat {
        text: String,
        context: Vec<ChatMessage>,
        streaming: bool,
    },
    StartSession {
        workspace: Option<String>,
    },
    /// `session: None` targets the owner's live session.
    SubmitTask {
        session: Option<SessionId>,
        instruction: String,
    },
    SessionStatus {
        session: Option<SessionId>,
    },
    EndSession {
        session: Option<SessionId>,
    },
    SummarizeSession {
        session: Option<SessionId>,
    },
    ProviderStatus,
    UsageStats,
}

#[derive(Debug, Clone)]
pub struct Inbound {
    pub owner: OwnerId,
    pub command: Command,
}

impl Inbound {
    pub fn new(owner: impl Into<OwnerId>, command: Command) -> Self {
        Self {
            owner: owner.into(),
            command,
        }
    }

    pub fn chat(owner: impl Into<OwnerId>, text: impl Into<String>, context: Vec<ChatMessage>) -> Self {
        Self::new(
            owner,
            Command::Chat {
                text: text.into(),
                context,
                streaming: false,
            },
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub stats: UsageStats,
    /// Requests the caller may still make in the current window.
    pub remaining: u32,
}

pub enum Reply {
    Stream(ResponseStream),
    SessionStarted(SessionId),
    TaskAccepted(TaskHandle),
    Session(Session),
    SessionEnded(Session),
    Summary(String),
    Providers(Vec<ProviderStatus>),
    Usage(UsageReport),
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream(_) => f.write_str("Stream(..)"),
            Self::SessionStarted(id) => f.debug_tuple("SessionStarted").field(id).finish(),
            Self::TaskAccepted(handle) => f.debug_tuple("TaskAccepted").field(handle).finish(),
            Self::Session(s) => f.debug_tuple("Session").field(s).finish(),
            Self::SessionEnded(s) => f.debug_tuple("SessionEnded").field(s).finish(),
            Self::Summary(s) => f.debug_tuple("Summary").field(s).finish(),
            Self::Providers(p) => f.debug_tuple("Providers").field(p).finish(),
            Self::Usage(u) => f.debug_tuple("Usage").field(u).finish(),
        }
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    allowed: HashSet<OwnerId>,
    limiter: Arc<RateLimiter>,
    router: Router,
    sessions: SessionManager,
    audit: Arc<AuditLog>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        limiter: Arc<RateLimiter>,
        router: Router,
        sessions: SessionManager,
        audit: Arc<AuditLog>,
    ) -> Self {
        let allowed = config.allowed_users.iter().cloned().collect();
        Self {
            config,
            allowed,
            limiter,
            router,
            sessions,
            audit,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn is_authorized(&self, owner: &OwnerId) -> bool {
        self.allowed.contains(owner)
    }

    fn admit(&self, owner: &OwnerId) -> Result<(), OrchestratorError> {
        if !self.is_authorized(owner) {
            tracing::warn!(owner_id = %owner, "unauthorized request");
            return Err(OrchestratorError::Unauthorized {
                owner: owner.clone(),
            });
        }
        match self.limiter.check(owner) {
            RateDecision::Allowed { .. } => Ok(()),
            RateDecision::Denied { retry_after } => Err(OrchestratorError::RateLimitExceeded {
                owner: owner.clone(),
                retry_after,
            }),
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(owner_id = %inbound.owner))]
    pub async fn handle(&self, inbound: Inbound) -> Result<Reply, OrchestratorError> {
        let Inbound { owner, command } = inbound;
        self.admit(&owner)?;

        match command {
            Command::Chat {
                text,
                context,
                streaming,
            } => {
                let mut request = LlmRequest::new(owner, text)
                    .with_context(self.with_system_prompt(context))
                    .streaming(streaming);
                if let Some(timeout) = self.config.request_timeout {
                    request = request.with_timeout(timeout);
                }
                Ok(Reply::Stream(self.router.dispatch(request)?))
            }
            Command::StartSession { workspace } => {
                Ok(Reply::SessionStarted(self.sessions.start(&owner, workspace)?))
            }
            Command::SubmitTask {
                session,
                instruction,
            } => {
                let id = self.resolve_session(&owner, session)?;
                Ok(Reply::TaskAccepted(self.sessions.submit(id, &instruction)?))
            }
            Command::SessionStatus { session } => {
                let id = self.resolve_session(&owner, session)?;
                Ok(Reply::Session(self.sessions.status(id)?))
            }
            Command::EndSession { session } => {
                let id = self.resolve_session(&owner, session)?;
                Ok(Reply::SessionEnded(self.sessions.end(id)?))
            }
            Command::SummarizeSession { session } => {
                let id = self.resolve_session(&owner, session)?;
                Ok(Reply::Summary(self.sessions.summarize(id, &self.router).await?))
            }
            Command::ProviderStatus => Ok(Reply::Providers(self.router.snapshot())),
            Command::UsageStats => Ok(Reply::Usage(UsageReport {
                stats: self.audit.stats_for(&owner),
                remaining: self.limiter.remaining(&owner),
            })),
        }
    }

    /// Sessions are only visible to their owner; anyone else sees "not found".
    fn resolve_session(
        &self,
        owner: &OwnerId,
        session: Option<SessionId>,
    ) -> Result<SessionId, SessionError> {
        let Some(id) = session else {
            return self.sessions.active_id(owner);
        };
        match self.sessions.status(id) {
            Ok(found) if &found.owner == owner => Ok(id),
            _ => Err(SessionError::missing(id)),
        }
    }

    fn with_system_prompt(&self, mut context: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let has_system = context.first().is_some_and(|m| m.role == Role::System);
        if let Some(prompt) = self.config.system_prompt.as_deref().filter(|p| !p.is_empty()) {
            if !has_system {
                context.insert(0, ChatMessage::system(prompt));
            }
        }
        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AgentError, RouterError};
    use crate::rate_limit::RateLimitConfig;
    use crate::router::{ResponseEvent, RouterConfig};
    use crate::session::{AgentRunner, SessionConfig};
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use std::sync::Mutex;
    use t2s_llm::{ChunkStream, ProviderClient, Usage, once};

    #[derive(Default)]
    struct Echo {
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    #[async_trait]
    impl ProviderClient for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn complete(
            &self,
            prompt: &str,
            context: &[ChatMessage],
            _streaming: bool,
        ) -> t2s_llm::Result<ChunkStream> {
            self.seen.lock().expect("seen").push(context.to_vec());
            Ok(once(
                format!("echo: {prompt}"),
                Usage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                },
            ))
        }
    }

    struct Agent;

    #[async_trait]
    impl AgentRunner for Agent {
        async fn run_task(&self, workspace: &str, instruction: &str) -> Result<String, AgentError> {
            Ok(format!("{workspace}: {instruction}"))
        }
    }

    fn orchestrator(limit: u32, system_prompt: Option<&str>) -> (Orchestrator, Arc<Echo>) {
        let echo = Arc::new(Echo::default());
        let audit = Arc::new(AuditLog::new(100));
        let router = Router::new(
            RouterConfig::default(),
            vec![echo.clone() as Arc<dyn ProviderClient>],
            audit.clone(),
        );
        let sessions = SessionManager::new(SessionConfig::default(), Arc::new(Agent));
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            limit,
            window: Duration::from_secs(60),
        }));
        let config = OrchestratorConfig {
            allowed_users: vec![OwnerId::new("alice"), OwnerId::new("bob")],
            system_prompt: system_prompt.map(str::to_string),
            request_timeout: None,
        };
        (
            Orchestrator::new(config, limiter, router, sessions, audit),
            echo,
        )
    }

    async fn chat_text(orch: &Orchestrator, owner: &str, text: &str) -> Result<String, OrchestratorError> {
        chat_with_context(orch, owner, text, vec![]).await
    }

    async fn chat_with_context(
        orch: &Orchestrator,
        owner: &str,
        text: &str,
        context: Vec<ChatMessage>,
    ) -> Result<String, OrchestratorError> {
        let Reply::Stream(mut stream) = orch.handle(Inbound::chat(owner, text, context)).await? else {
            panic!("chat must stream");
        };
        let mut out = String::new();
        while let Some(event) = stream.next().await {
            if let ResponseEvent::Delta { text, .. } = event? {
                out.push_str(&text);
            }
        }
        Ok(out)
    }

    #[tokio::test]
    async fn chat_is_routed_to_provider() {
        let (orch, _) = orchestrator(10, None);
        assert_eq!(chat_text(&orch, "alice", "ping").await.expect("chat"), "echo: ping");
    }

    #[tokio::test]
    async fn unknown_owner_is_rejected_before_admission() {
        let (orch, echo) = orchestrator(10, None);
        let err = chat_text(&orch, "mallory", "hi").await.expect_err("denied");
        assert!(matches!(err, OrchestratorError::Unauthorized { .. }));
        assert_eq!(orch.limiter().tracked_owners(), 0);
        assert!(echo.seen.lock().expect("seen").is_empty());
    }

    #[tokio::test]
    async fn rate_limited_requests_never_reach_a_provider() {
        let (orch, echo) = orchestrator(2, None);
        chat_text(&orch, "alice", "1").await.expect("first");
        chat_text(&orch, "alice", "2").await.expect("second");
        let err = chat_text(&orch, "alice", "3").await.expect_err("third");
        assert!(matches!(
            err,
            OrchestratorError::RateLimitExceeded { retry_after, .. } if retry_after <= Duration::from_secs(60)
        ));
        assert_eq!(echo.seen.lock().expect("seen").len(), 2);
        chat_text(&orch, "bob", "hi").await.expect("other owner unaffected");
    }

    #[tokio::test]
    async fn system_prompt_is_prepended_once() {
        let (orch, echo) = orchestrator(10, Some("be brief"));
        chat_text(&orch, "alice", "hi").await.expect("chat");
        let reply = chat_with_context(
            &orch,
            "alice",
            "again",
            vec![ChatMessage::system("custom"), ChatMessage::user("earlier")],
        )
        .await
        .expect("chat");
        assert_eq!(reply, "echo: again");

        let seen = echo.seen.lock().expect("seen");
        assert_eq!(seen[0], vec![ChatMessage::system("be brief")]);
        assert_eq!(seen[1][0], ChatMessage::system("custom"));
        assert_eq!(seen[1].len(), 2);
    }

    #[tokio::test]
    async fn session_lifecycle_through_the_facade() {
        let (orch, _) = orchestrator(20, None);
        let Reply::SessionStarted(id) = orch
            .handle(Inbound::new(
                "alice",
                Command::StartSession {
                    workspace: Some("/srv/app".into()),
                },
            ))
            .await
            .expect("start")
        else {
            panic!("expected SessionStarted");
        };

        let Reply::TaskAccepted(handle) = orch
            .handle(Inbound::new(
                "alice",
                Command::SubmitTask {
                    session: None,
                    instruction: "run tests".into(),
                },
            ))
            .await
            .expect("submit")
        else {
            panic!("expected TaskAccepted");
        };
        assert_eq!(handle.wait().await.expect("task").output, "/srv/app: run tests");

        let err = orch
            .handle(Inbound::new("bob", Command::SessionStatus { session: Some(id) }))
            .await
            .expect_err("foreign session");
        assert!(matches!(err, OrchestratorError::Session(SessionError::SessionNotFound(_))));

        let Reply::SessionEnded(ended) = orch
            .handle(Inbound::new("alice", Command::EndSession { session: None }))
            .await
            .expect("end")
        else {
            panic!("expected SessionEnded");
        };
        assert_eq!(ended.id, id);
        assert_eq!(ended.tasks_completed, 1);
    }

    #[tokio::test]
    async fn summarize_uses_the_router() {
        let (orch, echo) = orchestrator(20, None);
        orch.handle(Inbound::new("alice", Command::StartSession { workspace: None }))
            .await
            .expect("start");
        let Reply::TaskAccepted(handle) = orch
            .handle(Inbound::new(
                "alice",
                Command::SubmitTask {
                    session: None,
                    instruction: "deploy".into(),
                },
            ))
            .await
            .expect("submit")
        else {
            panic!("expected TaskAccepted");
        };
        handle.wait().await.expect("task");

        let Reply::Summary(summary) = orch
            .handle(Inbound::new("alice", Command::SummarizeSession { session: None }))
            .await
            .expect("summary")
        else {
            panic!("expected Summary");
        };
        assert!(summary.starts_with("echo: Summarize"));
        assert_eq!(echo.seen.lock().expect("seen").len(), 1);
    }

    #[tokio::test]
    async fn submit_without_session_is_not_found() {
        let (orch, _) = orchestrator(20, None);
        let err = orch
            .handle(Inbound::new(
                "alice",
                Command::SubmitTask {
                    session: None,
                    instruction: "x".into(),
                },
            ))
            .await
            .expect_err("no session");
        assert!(matches!(err, OrchestratorError::Session(SessionError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn empty_chat_is_an_invalid_request() {
        let (orch, _) = orchestrator(20, None);
        let err = chat_text(&orch, "alice", "   ").await.expect_err("empty");
        assert!(matches!(err, OrchestratorError::Router(RouterError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn usage_reports_remaining_quota() {
        let (orch, _) = orchestrator(5, None);
        chat_text(&orch, "alice", "hi").await.expect("chat");
        let Reply::Usage(report) = orch
            .handle(Inbound::new("alice", Command::UsageStats))
            .await
            .expect("usage")
        else {
            panic!("expected Usage");
        };
        assert_eq!(report.remaining, 3);
        assert_eq!(report.stats.requests, 1);
        let echo = report.stats.providers.get("echo").expect("echo");
        assert_eq!(echo.prompt_tokens, 10);
        assert_eq!(echo.completion_tokens, 5);
    }

    #[tokio::test]
    async fn usage_never_shows_other_requesters() {
        let (orch, _) = orchestrator(5, None);
        chat_text(&orch, "alice", "hi").await.expect("chat");
        let Reply::Usage(report) = orch
            .handle(Inbound::new("bob", Command::UsageStats))
            .await
            .expect("usage")
        else {
            panic!("expected Usage");
        };
        assert_eq!(report.remaining, 5);
        assert_eq!(report.stats, UsageStats::default());
        let json = serde_json::to_string(&report.stats).expect("json");
        assert!(!json.contains("alice"));
    }
}
