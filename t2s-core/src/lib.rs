//! Request-orchestration and alerting core for t2s.
//!
//! All mutable state (provider health, rate buckets, sessions, alert rules) is
//! owned by the values constructed here and passed explicitly; nothing is
//! global. Collaborators (providers, agent, sampler, notifier, store) are
//! injected as trait objects.

pub mod alerts;
pub mod audit;
pub mod error;
pub mod ids;
pub mod orchestrator;
pub mod rate_limit;
pub mod router;
pub mod session;
pub mod store;

pub use alerts::{
    AlertEngine, AlertEvent, AlertKind, AlertMonitor, AlertNotifier, AlertRule, Comparator,
    MetricSample, MetricSampler, MonitorConfig, MonitorStatus, RuleStateRecord, Severity,
};
pub use audit::{AttemptOutcome, AuditLog, AuditSink, ProviderAttempt, ProviderUsage, UsageStats};
pub use error::{
    AgentError, AgentFailureKind, OrchestratorError, RouterError, SamplerError, SessionError,
};
pub use ids::{OwnerId, SessionId};
pub use orchestrator::{Command, Inbound, Orchestrator, OrchestratorConfig, Reply, UsageReport};
pub use rate_limit::{RateDecision, RateLimitConfig, RateLimiter};
pub use router::{
    Completion, DispatchSummary, HealthState, LlmRequest, ProviderStatus, ResponseEvent,
    ResponseStream, Router, RouterConfig, collect_completion,
};
pub use session::{
    AgentRunner, Session, SessionConfig, SessionManager, SessionState, TaskHandle, TaskOutput,
};
pub use store::{MemoryStore, Store, StoreOp, StoreWriter};
