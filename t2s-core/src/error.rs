use crate::audit::ProviderAttempt;
use crate::ids::{OwnerId, SessionId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RouterError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no provider could answer ({})", summarize_attempts(.attempts))]
    ProviderUnavailable { attempts: Vec<ProviderAttempt> },
}

fn summarize_attempts(attempts: &[ProviderAttempt]) -> String {
    if attempts.is_empty() {
        return "no provider eligible".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("{}={}", a.provider, a.outcome))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Why an agent invocation did not produce a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentFailureKind {
    Internal,
    Unreachable,
    TimedOut,
}

impl fmt::Display for AgentFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Internal => "internal",
            Self::Unreachable => "unreachable",
            Self::TimedOut => "timed_out",
        })
    }
}

/// Error reported by an [`crate::session::AgentRunner`].
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("agent failed: {0}")]
    Internal(String),

    #[error("agent unreachable: {0}")]
    Unreachable(String),
}

impl AgentError {
    pub fn kind(&self) -> AgentFailureKind {
        match self {
            Self::Internal(_) => AgentFailureKind::Internal,
            Self::Unreachable(_) => AgentFailureKind::Unreachable,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("owner already has active session {session_id}")]
    SessionAlreadyActive { session_id: SessionId },

    #[error("session {session_id} is running a task")]
    SessionBusy { session_id: SessionId },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("agent invocation failed for session {session_id} ({kind}): {message}")]
    AgentInvocationFailed {
        session_id: SessionId,
        kind: AgentFailureKind,
        message: String,
    },

    #[error("status query failed: {0}")]
    StatusQuery(#[from] RouterError),
}

impl SessionError {
    pub(crate) fn missing(id: SessionId) -> Self {
        Self::SessionNotFound(id.to_string())
    }

    pub(crate) fn no_active(owner: &OwnerId) -> Self {
        Self::SessionNotFound(format!("no active session for {owner}"))
    }
}

#[derive(Debug, Clone, Error)]
pub enum SamplerError {
    #[error("metric sampler unavailable: {0}")]
    SamplerUnavailable(String),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("user {owner} is not authorized")]
    Unauthorized { owner: OwnerId },

    #[error("rate limit exceeded for {owner}; retry in {}s", .retry_after.as_secs())]
    RateLimitExceeded { owner: OwnerId, retry_after: Duration },

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_attempt_list_reads_as_nothing_eligible() {
        let err = RouterError::ProviderUnavailable { attempts: vec![] };
        assert!(err.to_string().contains("no provider eligible"));
    }

    #[test]
    fn agent_error_kinds() {
        assert_eq!(
            AgentError::Unreachable("down".into()).kind(),
            AgentFailureKind::Unreachable
        );
        assert_eq!(
            AgentError::Internal("boom".into()).kind(),
            AgentFailureKind::Internal
        );
    }
}
