//! Delegated agent sessions, at most one live session per owner.

use crate::error::{AgentError, AgentFailureKind, SessionError};
use crate::ids::{OwnerId, SessionId};
use crate::rate_limit::to_chrono;
use crate::router::{LlmRequest, Router};
use crate::store::StoreWriter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// External coding/automation agent. Called at most once at a time per session.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run_task(&self, workspace: &str, instruction: &str) -> Result<String, AgentError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    Ended,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Ended => "ended",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub owner: OwnerId,
    pub workspace: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tasks_completed: u64,
    #[serde(default)]
    pub last_instruction: Option<String>,
    #[serde(default)]
    pub last_output: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Session {
    pub fn new(owner: OwnerId, workspace: String, now: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::new(),
            owner,
            workspace,
            state: SessionState::Idle,
            created_at: now,
            last_activity_at: now,
            ended_at: None,
            tasks_completed: 0,
            last_instruction: None,
            last_output: None,
            last_error: None,
        }
    }

    fn end(&mut self, now: DateTime<Utc>) {
        self.state = SessionState::Ended;
        self.ended_at = Some(now);
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub idle_timeout: Duration,
    pub task_timeout: Duration,
    pub default_workspace: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            task_timeout: Duration::from_secs(300),
            default_workspace: ".".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskOutput {
    pub session_id: SessionId,
    pub output: String,
    pub elapsed_ms: u64,
}

/// Completion signal for one submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    session_id: SessionId,
    rx: oneshot::Receiver<Result<TaskOutput, SessionError>>,
}

impl TaskHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub async fn wait(self) -> Result<TaskOutput, SessionError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(SessionError::AgentInvocationFailed {
                session_id: self.session_id,
                kind: AgentFailureKind::Internal,
                message: "task runner went away".to_string(),
            }),
        }
    }
}

struct SessionsInner {
    config: SessionConfig,
    idle_timeout: chrono::Duration,
    by_owner: DashMap<OwnerId, Session>,
    owner_of: DashMap<SessionId, OwnerId>,
    agent: Arc<dyn AgentRunner>,
    store: Option<StoreWriter>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionsInner>,
}

impl SessionManager {
    pub fn new(config: SessionConfig, agent: Arc<dyn AgentRunner>) -> Self {
        Self {
            inner: Arc::new(SessionsInner {
                idle_timeout: to_chrono(config.idle_timeout),
                config,
                by_owner: DashMap::new(),
                owner_of: DashMap::new(),
                agent,
                store: None,
            }),
        }
    }

    /// Must be called before the manager is cloned or shared.
    pub fn with_store(mut self, store: StoreWriter) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.store = Some(store);
        }
        self
    }

    /// Reloads persisted sessions after a restart. Ended sessions stay ended,
    /// running ones come back idle since their agent call did not survive, and
    /// only the newest live session per owner is kept.
    pub fn restore(&self, mut sessions: Vec<Session>) -> usize {
        sessions.sort_by_key(|s| s.created_at);
        let now = Utc::now();
        let mut restored = 0;
        for mut session in sessions.into_iter().rev() {
            if session.state == SessionState::Ended {
                continue;
            }
            if session.state == SessionState::Running {
                session.state = SessionState::Idle;
                session.last_error = Some("interrupted by restart".to_string());
            }
            match self.inner.by_owner.entry(session.owner.clone()) {
                Entry::Occupied(_) => {
                    session.end(now);
                    self.inner.persist(&session);
                }
                Entry::Vacant(slot) => {
                    self.inner.owner_of.insert(session.id, session.owner.clone());
                    slot.insert(session);
                    restored += 1;
                }
            }
        }
        restored
    }

    #[tracing::instrument(level = "debug", skip_all, fields(owner_id = %owner))]
    pub fn start(&self, owner: &OwnerId, workspace: Option<String>) -> Result<SessionId, SessionError> {
        let workspace = workspace
            .filter(|w| !w.trim().is_empty())
            .unwrap_or_else(|| self.inner.config.default_workspace.clone());
        let session = match self.inner.by_owner.entry(owner.clone()) {
            Entry::Occupied(existing) => {
                return Err(SessionError::SessionAlreadyActive {
                    session_id: existing.get().id,
                });
            }
            Entry::Vacant(slot) => {
                let session = Session::new(owner.clone(), workspace, Utc::now());
                slot.insert(session.clone());
                session
            }
        };
        self.inner.owner_of.insert(session.id, owner.clone());
        self.inner.persist(&session);
        tracing::info!(session_id = %session.id, workspace = %session.workspace, "session started");
        Ok(session.id)
    }

    /// Marks the session running and hands `instruction` to the agent on a
    /// separate task. The returned handle resolves when the agent finishes.
    #[tracing::instrument(level = "debug", skip_all, fields(session_id = %id))]
    pub fn submit(&self, id: SessionId, instruction: &str) -> Result<TaskHandle, SessionError> {
        let owner = self.owner_of(id)?;
        let snapshot = {
            let mut session = self
                .inner
                .by_owner
                .get_mut(&owner)
                .filter(|s| s.id == id)
                .ok_or_else(|| SessionError::missing(id))?;
            match session.state {
                SessionState::Running => return Err(SessionError::SessionBusy { session_id: id }),
                SessionState::Ended => return Err(SessionError::missing(id)),
                SessionState::Idle => {}
            }
            session.state = SessionState::Running;
            session.last_activity_at = Utc::now();
            session.last_instruction = Some(instruction.to_string());
            session.value().clone()
        };
        self.inner.persist(&snapshot);

        let (tx, rx) = oneshot::channel();
        let inner = self.inner.clone();
        let workspace = snapshot.workspace;
        let instruction = instruction.to_string();
        tokio::spawn(async move {
            let started = Instant::now();
            let agent = inner.agent.clone();
            let timeout = inner.config.task_timeout;
            let call = tokio::spawn(async move {
                tokio::time::timeout(timeout, agent.run_task(&workspace, &instruction)).await
            });
            let outcome = match call.await {
                Ok(Ok(Ok(output))) => Ok(output),
                Ok(Ok(Err(err))) => Err((err.kind(), err.to_string())),
                Ok(Err(_)) => Err((
                    AgentFailureKind::TimedOut,
                    format!("agent did not finish within {}s", timeout.as_secs()),
                )),
                Err(join) => Err((AgentFailureKind::Internal, format!("agent task aborted: {join}"))),
            };
            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            let reported = inner.finish_task(id, &owner, outcome, elapsed_ms);
            let _ = tx.send(reported);
        });

        Ok(TaskHandle { session_id: id, rx })
    }

    pub fn status(&self, id: SessionId) -> Result<Session, SessionError> {
        let owner = self.owner_of(id)?;
        self.inner
            .by_owner
            .get(&owner)
            .filter(|s| s.id == id)
            .map(|s| s.value().clone())
            .ok_or_else(|| SessionError::missing(id))
    }

    /// The owner's live session, if any.
    pub fn active_for(&self, owner: &OwnerId) -> Option<Session> {
        self.inner.by_owner.get(owner).map(|s| s.value().clone())
    }

    pub fn active_id(&self, owner: &OwnerId) -> Result<SessionId, SessionError> {
        self.inner
            .by_owner
            .get(owner)
            .map(|s| s.id)
            .ok_or_else(|| SessionError::no_active(owner))
    }

    /// Ends the session immediately. A task still running finishes in the
    /// background and its result is dropped.
    #[tracing::instrument(level = "debug", skip_all, fields(session_id = %id))]
    pub fn end(&self, id: SessionId) -> Result<Session, SessionError> {
        let owner = self.owner_of(id)?;
        let (_, mut session) = self
            .inner
            .by_owner
            .remove_if(&owner, |_, s| s.id == id)
            .ok_or_else(|| SessionError::missing(id))?;
        self.inner.owner_of.remove(&id);
        let was_running = session.state == SessionState::Running;
        session.end(Utc::now());
        self.inner.persist(&session);
        tracing::info!(owner_id = %owner, was_running, "session ended");
        Ok(session)
    }

    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .inner
            .by_owner
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub fn sweep_idle(&self) -> Vec<SessionId> {
        self.sweep_idle_at(Utc::now())
    }

    /// Ends idle sessions with no activity for the idle timeout. Running
    /// sessions are never swept.
    pub fn sweep_idle_at(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let timeout = self.inner.idle_timeout;
        let is_stale =
            |s: &Session| s.state == SessionState::Idle && now - s.last_activity_at >= timeout;
        let candidates: Vec<OwnerId> = self
            .inner
            .by_owner
            .iter()
            .filter(|entry| is_stale(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut swept = Vec::new();
        for owner in candidates {
            let Some((_, mut session)) = self.inner.by_owner.remove_if(&owner, |_, s| is_stale(s))
            else {
                continue;
            };
            self.inner.owner_of.remove(&session.id);
            session.end(now);
            self.inner.persist(&session);
            tracing::info!(session_id = %session.id, owner_id = %owner, "idle session ended");
            swept.push(session.id);
        }
        swept
    }

    /// Asks the router for a short plain-language summary of the session's
    /// last result.
    pub async fn summarize(&self, id: SessionId, router: &Router) -> Result<String, SessionError> {
        let session = self.status(id)?;
        let Some(output) = session.last_output.as_deref().or(session.last_error.as_deref()) else {
            return Ok(format!(
                "Session {} is {} and has not run a task yet.",
                session.id,
                session.state.as_str()
            ));
        };
        let prompt = format!(
            "Summarize the result of this agent task in two or three sentences.\n\
             Task: {}\n\nResult:\n{}",
            session.last_instruction.as_deref().unwrap_or("(unknown)"),
            truncate(output, 4000)
        );
        let completion = router
            .complete(LlmRequest::new(session.owner.clone(), prompt))
            .await?;
        Ok(completion.text)
    }

    fn owner_of(&self, id: SessionId) -> Result<OwnerId, SessionError> {
        self.inner
            .owner_of
            .get(&id)
            .map(|o| o.value().clone())
            .ok_or_else(|| SessionError::missing(id))
    }
}

impl SessionsInner {
    fn persist(&self, session: &Session) {
        if let Some(store) = &self.store {
            store.save_session(session.clone());
        }
    }

    fn finish_task(
        &self,
        id: SessionId,
        owner: &OwnerId,
        outcome: Result<String, (AgentFailureKind, String)>,
        elapsed_ms: u64,
    ) -> Result<TaskOutput, SessionError> {
        let snapshot = {
            let Some(mut session) = self.by_owner.get_mut(owner).filter(|s| s.id == id) else {
                tracing::info!(session_id = %id, "discarding result for ended session");
                return Err(SessionError::missing(id));
            };
            session.state = SessionState::Idle;
            session.last_activity_at = Utc::now();
            match &outcome {
                Ok(output) => {
                    session.tasks_completed += 1;
                    session.last_output = Some(output.clone());
                    session.last_error = None;
                }
                Err((_, message)) => session.last_error = Some(message.clone()),
            }
            session.value().clone()
        };
        self.persist(&snapshot);

        match outcome {
            Ok(output) => {
                tracing::info!(session_id = %id, elapsed_ms, "task finished");
                Ok(TaskOutput {
                    session_id: id,
                    output,
                    elapsed_ms,
                })
            }
            Err((kind, message)) => {
                tracing::warn!(session_id = %id, %kind, error = %message, "task failed");
                Err(SessionError::AgentInvocationFailed {
                    session_id: id,
                    kind,
                    message,
                })
            }
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct FakeAgent {
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
        result: Mutex<Result<String, AgentError>>,
    }

    impl FakeAgent {
        fn ok(output: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: None,
                result: Mutex::new(Ok(output.to_string())),
            })
        }

        fn gated(gate: Arc<Notify>, output: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Some(gate),
                result: Mutex::new(Ok(output.to_string())),
            })
        }

        fn failing(err: AgentError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: None,
                result: Mutex::new(Err(err)),
            })
        }
    }

    #[async_trait]
    impl AgentRunner for FakeAgent {
        async fn run_task(&self, _workspace: &str, instruction: &str) -> Result<String, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.result
                .lock()
                .expect("result")
                .clone()
                .map(|out| format!("{out}: {instruction}"))
        }
    }

    fn manager(agent: Arc<dyn AgentRunner>) -> SessionManager {
        SessionManager::new(SessionConfig::default(), agent)
    }

    #[tokio::test]
    async fn second_start_fails_until_first_ends() {
        let sessions = manager(FakeAgent::ok("done"));
        let owner = OwnerId::new("alice");
        let first = sessions.start(&owner, None).expect("start");

        let err = sessions.start(&owner, None).expect_err("second start");
        assert!(matches!(err, SessionError::SessionAlreadyActive { session_id } if session_id == first));

        sessions.end(first).expect("end");
        let second = sessions.start(&owner, None).expect("restart");
        assert_ne!(first, second);
        assert!(matches!(sessions.status(first), Err(SessionError::SessionNotFound(_))));
        assert!(matches!(sessions.submit(first, "x"), Err(SessionError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn submit_while_running_is_busy_and_agent_called_once() {
        let gate = Arc::new(Notify::new());
        let agent = FakeAgent::gated(gate.clone(), "built");
        let sessions = manager(agent.clone());
        let id = sessions.start(&OwnerId::new("bob"), None).expect("start");

        let handle = sessions.submit(id, "make").expect("submit");
        assert_eq!(sessions.status(id).expect("status").state, SessionState::Running);
        assert!(matches!(
            sessions.submit(id, "again"),
            Err(SessionError::SessionBusy { .. })
        ));

        gate.notify_one();
        let out = handle.wait().await.expect("task");
        assert_eq!(out.output, "built: make");
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);

        let session = sessions.status(id).expect("status");
        assert_eq!(session.state, SessionState::Idle);
        assert_eq!(session.tasks_completed, 1);
    }

    #[tokio::test]
    async fn agent_failure_returns_session_to_idle() {
        let sessions = manager(FakeAgent::failing(AgentError::Unreachable("refused".into())));
        let id = sessions.start(&OwnerId::new("carol"), None).expect("start");

        let err = sessions
            .submit(id, "deploy")
            .expect("submit")
            .wait()
            .await
            .expect_err("agent failure");
        assert!(matches!(
            err,
            SessionError::AgentInvocationFailed {
                kind: AgentFailureKind::Unreachable,
                ..
            }
        ));
        let session = sessions.status(id).expect("status");
        assert_eq!(session.state, SessionState::Idle);
        assert!(session.last_error.is_some());
        sessions.submit(id, "retry").expect("retry accepted");
    }

    #[tokio::test]
    async fn agent_timeout_is_reported_as_timed_out() {
        let gate = Arc::new(Notify::new());
        let config = SessionConfig {
            task_timeout: Duration::from_millis(30),
            ..SessionConfig::default()
        };
        let sessions = SessionManager::new(config, FakeAgent::gated(gate, "never"));
        let id = sessions.start(&OwnerId::new("dan"), None).expect("start");
        let err = sessions
            .submit(id, "hang")
            .expect("submit")
            .wait()
            .await
            .expect_err("timeout");
        assert!(matches!(
            err,
            SessionError::AgentInvocationFailed {
                kind: AgentFailureKind::TimedOut,
                ..
            }
        ));
        assert_eq!(sessions.status(id).expect("status").state, SessionState::Idle);
    }

    #[tokio::test]
    async fn ending_a_running_session_discards_its_result() {
        let gate = Arc::new(Notify::new());
        let sessions = manager(FakeAgent::gated(gate.clone(), "late"));
        let owner = OwnerId::new("erin");
        let id = sessions.start(&owner, None).expect("start");
        let handle = sessions.submit(id, "long job").expect("submit");

        let ended = sessions.end(id).expect("end");
        assert_eq!(ended.state, SessionState::Ended);
        gate.notify_one();
        assert!(handle.wait().await.is_err());
        assert!(sessions.active_for(&owner).is_none());
    }

    #[tokio::test]
    async fn sweep_ends_only_stale_idle_sessions() {
        let gate = Arc::new(Notify::new());
        let sessions = manager(FakeAgent::gated(gate.clone(), "ok"));
        let idle = sessions.start(&OwnerId::new("idle"), None).expect("start");
        let busy = sessions.start(&OwnerId::new("busy"), None).expect("start");
        let handle = sessions.submit(busy, "work").expect("submit");

        let soon = Utc::now() + chrono::Duration::minutes(29);
        assert!(sessions.sweep_idle_at(soon).is_empty());

        let later = Utc::now() + chrono::Duration::minutes(31);
        assert_eq!(sessions.sweep_idle_at(later), vec![idle]);
        assert!(sessions.active_for(&OwnerId::new("idle")).is_none());
        assert_eq!(sessions.status(busy).expect("busy").state, SessionState::Running);

        gate.notify_one();
        handle.wait().await.expect("task");
        sessions.start(&OwnerId::new("idle"), None).expect("slot released");
    }

    #[tokio::test]
    async fn sessions_of_different_owners_run_concurrently() {
        let gate = Arc::new(Notify::new());
        let agent = FakeAgent::gated(gate.clone(), "ok");
        let sessions = manager(agent.clone());
        let a = sessions.start(&OwnerId::new("a"), None).expect("start");
        let b = sessions.start(&OwnerId::new("b"), None).expect("start");
        let ha = sessions.submit(a, "one").expect("submit a");
        let hb = sessions.submit(b, "two").expect("submit b");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(agent.calls.load(Ordering::SeqCst), 2);
        gate.notify_waiters();
        ha.wait().await.expect("a");
        hb.wait().await.expect("b");
    }

    #[tokio::test]
    async fn restore_keeps_newest_live_session_per_owner() {
        let sessions = manager(FakeAgent::ok("ok"));
        let owner = OwnerId::new("frank");
        let t0 = Utc::now() - chrono::Duration::hours(2);
        let old = Session::new(owner.clone(), "a".into(), t0);
        let mut newer = Session::new(owner.clone(), "b".into(), t0 + chrono::Duration::hours(1));
        newer.state = SessionState::Running;
        let mut gone = Session::new(OwnerId::new("gina"), "c".into(), t0);
        gone.end(t0);

        let restored = sessions.restore(vec![old.clone(), newer.clone(), gone]);
        assert_eq!(restored, 1);
        let live = sessions.active_for(&owner).expect("live");
        assert_eq!(live.id, newer.id);
        assert_eq!(live.state, SessionState::Idle);
        assert!(sessions.status(old.id).is_err());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
