//! Persistence boundary. The core only ever writes through [`StoreWriter`],
//! so a slow or failing backend never sits on a request path.

use crate::alerts::{AlertEvent, RuleStateRecord};
use crate::audit::ProviderAttempt;
use crate::ids::SessionId;
use crate::session::Session;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Store: Send + Sync {
    async fn load_sessions(&self) -> anyhow::Result<Vec<Session>>;
    async fn save_session(&self, session: &Session) -> anyhow::Result<()>;
    async fn load_rule_state(&self) -> anyhow::Result<Vec<RuleStateRecord>>;
    async fn save_rule_state(&self, state: &RuleStateRecord) -> anyhow::Result<()>;
    async fn append_attempt(&self, attempt: &ProviderAttempt) -> anyhow::Result<()>;
    /// The newest `limit` attempts, oldest first.
    async fn load_recent_attempts(&self, limit: usize) -> anyhow::Result<Vec<ProviderAttempt>>;
    async fn append_alert(&self, event: &AlertEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub enum StoreOp {
    SaveSession(Session),
    SaveRuleState(RuleStateRecord),
    AppendAttempt(ProviderAttempt),
    AppendAlert(AlertEvent),
}

impl StoreOp {
    fn label(&self) -> &'static str {
        match self {
            Self::SaveSession(_) => "save_session",
            Self::SaveRuleState(_) => "save_rule_state",
            Self::AppendAttempt(_) => "append_attempt",
            Self::AppendAlert(_) => "append_alert",
        }
    }

    async fn apply(self, store: &dyn Store) -> anyhow::Result<()> {
        match self {
            Self::SaveSession(session) => store.save_session(&session).await,
            Self::SaveRuleState(state) => store.save_rule_state(&state).await,
            Self::AppendAttempt(attempt) => store.append_attempt(&attempt).await,
            Self::AppendAlert(event) => store.append_alert(&event).await,
        }
    }
}

/// Write-behind handle. Sends never block; when the queue is full the write
/// is dropped with a warning.
#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::Sender<StoreOp>,
}

impl StoreWriter {
    /// Spawns the task that applies queued writes in order. On cancellation it
    /// stops accepting new writes and drains what is already queued.
    pub fn spawn(
        store: Arc<dyn Store>,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<StoreOp>(capacity.max(1));
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        rx.close();
                        while let Some(op) = rx.recv().await {
                            apply_logged(store.as_ref(), op).await;
                        }
                        break;
                    }
                    op = rx.recv() => {
                        let Some(op) = op else { break };
                        apply_logged(store.as_ref(), op).await;
                    }
                }
            }
            tracing::debug!("store writer stopped");
        });
        (Self { tx }, handle)
    }

    pub fn submit(&self, op: StoreOp) {
        let label = op.label();
        if let Err(err) = self.tx.try_send(op) {
            tracing::warn!(op = label, error = %err, "dropping store write");
        }
    }

    pub fn save_session(&self, session: Session) {
        self.submit(StoreOp::SaveSession(session));
    }

    pub fn save_rule_state(&self, state: RuleStateRecord) {
        self.submit(StoreOp::SaveRuleState(state));
    }

    pub fn append_attempt(&self, attempt: ProviderAttempt) {
        self.submit(StoreOp::AppendAttempt(attempt));
    }

    pub fn append_alert(&self, event: AlertEvent) {
        self.submit(StoreOp::AppendAlert(event));
    }
}

async fn apply_logged(store: &dyn Store, op: StoreOp) {
    let label = op.label();
    if let Err(err) = op.apply(store).await {
        tracing::warn!(op = label, error = %err, "store write failed");
    }
}

/// In-process store used by tests and when no database is configured.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<SessionId, Session>>,
    rules: Mutex<HashMap<String, RuleStateRecord>>,
    attempts: Mutex<Vec<ProviderAttempt>>,
    alerts: Mutex<Vec<AlertEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> Vec<ProviderAttempt> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn alerts(&self) -> Vec<AlertEvent> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_sessions(&self) -> anyhow::Result<Vec<Session>> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<Session> = sessions.values().cloned().collect();
        out.sort_by_key(|s| s.created_at);
        Ok(out)
    }

    async fn save_session(&self, session: &Session) -> anyhow::Result<()> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn load_rule_state(&self) -> anyhow::Result<Vec<RuleStateRecord>> {
        let rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<RuleStateRecord> = rules.values().cloned().collect();
        out.sort_by(|a, b| a.rule.cmp(&b.rule));
        Ok(out)
    }

    async fn save_rule_state(&self, state: &RuleStateRecord) -> anyhow::Result<()> {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(state.rule.clone(), state.clone());
        Ok(())
    }

    async fn append_attempt(&self, attempt: &ProviderAttempt) -> anyhow::Result<()> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(attempt.clone());
        Ok(())
    }

    async fn load_recent_attempts(&self, limit: usize) -> anyhow::Result<Vec<ProviderAttempt>> {
        let attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = attempts.len().saturating_sub(limit);
        Ok(attempts[skip..].to_vec())
    }

    async fn append_alert(&self, event: &AlertEvent) -> anyhow::Result<()> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}
