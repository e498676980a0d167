use crate::ids::OwnerId;
use crate::store::StoreWriter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use t2s_llm::Usage;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Timeout,
    RateLimited,
    Error,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Error => "error",
        })
    }
}

impl FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "timeout" => Ok(Self::Timeout),
            "rate_limited" => Ok(Self::RateLimited),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown attempt outcome {other:?}")),
        }
    }
}

/// One try of one provider for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderAttempt {
    pub request_id: Uuid,
    pub requester: OwnerId,
    pub provider: String,
    pub started_at: DateTime<Utc>,
    pub latency_ms: u64,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Token counts reported by the provider; only set on the answering attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_attempt(&self, attempt: &ProviderAttempt) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub attempts: u64,
    pub successes: u64,
    pub timeouts: u64,
    pub rate_limited: u64,
    pub errors: u64,
    pub mean_latency_ms: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// One requester's view of the retained attempt history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    /// Attempts by this requester still held in the ring.
    pub window: usize,
    /// Distinct requests behind those attempts.
    pub requests: u64,
    pub providers: BTreeMap<String, ProviderUsage>,
}

/// Bounded in-memory attempt history, optionally mirrored to the store.
pub struct AuditLog {
    capacity: usize,
    entries: Mutex<VecDeque<ProviderAttempt>>,
    store: Option<StoreWriter>,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
            store: None,
        }
    }

    pub fn with_store(mut self, store: StoreWriter) -> Self {
        self.store = Some(store);
        self
    }

    pub fn push(&self, attempt: ProviderAttempt) {
        if let Some(store) = &self.store {
            store.append_attempt(attempt.clone());
        }
        self.insert(attempt);
    }

    /// Seeds the ring from persisted history without writing it back.
    pub fn restore(&self, attempts: Vec<ProviderAttempt>) -> usize {
        let count = attempts.len();
        for attempt in attempts {
            self.insert(attempt);
        }
        count
    }

    fn insert(&self, attempt: ProviderAttempt) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(attempt);
    }

    /// Most recent attempts, newest last.
    pub fn recent(&self, limit: usize) -> Vec<ProviderAttempt> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn for_request(&self, request_id: Uuid) -> Vec<ProviderAttempt> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .filter(|a| a.request_id == request_id)
            .cloned()
            .collect()
    }

    /// Aggregates only the attempts made on behalf of `owner`.
    pub fn stats_for(&self, owner: &OwnerId) -> UsageStats {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut providers: BTreeMap<String, ProviderUsage> = BTreeMap::new();
        let mut latency_totals: BTreeMap<String, u64> = BTreeMap::new();
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut window = 0;

        for attempt in entries.iter().filter(|a| &a.requester == owner) {
            window += 1;
            seen.insert(attempt.request_id);
            let usage = providers.entry(attempt.provider.clone()).or_default();
            usage.attempts += 1;
            match attempt.outcome {
                AttemptOutcome::Success => usage.successes += 1,
                AttemptOutcome::Timeout => usage.timeouts += 1,
                AttemptOutcome::RateLimited => usage.rate_limited += 1,
                AttemptOutcome::Error => usage.errors += 1,
            }
            if let Some(tokens) = attempt.usage {
                usage.prompt_tokens += u64::from(tokens.prompt_tokens);
                usage.completion_tokens += u64::from(tokens.completion_tokens);
            }
            *latency_totals.entry(attempt.provider.clone()).or_default() += attempt.latency_ms;
        }
        for (name, usage) in providers.iter_mut() {
            let total = latency_totals.get(name).copied().unwrap_or(0);
            usage.mean_latency_ms = total / usage.attempts.max(1);
        }

        UsageStats {
            window,
            requests: seen.len() as u64,
            providers,
        }
    }
}

#[async_trait]
impl AuditSink for AuditLog {
    async fn record_attempt(&self, attempt: &ProviderAttempt) -> anyhow::Result<()> {
        self.push(attempt.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(request_id: Uuid, who: &str, provider: &str, outcome: AttemptOutcome) -> ProviderAttempt {
        ProviderAttempt {
            request_id,
            requester: OwnerId::new(who),
            provider: provider.to_string(),
            started_at: Utc::now(),
            latency_ms: 10,
            outcome,
            detail: None,
            usage: None,
        }
    }

    #[test]
    fn ring_keeps_newest_entries() {
        let log = AuditLog::new(2);
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            log.push(attempt(*id, "u", "local", AttemptOutcome::Success));
        }
        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].request_id, ids[1]);
        assert_eq!(recent[1].request_id, ids[2]);
    }

    #[test]
    fn stats_count_requests_not_attempts() {
        let log = AuditLog::new(100);
        let r1 = Uuid::new_v4();
        log.push(attempt(r1, "alice", "local", AttemptOutcome::Timeout));
        log.push(attempt(r1, "alice", "cloud", AttemptOutcome::Success));
        log.push(attempt(Uuid::new_v4(), "alice", "cloud", AttemptOutcome::RateLimited));

        let stats = log.stats_for(&OwnerId::new("alice"));
        assert_eq!(stats.window, 3);
        assert_eq!(stats.requests, 2);
        let cloud = stats.providers.get("cloud").expect("cloud");
        assert_eq!(cloud.attempts, 2);
        assert_eq!(cloud.successes, 1);
        assert_eq!(cloud.rate_limited, 1);
        assert_eq!(stats.providers.get("local").map(|u| u.timeouts), Some(1));
    }

    #[test]
    fn stats_are_scoped_to_one_requester() {
        let log = AuditLog::new(100);
        let mut answered = attempt(Uuid::new_v4(), "alice", "cloud", AttemptOutcome::Success);
        answered.usage = Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
        });
        log.push(answered);
        log.push(attempt(Uuid::new_v4(), "bob", "local", AttemptOutcome::Error));

        let alice = log.stats_for(&OwnerId::new("alice"));
        assert_eq!(alice.requests, 1);
        assert!(!alice.providers.contains_key("local"));
        let cloud = alice.providers.get("cloud").expect("cloud");
        assert_eq!(cloud.prompt_tokens, 10);
        assert_eq!(cloud.completion_tokens, 5);

        let bob = log.stats_for(&OwnerId::new("bob"));
        assert_eq!(bob.window, 1);
        assert!(!bob.providers.contains_key("cloud"));
        assert_eq!(log.stats_for(&OwnerId::new("carol")), UsageStats::default());
    }

    #[test]
    fn restore_seeds_ring_within_capacity() {
        let log = AuditLog::new(2);
        let restored = log.restore(vec![
            attempt(Uuid::new_v4(), "alice", "cloud", AttemptOutcome::Success),
            attempt(Uuid::new_v4(), "alice", "cloud", AttemptOutcome::Success),
            attempt(Uuid::new_v4(), "alice", "local", AttemptOutcome::Error),
        ]);
        assert_eq!(restored, 3);
        let stats = log.stats_for(&OwnerId::new("alice"));
        assert_eq!(stats.window, 2);
        assert_eq!(stats.providers.get("local").map(|u| u.errors), Some(1));
    }
}
