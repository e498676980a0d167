use crate::ids::OwnerId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub limit: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 60,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Denied { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    window_start: DateTime<Utc>,
    count: u32,
}

/// Fixed-window admission control keyed by owner.
///
/// A window opens on the first request after the previous one elapsed.
/// Denied requests are not counted and nothing is queued.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    window: chrono::Duration,
    buckets: DashMap<OwnerId, Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            window: to_chrono(config.window),
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    pub fn allow(&self, owner: &OwnerId) -> bool {
        self.allow_at(owner, Utc::now())
    }

    pub fn allow_at(&self, owner: &OwnerId, now: DateTime<Utc>) -> bool {
        self.check_at(owner, now).is_allowed()
    }

    pub fn check(&self, owner: &OwnerId) -> RateDecision {
        self.check_at(owner, Utc::now())
    }

    pub fn check_at(&self, owner: &OwnerId, now: DateTime<Utc>) -> RateDecision {
        let mut bucket = self.buckets.entry(owner.clone()).or_insert(Bucket {
            window_start: now,
            count: 0,
        });
        if now - bucket.window_start >= self.window {
            bucket.window_start = now;
            bucket.count = 0;
        }
        if bucket.count >= self.config.limit {
            let reopens = bucket.window_start + self.window;
            let retry_after = (reopens - now).to_std().unwrap_or_default();
            tracing::debug!(owner = %owner, count = bucket.count, "rate limit denied");
            return RateDecision::Denied { retry_after };
        }
        bucket.count += 1;
        RateDecision::Allowed {
            remaining: self.config.limit - bucket.count,
        }
    }

    /// Requests still admissible in the owner's current window, without
    /// consuming one.
    pub fn remaining_at(&self, owner: &OwnerId, now: DateTime<Utc>) -> u32 {
        match self.buckets.get(owner) {
            Some(bucket) if now - bucket.window_start < self.window => {
                self.config.limit.saturating_sub(bucket.count)
            }
            _ => self.config.limit,
        }
    }

    pub fn remaining(&self, owner: &OwnerId) -> u32 {
        self.remaining_at(owner, Utc::now())
    }

    /// Drops buckets whose window ended at least one full window before `now`.
    /// Returns how many went.
    pub fn prune_idle_at(&self, now: DateTime<Utc>) -> usize {
        let horizon = self.window * 2;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now - bucket.window_start < horizon);
        before.saturating_sub(self.buckets.len())
    }

    pub fn prune_idle(&self) -> usize {
        self.prune_idle_at(Utc::now())
    }

    pub fn tracked_owners(&self) -> usize {
        self.buckets.len()
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn limiter(limit: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            limit,
            window: Duration::from_secs(window_secs),
        })
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).single().expect("ts")
    }

    #[test]
    fn sixth_request_in_window_is_denied_and_window_reopens() {
        let limiter = limiter(5, 60);
        let owner = OwnerId::new("u1");
        let start = t0();
        for i in 0..5 {
            let at = start + chrono::Duration::seconds(i * 2);
            assert!(limiter.allow_at(&owner, at), "request {i} should pass");
        }
        let sixth = start + chrono::Duration::seconds(10);
        match limiter.check_at(&owner, sixth) {
            RateDecision::Denied { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(50));
            }
            other => panic!("expected denial, got {other:?}"),
        }
        assert!(limiter.allow_at(&owner, start + chrono::Duration::seconds(60)));
    }

    #[test]
    fn denials_do_not_consume_budget() {
        let limiter = limiter(1, 60);
        let owner = OwnerId::new("u1");
        let start = t0();
        assert!(limiter.allow_at(&owner, start));
        for _ in 0..10 {
            assert!(!limiter.allow_at(&owner, start + chrono::Duration::seconds(1)));
        }
        assert_eq!(limiter.remaining_at(&owner, start), 0);
        assert!(limiter.allow_at(&owner, start + chrono::Duration::seconds(61)));
        assert_eq!(
            limiter.remaining_at(&owner, start + chrono::Duration::seconds(61)),
            0
        );
    }

    #[test]
    fn owners_are_isolated() {
        let limiter = limiter(1, 60);
        let now = t0();
        assert!(limiter.allow_at(&OwnerId::new("a"), now));
        assert!(!limiter.allow_at(&OwnerId::new("a"), now));
        assert!(limiter.allow_at(&OwnerId::new("b"), now));
    }

    #[test]
    fn never_admits_more_than_limit_per_window() {
        let limiter = limiter(3, 10);
        let owner = OwnerId::new("u");
        let start = t0();
        let admitted = (0..100)
            .filter(|i| limiter.allow_at(&owner, start + chrono::Duration::milliseconds(i * 50)))
            .count();
        assert_eq!(admitted, 3);
    }

    #[test]
    fn prune_drops_closed_windows_only() {
        let limiter = limiter(5, 60);
        let start = t0();
        limiter.allow_at(&OwnerId::new("old"), start);
        limiter.allow_at(&OwnerId::new("new"), start + chrono::Duration::seconds(50));
        assert_eq!(limiter.prune_idle_at(start + chrono::Duration::seconds(70)), 0);
        let pruned = limiter.prune_idle_at(start + chrono::Duration::seconds(130));
        assert_eq!(pruned, 1);
        assert_eq!(limiter.tracked_owners(), 1);
    }
}
