use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unavailable,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unavailable => "unavailable",
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct HealthPolicy {
    pub degraded_after: u32,
    pub unavailable_after: u32,
    pub probe_cooldown: chrono::Duration,
}

/// How a provider was admitted for one attempt. Decides the timeout budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Normal,
    Degraded,
    Probe,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ProviderHealth {
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

impl ProviderHealth {
    pub fn state(&self, policy: &HealthPolicy) -> HealthState {
        if self.consecutive_failures >= policy.unavailable_after {
            HealthState::Unavailable
        } else if self.consecutive_failures >= policy.degraded_after {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_failure_at(&self) -> Option<DateTime<Utc>> {
        self.last_failure_at
    }

    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        self.last_success_at
    }

    fn probe_due(&self, policy: &HealthPolicy, now: DateTime<Utc>) -> bool {
        !self.probe_in_flight
            && self
                .last_failure_at
                .is_none_or(|at| now - at >= policy.probe_cooldown)
    }

    /// Whether `admit` would let a request through right now.
    pub fn is_selectable(&self, policy: &HealthPolicy, now: DateTime<Utc>) -> bool {
        match self.state(policy) {
            HealthState::Healthy | HealthState::Degraded => true,
            HealthState::Unavailable => self.probe_due(policy, now),
        }
    }

    /// Reserves an attempt slot. An unavailable provider hands out at most one
    /// probe per cooldown.
    pub fn admit(&mut self, policy: &HealthPolicy, now: DateTime<Utc>) -> Option<Admission> {
        match self.state(policy) {
            HealthState::Healthy => Some(Admission::Normal),
            HealthState::Degraded => Some(Admission::Degraded),
            HealthState::Unavailable if self.probe_due(policy, now) => {
                self.probe_in_flight = true;
                Some(Admission::Probe)
            }
            HealthState::Unavailable => None,
        }
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.last_success_at = Some(now);
        self.probe_in_flight = false;
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(now);
        self.probe_in_flight = false;
    }

    /// Frees a probe reservation whose attempt was abandoned without an outcome.
    pub fn release_probe(&mut self) {
        self.probe_in_flight = false;
    }
}
