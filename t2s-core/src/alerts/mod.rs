//! Threshold alerting over periodic metric samples.

mod engine;
mod monitor;

pub use engine::AlertEngine;
pub use monitor::{AlertMonitor, AlertNotifier, MetricSampler, MonitorConfig, MonitorStatus};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
}

impl Comparator {
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Ge => value >= threshold,
            Self::Lt => value < threshold,
            Self::Le => value <= threshold,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }

    fn breaches_upward(self) -> bool {
        matches!(self, Self::Gt | Self::Ge)
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Comparator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Ge),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            other => Err(format!("unknown comparator {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Fired,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub metric: String,
    pub comparator: Comparator,
    pub threshold: f64,
    /// Crossing this as well escalates the event to critical.
    pub critical_threshold: Option<f64>,
    pub cooldown: Duration,
    pub notify_recovery: bool,
}

impl AlertRule {
    pub fn new(
        name: impl Into<String>,
        metric: impl Into<String>,
        comparator: Comparator,
        threshold: f64,
    ) -> Self {
        Self {
            name: name.into(),
            metric: metric.into(),
            comparator,
            threshold,
            critical_threshold: None,
            cooldown: Duration::from_secs(300),
            notify_recovery: false,
        }
    }

    pub fn with_critical(mut self, threshold: f64) -> Self {
        self.critical_threshold = Some(threshold);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_recovery(mut self, notify: bool) -> Self {
        self.notify_recovery = notify;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("alert rule name is empty".to_string());
        }
        if self.metric.trim().is_empty() {
            return Err(format!("alert rule {} has no metric", self.name));
        }
        if !self.threshold.is_finite() {
            return Err(format!("alert rule {} threshold is not finite", self.name));
        }
        if let Some(critical) = self.critical_threshold {
            let beyond = if self.comparator.breaches_upward() {
                critical >= self.threshold
            } else {
                critical <= self.threshold
            };
            if !critical.is_finite() || !beyond {
                return Err(format!(
                    "alert rule {} critical threshold {critical} is not beyond {} {}",
                    self.name, self.comparator, self.threshold
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn severity_for(&self, value: f64) -> Severity {
        match self.critical_threshold {
            Some(critical) if self.comparator.holds(value, critical) => Severity::Critical,
            _ => Severity::Warning,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric: String,
    pub value: f64,
    pub at: DateTime<Utc>,
}

impl MetricSample {
    pub fn new(metric: impl Into<String>, value: f64, at: DateTime<Utc>) -> Self {
        Self {
            metric: metric.into(),
            value,
            at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub rule: String,
    pub metric: String,
    pub kind: AlertKind,
    pub severity: Severity,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Persisted per-rule state that must survive a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleStateRecord {
    pub rule: String,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparator_parses_and_serializes_symbols() {
        assert_eq!(">=".parse::<Comparator>(), Ok(Comparator::Ge));
        assert!("=>".parse::<Comparator>().is_err());
        assert_eq!(
            serde_json::to_string(&Comparator::Lt).expect("json"),
            "\"<\""
        );
    }

    #[test]
    fn critical_threshold_must_sit_beyond_warning() {
        let upward = AlertRule::new("disk", "disk_percent", Comparator::Gt, 90.0);
        assert!(upward.clone().with_critical(95.0).validate().is_ok());
        assert!(upward.with_critical(80.0).validate().is_err());

        let downward = AlertRule::new("free", "free_gb", Comparator::Lt, 10.0);
        assert!(downward.clone().with_critical(2.0).validate().is_ok());
        assert!(downward.with_critical(20.0).validate().is_err());
    }

    #[test]
    fn severity_escalates_past_critical() {
        let rule = AlertRule::new("gpu", "gpu_temp", Comparator::Gt, 80.0).with_critical(90.0);
        assert_eq!(rule.severity_for(85.0), Severity::Warning);
        assert_eq!(rule.severity_for(91.0), Severity::Critical);
    }
}
