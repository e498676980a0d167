use super::{AlertEvent, AlertKind, AlertRule, MetricSample, RuleStateRecord};
use crate::rate_limit::to_chrono;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct RuleState {
    last_fired_at: Option<DateTime<Utc>>,
    active: bool,
}

struct RuleSlot {
    rule: AlertRule,
    cooldown: chrono::Duration,
    state: Mutex<RuleState>,
}

impl RuleSlot {
    fn state(&self) -> MutexGuard<'_, RuleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Evaluates samples against rules in declaration order.
pub struct AlertEngine {
    rules: Vec<RuleSlot>,
    tick: Mutex<()>,
}

impl AlertEngine {
    pub fn new(rules: Vec<AlertRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| RuleSlot {
                cooldown: to_chrono(rule.cooldown),
                rule,
                state: Mutex::new(RuleState::default()),
            })
            .collect();
        Self {
            rules,
            tick: Mutex::new(()),
        }
    }

    pub fn rules(&self) -> impl Iterator<Item = &AlertRule> {
        self.rules.iter().map(|slot| &slot.rule)
    }

    /// Reapplies persisted cooldown state. Records for unknown rules are ignored.
    pub fn restore(&self, records: &[RuleStateRecord]) {
        for record in records {
            if let Some(slot) = self.rules.iter().find(|s| s.rule.name == record.rule) {
                let mut state = slot.state();
                state.last_fired_at = record.last_fired_at;
                state.active = record.active;
            }
        }
    }

    pub fn rule_states(&self) -> Vec<RuleStateRecord> {
        self.rules
            .iter()
            .map(|slot| {
                let state = slot.state();
                RuleStateRecord {
                    rule: slot.rule.name.clone(),
                    last_fired_at: state.last_fired_at,
                    active: state.active,
                }
            })
            .collect()
    }

    pub fn evaluate(&self, samples: &[MetricSample]) -> Vec<AlertEvent> {
        self.evaluate_at(samples, Utc::now())
    }

    /// One evaluation tick. Uses the newest sample per metric; rules with no
    /// sample are left untouched. Cooldown is measured against `now`, not
    /// the sample timestamps.
    pub fn evaluate_at(&self, samples: &[MetricSample], now: DateTime<Utc>) -> Vec<AlertEvent> {
        let _tick = self.tick.lock().unwrap_or_else(PoisonError::into_inner);

        let mut latest: HashMap<&str, &MetricSample> = HashMap::new();
        for sample in samples {
            if !sample.value.is_finite() {
                tracing::debug!(metric = %sample.metric, "ignoring non-finite sample");
                continue;
            }
            latest
                .entry(sample.metric.as_str())
                .and_modify(|cur| {
                    if sample.at >= cur.at {
                        *cur = sample;
                    }
                })
                .or_insert(sample);
        }

        let mut events = Vec::new();
        for slot in &self.rules {
            let rule = &slot.rule;
            let Some(sample) = latest.get(rule.metric.as_str()) else {
                continue;
            };
            let mut state = slot.state();
            if rule.comparator.holds(sample.value, rule.threshold) {
                let cooled = state
                    .last_fired_at
                    .is_none_or(|at| now - at >= slot.cooldown);
                if !cooled {
                    tracing::debug!(rule = %rule.name, value = sample.value, "alert suppressed by cooldown");
                    continue;
                }
                state.last_fired_at = Some(now);
                state.active = true;
                let severity = rule.severity_for(sample.value);
                tracing::info!(rule = %rule.name, value = sample.value, ?severity, "alert fired");
                events.push(AlertEvent {
                    id: Uuid::new_v4(),
                    rule: rule.name.clone(),
                    metric: rule.metric.clone(),
                    kind: AlertKind::Fired,
                    severity,
                    value: sample.value,
                    threshold: rule.threshold,
                    message: format!(
                        "{}: {} is {} ({} {})",
                        rule.name, rule.metric, sample.value, rule.comparator, rule.threshold
                    ),
                    at: now,
                });
            } else if state.active {
                state.active = false;
                if rule.notify_recovery {
                    tracing::info!(rule = %rule.name, value = sample.value, "alert resolved");
                    events.push(AlertEvent {
                        id: Uuid::new_v4(),
                        rule: rule.name.clone(),
                        metric: rule.metric.clone(),
                        kind: AlertKind::Resolved,
                        severity: super::Severity::Warning,
                        value: sample.value,
                        threshold: rule.threshold,
                        message: format!(
                            "{}: {} back to {} (threshold {} {})",
                            rule.name, rule.metric, sample.value, rule.comparator, rule.threshold
                        ),
                        at: now,
                    });
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{Comparator, Severity};
    use chrono::TimeZone;
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).single().expect("ts")
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn disk_rule() -> AlertRule {
        AlertRule::new("disk", "disk_percent", Comparator::Gt, 90.0)
            .with_critical(95.0)
            .with_cooldown(Duration::from_secs(300))
    }

    fn disk(value: f64, at: DateTime<Utc>) -> Vec<MetricSample> {
        vec![MetricSample::new("disk_percent", value, at)]
    }

    #[test]
    fn disk_scenario_fires_suppresses_then_escalates() {
        let engine = AlertEngine::new(vec![disk_rule()]);

        let first = engine.evaluate_at(&disk(92.0, t0()), t0());
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].severity, Severity::Warning);
        assert_eq!(first[0].kind, AlertKind::Fired);

        let second = engine.evaluate_at(&disk(93.0, t0() + secs(60)), t0() + secs(60));
        assert!(second.is_empty());

        let third = engine.evaluate_at(&disk(96.0, t0() + secs(360)), t0() + secs(360));
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].severity, Severity::Critical);
    }

    #[test]
    fn disk_readings_over_thirty_seconds_fire_once() {
        let engine = AlertEngine::new(vec![disk_rule()]);
        let fired: Vec<i64> = [(0, 85.0), (10, 92.0), (20, 93.0), (30, 91.0)]
            .into_iter()
            .filter(|&(t, value)| {
                let now = t0() + secs(t);
                !engine.evaluate_at(&disk(value, now), now).is_empty()
            })
            .map(|(t, _)| t)
            .collect();
        assert_eq!(fired, vec![10]);
        let state = &engine.rule_states()[0];
        assert!(state.active);
        assert_eq!(state.last_fired_at, Some(t0() + secs(10)));
    }

    #[test]
    fn cooldown_counts_from_evaluation_time_not_sample_time() {
        let engine = AlertEngine::new(vec![disk_rule()]);
        engine.evaluate_at(&disk(92.0, t0() - secs(1000)), t0());
        let stale_sample = t0() - secs(900);
        assert!(engine.evaluate_at(&disk(92.0, stale_sample), t0() + secs(299)).is_empty());
        assert_eq!(engine.evaluate_at(&disk(92.0, stale_sample), t0() + secs(300)).len(), 1);
    }

    #[test]
    fn at_most_one_fire_per_cooldown_window() {
        let engine = AlertEngine::new(vec![disk_rule()]);
        let fired: usize = (0..60)
            .map(|i| {
                let now = t0() + secs(i * 10);
                engine.evaluate_at(&disk(99.0, now), now).len()
            })
            .sum();
        // 600s of breaching samples with a 300s cooldown: t=0, t=300.
        assert_eq!(fired, 2);
    }

    #[test]
    fn events_follow_rule_declaration_order() {
        let engine = AlertEngine::new(vec![
            AlertRule::new("mem", "memory_percent", Comparator::Gt, 90.0),
            AlertRule::new("cpu", "cpu_percent", Comparator::Gt, 95.0),
            AlertRule::new("disk", "disk_percent", Comparator::Gt, 90.0),
        ]);
        let samples = vec![
            MetricSample::new("disk_percent", 99.0, t0()),
            MetricSample::new("cpu_percent", 99.0, t0()),
            MetricSample::new("memory_percent", 99.0, t0()),
        ];
        let names: Vec<_> = engine
            .evaluate_at(&samples, t0())
            .into_iter()
            .map(|e| e.rule)
            .collect();
        assert_eq!(names, vec!["mem", "cpu", "disk"]);
    }

    #[test]
    fn newest_sample_per_metric_wins() {
        let engine = AlertEngine::new(vec![disk_rule()]);
        let samples = vec![
            MetricSample::new("disk_percent", 99.0, t0() - secs(30)),
            MetricSample::new("disk_percent", 50.0, t0()),
        ];
        assert!(engine.evaluate_at(&samples, t0()).is_empty());
    }

    #[test]
    fn recovery_is_emitted_once_when_opted_in() {
        let engine = AlertEngine::new(vec![disk_rule().with_recovery(true)]);
        assert_eq!(engine.evaluate_at(&disk(92.0, t0()), t0()).len(), 1);

        let resolved = engine.evaluate_at(&disk(70.0, t0() + secs(10)), t0() + secs(10));
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].kind, AlertKind::Resolved);
        assert!(engine.evaluate_at(&disk(70.0, t0() + secs(20)), t0() + secs(20)).is_empty());

        // Recovery does not reset the cooldown.
        assert!(engine.evaluate_at(&disk(92.0, t0() + secs(30)), t0() + secs(30)).is_empty());
    }

    #[test]
    fn recovery_stays_silent_by_default() {
        let engine = AlertEngine::new(vec![disk_rule()]);
        engine.evaluate_at(&disk(92.0, t0()), t0());
        assert!(engine.evaluate_at(&disk(10.0, t0() + secs(5)), t0() + secs(5)).is_empty());
    }

    #[test]
    fn restored_state_keeps_cooldown_across_restart() {
        let engine = AlertEngine::new(vec![disk_rule()]);
        engine.evaluate_at(&disk(92.0, t0()), t0());
        let saved = engine.rule_states();

        let restarted = AlertEngine::new(vec![disk_rule()]);
        restarted.restore(&saved);
        assert!(restarted.evaluate_at(&disk(92.0, t0() + secs(10)), t0() + secs(10)).is_empty());
    }
}
