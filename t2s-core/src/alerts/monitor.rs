use super::{AlertEngine, AlertEvent, MetricSample, RuleStateRecord};
use crate::error::SamplerError;
use crate::store::StoreWriter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait MetricSampler: Send + Sync {
    async fn sample(&self) -> Result<Vec<MetricSample>, SamplerError>;
}

#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, event: &AlertEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub sample_timeout: Duration,
    pub history: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            sample_timeout: Duration::from_secs(15),
            history: 200,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorStatus {
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub events: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Drives [`AlertEngine`] from a sampler on a fixed interval and fans fired
/// events out to the notifier and the store.
pub struct AlertMonitor {
    engine: Arc<AlertEngine>,
    sampler: Arc<dyn MetricSampler>,
    notifier: Arc<dyn AlertNotifier>,
    store: Option<StoreWriter>,
    config: MonitorConfig,
    history: Mutex<VecDeque<AlertEvent>>,
    status: Mutex<MonitorStatus>,
}

impl AlertMonitor {
    pub fn new(
        engine: Arc<AlertEngine>,
        sampler: Arc<dyn MetricSampler>,
        notifier: Arc<dyn AlertNotifier>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            engine,
            sampler,
            notifier,
            store: None,
            config,
            history: Mutex::new(VecDeque::new()),
            status: Mutex::new(MonitorStatus::default()),
        }
    }

    pub fn with_store(mut self, store: StoreWriter) -> Self {
        self.store = Some(store);
        self
    }

    pub fn engine(&self) -> &AlertEngine {
        &self.engine
    }

    /// One sampling tick. A sampler failure or timeout skips the tick and
    /// leaves every rule untouched.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn tick(&self) -> Result<Vec<AlertEvent>, SamplerError> {
        let sampled = tokio::time::timeout(self.config.sample_timeout, self.sampler.sample())
            .await
            .unwrap_or_else(|_| {
                Err(SamplerError::SamplerUnavailable(format!(
                    "no samples within {}s",
                    self.config.sample_timeout.as_secs()
                )))
            });
        let samples = match sampled {
            Ok(samples) => samples,
            Err(err) => {
                tracing::warn!(error = %err, "skipping alert tick");
                let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
                status.skipped_ticks += 1;
                status.last_tick_at = Some(Utc::now());
                status.last_error = Some(err.to_string());
                return Err(err);
            }
        };

        let before = self.engine.rule_states();
        let events = self.engine.evaluate(&samples);
        {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            status.ticks += 1;
            status.events += events.len() as u64;
            status.last_tick_at = Some(Utc::now());
            status.last_error = None;
        }

        for event in &events {
            if let Err(err) = self.notifier.notify(event).await {
                tracing::warn!(rule = %event.rule, error = %err, "alert notification failed");
            }
        }
        self.record(&before, &events);
        Ok(events)
    }

    /// Persists every rule whose state moved during the tick, including a
    /// silent recovery, then the events themselves.
    fn record(&self, before: &[RuleStateRecord], events: &[AlertEvent]) {
        if let Some(store) = &self.store {
            for state in self.engine.rule_states() {
                if !before.contains(&state) {
                    store.save_rule_state(state);
                }
            }
            for event in events {
                store.append_alert(event.clone());
            }
        }
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        for event in events {
            while history.len() >= self.config.history.max(1) {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
    }

    /// Most recent events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AlertEvent> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.iter().rev().take(limit).cloned().collect()
    }

    pub fn status(&self) -> MonitorStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            rules = self.engine.rules().count(),
            "alert monitor started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("alert monitor stopping");
                    break;
                }
                _ = ticker.tick() => {
                    // Errors are already logged and counted.
                    let _ = self.tick().await;
                }
            }
        }
    }
}
