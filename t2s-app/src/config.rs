//! t2s configuration loader.
//!
//! TOML file first, then `.env`, then environment overrides, then validation.

use anyhow::Context;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use t2s_core::{
    AlertRule, Comparator, MonitorConfig, OrchestratorConfig, OwnerId, RateLimitConfig,
    RouterConfig, SessionConfig,
};

#[derive(Debug, Clone, Deserialize)]
pub struct T2sConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub sessions: SessionsSection,
    #[serde(default)]
    pub alerts: AlertsSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub store: StoreSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Owner ids allowed to use the assistant. Empty denies everyone.
    #[serde(default)]
    pub allowed_users: Vec<String>,
    /// Recipients of alert notifications.
    #[serde(default)]
    pub admin_users: Vec<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            workspace_dir: default_workspace_dir(),
            system_prompt: None,
            allowed_users: Vec::new(),
            admin_users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiCompatible,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default = "default_provider_kind")]
    pub kind: ProviderKind,
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the key; used when `api_key` is unset.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub streaming: bool,
}

fn default_provider_kind() -> ProviderKind {
    ProviderKind::OpenaiCompatible
}

impl ProviderConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| {
                self.api_key_env
                    .as_deref()
                    .and_then(|name| std::env::var(name).ok())
            })
            .filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterSection {
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,
    #[serde(default = "default_unavailable_after")]
    pub unavailable_after: u32,
    #[serde(default = "default_attempt_timeout_seconds")]
    pub attempt_timeout_seconds: u64,
    #[serde(default = "default_degraded_timeout_seconds")]
    pub degraded_timeout_seconds: u64,
    #[serde(default = "default_probe_cooldown_seconds")]
    pub probe_cooldown_seconds: u64,
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,
    /// Overall limit for one chat request across all providers; unset means
    /// only the per-attempt timeouts apply.
    #[serde(default)]
    pub request_timeout_seconds: Option<u64>,
}

fn default_degraded_after() -> u32 {
    3
}

fn default_unavailable_after() -> u32 {
    5
}

fn default_attempt_timeout_seconds() -> u64 {
    60
}

fn default_degraded_timeout_seconds() -> u64 {
    10
}

fn default_probe_cooldown_seconds() -> u64 {
    60
}

fn default_audit_capacity() -> usize {
    1000
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            degraded_after: default_degraded_after(),
            unavailable_after: default_unavailable_after(),
            attempt_timeout_seconds: default_attempt_timeout_seconds(),
            degraded_timeout_seconds: default_degraded_timeout_seconds(),
            probe_cooldown_seconds: default_probe_cooldown_seconds(),
            audit_capacity: default_audit_capacity(),
            request_timeout_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSection {
    #[serde(default = "default_rate_limit")]
    pub limit: u32,
    #[serde(default = "default_rate_window_seconds")]
    pub window_seconds: u64,
}

fn default_rate_limit() -> u32 {
    60
}

fn default_rate_window_seconds() -> u64 {
    60
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            limit: default_rate_limit(),
            window_seconds: default_rate_window_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionsSection {
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
    #[serde(default = "default_task_timeout_seconds")]
    pub task_timeout_seconds: u64,
    #[serde(default = "default_agent_program")]
    pub agent_program: String,
    #[serde(default = "default_agent_args")]
    pub agent_args: Vec<String>,
}

fn default_idle_timeout_seconds() -> u64 {
    30 * 60
}

fn default_sweep_interval_seconds() -> u64 {
    60
}

fn default_task_timeout_seconds() -> u64 {
    300
}

fn default_agent_program() -> String {
    "claude".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec!["-p".to_string()]
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: default_idle_timeout_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            task_timeout_seconds: default_task_timeout_seconds(),
            agent_program: default_agent_program(),
            agent_args: default_agent_args(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertRuleConfig {
    pub name: String,
    pub metric: String,
    pub comparator: Comparator,
    pub threshold: f64,
    #[serde(default)]
    pub critical_threshold: Option<f64>,
    /// Falls back to `alerts.default_cooldown_seconds`.
    #[serde(default)]
    pub cooldown_seconds: Option<u64>,
    #[serde(default)]
    pub notify_recovery: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrometheusConfig {
    #[serde(default = "default_prometheus_url")]
    pub url: String,
    /// Metric name -> PromQL expression returning one scalar/vector value.
    #[serde(default = "default_prometheus_queries")]
    pub queries: BTreeMap<String, String>,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            url: default_prometheus_url(),
            queries: default_prometheus_queries(),
        }
    }
}

fn default_prometheus_url() -> String {
    "http://localhost:9090".to_string()
}

fn default_prometheus_queries() -> BTreeMap<String, String> {
    [
        (
            "disk_percent",
            r#"100 * (1 - node_filesystem_avail_bytes{mountpoint="/"} / node_filesystem_size_bytes{mountpoint="/"})"#,
        ),
        (
            "memory_percent",
            "100 * (1 - node_memory_MemAvailable_bytes / node_memory_MemTotal_bytes)",
        ),
        (
            "cpu_percent",
            r#"100 - avg(rate(node_cpu_seconds_total{mode="idle"}[5m])) * 100"#,
        ),
        ("gpu_temperature", "max(DCGM_FI_DEV_GPU_TEMP)"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertsSection {
    #[serde(default = "default_alerts_enabled")]
    pub enabled: bool,
    #[serde(default = "default_alert_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_alert_cooldown_seconds")]
    pub default_cooldown_seconds: u64,
    #[serde(default = "default_sample_timeout_seconds")]
    pub sample_timeout_seconds: u64,
    #[serde(default = "default_alert_history")]
    pub history: usize,
    #[serde(default = "default_alert_rules")]
    pub rules: Vec<AlertRuleConfig>,
    #[serde(default)]
    pub prometheus: PrometheusConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

fn default_alerts_enabled() -> bool {
    true
}

fn default_alert_interval_seconds() -> u64 {
    60
}

fn default_alert_cooldown_seconds() -> u64 {
    300
}

fn default_sample_timeout_seconds() -> u64 {
    15
}

fn default_alert_history() -> usize {
    200
}

fn default_alert_rules() -> Vec<AlertRuleConfig> {
    let rule = |name: &str, metric: &str, threshold: f64, critical: Option<f64>| AlertRuleConfig {
        name: name.to_string(),
        metric: metric.to_string(),
        comparator: Comparator::Gt,
        threshold,
        critical_threshold: critical,
        cooldown_seconds: None,
        notify_recovery: true,
    };
    vec![
        rule("disk_usage", "disk_percent", 90.0, Some(95.0)),
        rule("memory_usage", "memory_percent", 90.0, Some(95.0)),
        rule("cpu_usage", "cpu_percent", 95.0, None),
        rule("gpu_temperature", "gpu_temperature", 80.0, Some(90.0)),
    ]
}

impl Default for AlertsSection {
    fn default() -> Self {
        Self {
            enabled: default_alerts_enabled(),
            interval_seconds: default_alert_interval_seconds(),
            default_cooldown_seconds: default_alert_cooldown_seconds(),
            sample_timeout_seconds: default_sample_timeout_seconds(),
            history: default_alert_history(),
            rules: default_alert_rules(),
            prometheus: PrometheusConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_bind() -> String {
    "127.0.0.1:8765".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    600
}

fn default_http_max_in_flight() -> usize {
    256
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreSection {
    /// Defaults to `<data_dir>/t2s.sqlite3`.
    #[serde(default)]
    pub sqlite_path: Option<String>,
}

impl T2sConfig {
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: T2sConfig = toml::from_str(&contents)
            .with_context(|| format!("parse config {}", path.display()))?;

        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!(error = %e, "failed to load .env");
            }
        }
        cfg.apply_env_overrides();
        cfg.validate()
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok((cfg, path))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("T2S_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = get("T2S_ALLOWED_USERS") {
            self.general.allowed_users = split_list(&v);
        }
        if let Some(v) = get("T2S_ADMIN_USERS") {
            self.general.admin_users = split_list(&v);
        }
        if let Some(v) = get("WORKSPACE_DIR") {
            self.general.workspace_dir = v;
        }
        if let Some(n) = get("RATE_LIMIT").and_then(|v| parse_env("RATE_LIMIT", &v)) {
            self.rate_limit.limit = n;
        }
        if let Some(n) = get("RATE_WINDOW").and_then(|v| parse_env("RATE_WINDOW", &v)) {
            self.rate_limit.window_seconds = n;
        }
        if let Some(v) = get("ALERT_ENABLED") {
            self.alerts.enabled = v.trim().eq_ignore_ascii_case("true");
        }
        if let Some(n) = get("ALERT_CHECK_INTERVAL").and_then(|v| parse_env("ALERT_CHECK_INTERVAL", &v)) {
            self.alerts.interval_seconds = n;
        }
        if let Some(n) = get("ALERT_COOLDOWN").and_then(|v| parse_env("ALERT_COOLDOWN", &v)) {
            self.alerts.default_cooldown_seconds = n;
        }
        if let Some(v) = get("PROMETHEUS_URL") {
            self.alerts.prometheus.url = v;
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.providers.is_empty() {
            anyhow::bail!("at least one [[providers]] entry is required");
        }
        let mut names = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                anyhow::bail!("providers.name must not be empty");
            }
            if !names.insert(provider.name.as_str()) {
                anyhow::bail!("duplicate provider name {:?}", provider.name);
            }
            if provider.base_url.trim().is_empty() || provider.model.trim().is_empty() {
                anyhow::bail!("provider {} needs base_url and model", provider.name);
            }
        }
        let r = &self.router;
        if r.degraded_after == 0 || r.degraded_after > r.unavailable_after {
            anyhow::bail!(
                "router thresholds must satisfy 0 < degraded_after ({}) <= unavailable_after ({})",
                r.degraded_after,
                r.unavailable_after
            );
        }
        if r.attempt_timeout_seconds == 0 || r.degraded_timeout_seconds == 0 {
            anyhow::bail!("router timeouts must be > 0");
        }
        if r.request_timeout_seconds == Some(0) {
            anyhow::bail!("router.request_timeout_seconds must be > 0 when set");
        }
        if self.rate_limit.limit == 0 || self.rate_limit.window_seconds == 0 {
            anyhow::bail!("rate_limit.limit and rate_limit.window_seconds must be > 0");
        }
        let s = &self.sessions;
        if s.idle_timeout_seconds == 0 || s.sweep_interval_seconds == 0 || s.task_timeout_seconds == 0 {
            anyhow::bail!("sessions timeouts and sweep interval must be > 0");
        }
        if s.agent_program.trim().is_empty() {
            anyhow::bail!("sessions.agent_program is required");
        }
        if self.server.http_max_in_flight == 0 || self.server.http_timeout_seconds == 0 {
            anyhow::bail!("server.http_max_in_flight and server.http_timeout_seconds must be > 0");
        }
        if self.alerts.enabled {
            if self.alerts.interval_seconds == 0 || self.alerts.sample_timeout_seconds == 0 {
                anyhow::bail!("alerts.interval_seconds and alerts.sample_timeout_seconds must be > 0");
            }
            let mut rule_names = HashSet::new();
            for rule in self.alert_rules() {
                if !rule_names.insert(rule.name.clone()) {
                    anyhow::bail!("duplicate alert rule {:?}", rule.name);
                }
                rule.validate().map_err(anyhow::Error::msg)?;
            }
        }
        Ok(())
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            degraded_after: self.router.degraded_after,
            unavailable_after: self.router.unavailable_after,
            attempt_timeout: Duration::from_secs(self.router.attempt_timeout_seconds),
            degraded_timeout: Duration::from_secs(self.router.degraded_timeout_seconds),
            probe_cooldown: Duration::from_secs(self.router.probe_cooldown_seconds),
        }
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            limit: self.rate_limit.limit,
            window: Duration::from_secs(self.rate_limit.window_seconds),
        }
    }

    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        Ok(SessionConfig {
            idle_timeout: Duration::from_secs(self.sessions.idle_timeout_seconds),
            task_timeout: Duration::from_secs(self.sessions.task_timeout_seconds),
            default_workspace: expand_home(&self.general.workspace_dir)?
                .to_string_lossy()
                .into_owned(),
        })
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            allowed_users: self
                .general
                .allowed_users
                .iter()
                .map(|u| OwnerId::new(u.trim()))
                .collect(),
            system_prompt: self.general.system_prompt.clone(),
            request_timeout: self.router.request_timeout_seconds.map(Duration::from_secs),
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_secs(self.alerts.interval_seconds),
            sample_timeout: Duration::from_secs(self.alerts.sample_timeout_seconds),
            history: self.alerts.history,
        }
    }

    pub fn alert_rules(&self) -> Vec<AlertRule> {
        self.alerts
            .rules
            .iter()
            .map(|r| AlertRule {
                name: r.name.clone(),
                metric: r.metric.clone(),
                comparator: r.comparator,
                threshold: r.threshold,
                critical_threshold: r.critical_threshold,
                cooldown: Duration::from_secs(
                    r.cooldown_seconds
                        .unwrap_or(self.alerts.default_cooldown_seconds),
                ),
                notify_recovery: r.notify_recovery,
            })
            .collect()
    }

    pub fn sqlite_path(&self) -> anyhow::Result<PathBuf> {
        match &self.store.sqlite_path {
            Some(path) => expand_home(path),
            None => Ok(expand_home(&self.general.data_dir)?.join("t2s.sqlite3")),
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value, "ignoring unparseable environment override");
            None
        }
    }
}

pub fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen('~', &home, 1)))
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".t2s").join("config.toml")
}

fn default_data_dir() -> String {
    "~/.t2s/data".to_string()
}

fn default_workspace_dir() -> String {
    "~/t2s_workspace".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
[general]
allowed_users = ["1001"]

[[providers]]
name = "local"
base_url = "http://localhost:11434/v1"
model = "llama3.2:3b"
streaming = true

[[providers]]
name = "groq"
base_url = "https://api.groq.com/openai/v1"
model = "llama-3.3-70b-versatile"
api_key_env = "GROQ_API_KEY"
"#;

    fn parse(contents: &str) -> T2sConfig {
        toml::from_str(contents).expect("parse")
    }

    #[test]
    fn defaults_fill_every_section() {
        let cfg = parse(MINIMAL);
        cfg.validate().expect("valid");
        assert_eq!(cfg.providers.len(), 2);
        assert_eq!(cfg.providers[1].kind, ProviderKind::OpenaiCompatible);
        assert_eq!(cfg.router.degraded_after, 3);
        assert_eq!(cfg.router.unavailable_after, 5);
        assert_eq!(cfg.rate_limit.limit, 60);
        assert_eq!(cfg.sessions.idle_timeout_seconds, 1800);
        assert_eq!(cfg.server.bind, "127.0.0.1:8765");
        let rules = cfg.alert_rules();
        assert_eq!(rules.len(), 4);
        assert_eq!(rules[0].cooldown, Duration::from_secs(300));
        assert_eq!(rules[3].critical_threshold, Some(90.0));
    }

    #[test]
    fn env_overrides_win_over_file() {
        let mut cfg = parse(MINIMAL);
        let env: HashMap<&str, &str> = [
            ("RATE_LIMIT", "5"),
            ("RATE_WINDOW", "10"),
            ("ALERT_ENABLED", "false"),
            ("T2S_ALLOWED_USERS", "1, 2 ,,3"),
            ("ALERT_COOLDOWN", "not-a-number"),
        ]
        .into_iter()
        .collect();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.rate_limit.limit, 5);
        assert_eq!(cfg.rate_limit.window_seconds, 10);
        assert!(!cfg.alerts.enabled);
        assert_eq!(cfg.general.allowed_users, vec!["1", "2", "3"]);
        assert_eq!(cfg.alerts.default_cooldown_seconds, 300);
    }

    #[test]
    fn rejects_inverted_router_thresholds() {
        let mut cfg = parse(MINIMAL);
        cfg.router.degraded_after = 6;
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("degraded_after"));
    }

    #[test]
    fn rejects_duplicate_provider_names() {
        let mut cfg = parse(MINIMAL);
        cfg.providers[1].name = "local".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_missing_providers() {
        let cfg = parse("[general]\nallowed_users = []\n");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn custom_rules_parse_comparators_and_validate_critical_side() {
        let contents = format!(
            "{MINIMAL}\n[alerts]\n[[alerts.rules]]\nname = \"free\"\nmetric = \"free_gb\"\ncomparator = \"<\"\nthreshold = 10.0\ncritical_threshold = 20.0\n"
        );
        let cfg = parse(&contents);
        assert_eq!(cfg.alerts.rules.len(), 1);
        assert_eq!(cfg.alerts.rules[0].comparator, Comparator::Lt);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn sqlite_path_defaults_under_data_dir() {
        let mut cfg = parse(MINIMAL);
        cfg.general.data_dir = "/var/lib/t2s".to_string();
        assert_eq!(
            cfg.sqlite_path().expect("path"),
            PathBuf::from("/var/lib/t2s/t2s.sqlite3")
        );
    }
}
