//! t2s server.
//!
//! Builds the core (router, sessions, alerts, orchestrator) from config, starts
//! the background loops and mounts the HTTP routes.

use crate::agent::ProcessAgent;
use crate::config::{ProviderKind, T2sConfig};
use crate::notifier::{FanoutNotifier, LogNotifier, WebhookNotifier};
use crate::routes;
use crate::sampler::PrometheusSampler;
use crate::sqlite_store::SqliteStore;
use anyhow::{Context, Result};
use axum::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use t2s_core::{
    AlertEngine, AlertMonitor, AlertNotifier, AuditLog, Orchestrator, RateLimiter, Router,
    SessionManager, Store, StoreWriter,
};
use t2s_llm::{OpenAiCompatibleClient, ProviderClient};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const STORE_QUEUE_CAPACITY: usize = 1024;
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub monitor: Option<Arc<AlertMonitor>>,
    pub started_at: Instant,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = T2sConfig::load_with_path(config_path).await?;
    let providers = build_providers(&cfg)?;
    let sqlite_path = cfg.sqlite_path()?;
    tracing::info!(
        config_path = %path.display(),
        providers = ?providers.iter().map(|p| p.name()).collect::<Vec<_>>(),
        allowed_users = cfg.general.allowed_users.len(),
        alert_rules = cfg.alerts.rules.len(),
        alerts_enabled = cfg.alerts.enabled,
        sqlite_path = %sqlite_path.display(),
        bind = %cfg.server.bind,
        "config ok"
    );
    if cfg.general.allowed_users.is_empty() {
        tracing::warn!("general.allowed_users is empty; every request will be rejected");
    }
    Ok(())
}

pub async fn status(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = T2sConfig::load_with_path(config_path).await?;
    let sqlite_path = cfg.sqlite_path()?;
    let store = SqliteStore::open(&sqlite_path)?;
    let sessions = store.load_sessions().await?;
    let rule_states = store.load_rule_state().await?;
    let live = sessions.iter().filter(|s| s.ended_at.is_none()).count();
    let active_rules = rule_states.iter().filter(|r| r.active).count();
    let alerts = store.alert_count().await?;
    tracing::info!(
        config_path = %path.display(),
        sqlite_path = %sqlite_path.display(),
        sessions_total = sessions.len(),
        sessions_live = live,
        alert_rules_active = active_rules,
        alerts_recorded = alerts,
        "status ok"
    );
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = T2sConfig::load_with_path(config_path).await?;
    let started_at = Instant::now();
    let addr: SocketAddr = cfg
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid server.bind {:?}", cfg.server.bind))?;
    tracing::info!(
        config_path = %cfg_path.display(),
        bind_addr = %addr,
        providers = cfg.providers.len(),
        allowed_users = cfg.general.allowed_users.len(),
        rate_limit = cfg.rate_limit.limit,
        rate_window_seconds = cfg.rate_limit.window_seconds,
        session_idle_timeout_seconds = cfg.sessions.idle_timeout_seconds,
        alerts_enabled = cfg.alerts.enabled,
        alert_interval_seconds = cfg.alerts.interval_seconds,
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let shutdown = CancellationToken::new();
    // The writer outlives the other tasks so their final writes are drained.
    let writer_shutdown = CancellationToken::new();

    let sqlite_path = cfg.sqlite_path()?;
    let store = Arc::new(SqliteStore::open(&sqlite_path)?);
    let (writer, writer_handle) =
        StoreWriter::spawn(store.clone(), STORE_QUEUE_CAPACITY, writer_shutdown.clone());
    tracing::info!(sqlite_path = %sqlite_path.display(), "store opened");

    let audit = Arc::new(AuditLog::new(cfg.router.audit_capacity).with_store(writer.clone()));
    let reloaded = audit.restore(store.load_recent_attempts(cfg.router.audit_capacity).await?);
    tracing::info!(reloaded, "provider attempts reloaded");
    let providers = build_providers(&cfg)?;
    let router = Router::new(cfg.router_config(), providers, audit.clone());

    let agent = Arc::new(ProcessAgent::new(
        cfg.sessions.agent_program.clone(),
        cfg.sessions.agent_args.clone(),
    ));
    let sessions = SessionManager::new(cfg.session_config()?, agent).with_store(writer.clone());
    let restored = sessions.restore(store.load_sessions().await?);
    tracing::info!(restored, "sessions restored");

    let limiter = Arc::new(RateLimiter::new(cfg.rate_limit_config()));
    let orchestrator = Arc::new(Orchestrator::new(
        cfg.orchestrator_config(),
        limiter.clone(),
        router,
        sessions.clone(),
        audit,
    ));

    let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
    let monitor = if cfg.alerts.enabled {
        let monitor = Arc::new(build_monitor(&cfg, store.as_ref(), writer.clone()).await?);
        handles.push(("alert monitor", monitor.clone().spawn(shutdown.child_token())));
        tracing::info!(
            rules = monitor.engine().rules().count(),
            "alert monitor started"
        );
        Some(monitor)
    } else {
        None
    };
    handles.push((
        "maintenance sweep",
        spawn_maintenance(
            sessions,
            limiter,
            Duration::from_secs(cfg.sessions.sweep_interval_seconds),
            shutdown.child_token(),
        ),
    ));

    let state = Arc::new(AppState {
        orchestrator,
        monitor,
        started_at,
    });

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "t2s serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    for (name, handle) in handles {
        join_with_timeout(name, handle).await;
    }
    writer_shutdown.cancel();
    join_with_timeout("store writer", writer_handle).await;

    Ok(())
}

async fn build_monitor(
    cfg: &T2sConfig,
    store: &dyn Store,
    writer: StoreWriter,
) -> Result<AlertMonitor> {
    let engine = Arc::new(AlertEngine::new(cfg.alert_rules()));
    let records = store.load_rule_state().await?;
    engine.restore(&records);

    let sampler = Arc::new(PrometheusSampler::new(
        &cfg.alerts.prometheus.url,
        cfg.alerts.prometheus.queries.clone(),
    )?);

    let recipients = cfg.general.admin_users.clone();
    let mut targets: Vec<Arc<dyn AlertNotifier>> =
        vec![Arc::new(LogNotifier::new(recipients.clone()))];
    if let Some(url) = cfg.alerts.webhook.url.as_deref().filter(|u| !u.trim().is_empty()) {
        targets.push(Arc::new(WebhookNotifier::new(url, recipients)?));
    }

    Ok(AlertMonitor::new(
        engine,
        sampler,
        Arc::new(FanoutNotifier::new(targets)),
        cfg.monitor_config(),
    )
    .with_store(writer))
}

fn build_providers(cfg: &T2sConfig) -> Result<Vec<Arc<dyn ProviderClient>>> {
    let mut providers: Vec<Arc<dyn ProviderClient>> = Vec::with_capacity(cfg.providers.len());
    for (priority, provider) in cfg.providers.iter().enumerate() {
        let client = match provider.kind {
            ProviderKind::OpenaiCompatible => OpenAiCompatibleClient::new(
                &provider.name,
                &provider.base_url,
                &provider.model,
                provider.resolved_api_key(),
                provider.streaming,
            )
            .with_context(|| format!("build provider {}", provider.name))?,
        };
        tracing::info!(
            provider = %provider.name,
            priority,
            model = %client.model(),
            streaming = provider.streaming,
            "provider configured"
        );
        providers.push(Arc::new(client));
    }
    if providers.is_empty() {
        return Err(anyhow::anyhow!("no providers configured"));
    }
    Ok(providers)
}

fn spawn_maintenance(
    sessions: SessionManager,
    limiter: Arc<RateLimiter>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let ended = sessions.sweep_idle();
                    let pruned = limiter.prune_idle();
                    if !ended.is_empty() || pruned > 0 {
                        tracing::info!(
                            sessions_ended = ended.len(),
                            buckets_pruned = pruned,
                            "maintenance sweep"
                        );
                    }
                }
            }
        }
        tracing::debug!("maintenance sweep stopped");
    })
}

async fn join_with_timeout(name: &str, handle: JoinHandle<()>) {
    match tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, handle).await {
        Ok(Ok(())) => tracing::info!(task = name, "shutdown completed"),
        Ok(Err(e)) => tracing::error!(task = name, error = %e, "task join failed during shutdown"),
        Err(_) => tracing::warn!(task = name, "task did not stop within shutdown timeout"),
    }
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
