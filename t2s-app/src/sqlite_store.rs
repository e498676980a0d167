//! SQLite-backed [`Store`]. Every call hops onto the blocking pool; the
//! connection itself is serialized behind a mutex.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use t2s_core::{AlertEvent, OwnerId, ProviderAttempt, RuleStateRecord, Session, Store};
use t2s_llm::Usage;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
  id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL,
  state TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS sessions_owner ON sessions(owner_id);
CREATE TABLE IF NOT EXISTS rule_state (
  rule TEXT PRIMARY KEY,
  last_fired_at TEXT,
  active INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS provider_attempts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  request_id TEXT NOT NULL,
  requester TEXT NOT NULL,
  provider TEXT NOT NULL,
  started_at TEXT NOT NULL,
  latency_ms INTEGER NOT NULL,
  outcome TEXT NOT NULL,
  detail TEXT,
  prompt_tokens INTEGER,
  completion_tokens INTEGER
);
CREATE INDEX IF NOT EXISTS provider_attempts_request ON provider_attempts(request_id);
CREATE TABLE IF NOT EXISTS alerts (
  id TEXT PRIMARY KEY,
  rule TEXT NOT NULL,
  at TEXT NOT NULL,
  data TEXT NOT NULL
);
"#;

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create data dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open sqlite store {}", path.display()))?;
        conn.busy_timeout(Duration::from_millis(1000))
            .context("set sqlite busy timeout")?;
        conn.execute_batch(SCHEMA).context("apply sqlite schema")?;
        for column in ["prompt_tokens", "completion_tokens"] {
            add_column_if_missing(&conn, "provider_attempts", column, "INTEGER")?;
        }
        tracing::info!(path = %path.display(), "sqlite store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&conn)
        })
        .await
        .context("sqlite task join")?
    }
}

/// Older databases predate the token columns.
fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    decl: &str,
) -> anyhow::Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    if !names.iter().any(|name| name == column) {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))
            .with_context(|| format!("add column {table}.{column}"))?;
        tracing::info!(table, column, "sqlite column added");
    }
    Ok(())
}

fn parse_ts(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp {raw:?}"))?
        .with_timezone(&Utc))
}

#[async_trait]
impl Store for SqliteStore {
    async fn load_sessions(&self) -> anyhow::Result<Vec<Session>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT data FROM sessions ORDER BY created_at")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut sessions = Vec::new();
            for row in rows {
                let data = row?;
                match serde_json::from_str::<Session>(&data) {
                    Ok(session) => sessions.push(session),
                    Err(e) => tracing::warn!(error = %e, "skipping unreadable session row"),
                }
            }
            Ok(sessions)
        })
        .await
    }

    async fn save_session(&self, session: &Session) -> anyhow::Result<()> {
        let session = session.clone();
        self.with_conn(move |conn| {
            let data = serde_json::to_string(&session)?;
            conn.execute(
                "INSERT INTO sessions (id, owner_id, state, created_at, updated_at, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                   state = excluded.state,
                   updated_at = excluded.updated_at,
                   data = excluded.data",
                params![
                    session.id.to_string(),
                    session.owner.as_str(),
                    session.state.as_str(),
                    session.created_at.to_rfc3339(),
                    session.last_activity_at.to_rfc3339(),
                    data,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_rule_state(&self) -> anyhow::Result<Vec<RuleStateRecord>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT rule, last_fired_at, active FROM rule_state ORDER BY rule")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (rule, last_fired_at, active) = row?;
                out.push(RuleStateRecord {
                    rule,
                    last_fired_at: last_fired_at.as_deref().map(parse_ts).transpose()?,
                    active: active != 0,
                });
            }
            Ok(out)
        })
        .await
    }

    async fn save_rule_state(&self, state: &RuleStateRecord) -> anyhow::Result<()> {
        let state = state.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO rule_state (rule, last_fired_at, active) VALUES (?1, ?2, ?3)
                 ON CONFLICT(rule) DO UPDATE SET
                   last_fired_at = excluded.last_fired_at,
                   active = excluded.active",
                params![
                    state.rule,
                    state.last_fired_at.map(|t| t.to_rfc3339()),
                    i64::from(state.active),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn append_attempt(&self, attempt: &ProviderAttempt) -> anyhow::Result<()> {
        let attempt = attempt.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO provider_attempts
                   (request_id, requester, provider, started_at, latency_ms, outcome, detail,
                    prompt_tokens, completion_tokens)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    attempt.request_id.to_string(),
                    attempt.requester.as_str(),
                    attempt.provider,
                    attempt.started_at.to_rfc3339(),
                    i64::try_from(attempt.latency_ms).unwrap_or(i64::MAX),
                    attempt.outcome.to_string(),
                    attempt.detail,
                    attempt.usage.map(|u| u.prompt_tokens),
                    attempt.usage.map(|u| u.completion_tokens),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_recent_attempts(&self, limit: usize) -> anyhow::Result<Vec<ProviderAttempt>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT request_id, requester, provider, started_at, latency_ms, outcome, detail,
                        prompt_tokens, completion_tokens
                 FROM provider_attempts ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<u32>>(7)?,
                    row.get::<_, Option<u32>>(8)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (
                    request_id,
                    requester,
                    provider,
                    started_at,
                    latency_ms,
                    outcome,
                    detail,
                    prompt,
                    completion,
                ) = row?;
                let outcome = match outcome.parse() {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping unreadable attempt row");
                        continue;
                    }
                };
                out.push(ProviderAttempt {
                    request_id: uuid::Uuid::parse_str(&request_id)
                        .with_context(|| format!("bad request id {request_id:?}"))?,
                    requester: OwnerId::new(requester),
                    provider,
                    started_at: parse_ts(&started_at)?,
                    latency_ms: u64::try_from(latency_ms).unwrap_or(0),
                    outcome,
                    detail,
                    usage: prompt.zip(completion).map(|(prompt_tokens, completion_tokens)| Usage {
                        prompt_tokens,
                        completion_tokens,
                    }),
                });
            }
            out.reverse();
            Ok(out)
        })
        .await
    }

    async fn append_alert(&self, event: &AlertEvent) -> anyhow::Result<()> {
        let event = event.clone();
        self.with_conn(move |conn| {
            let data = serde_json::to_string(&event)?;
            conn.execute(
                "INSERT OR IGNORE INTO alerts (id, rule, at, data) VALUES (?1, ?2, ?3, ?4)",
                params![event.id.to_string(), event.rule, event.at.to_rfc3339(), data],
            )?;
            Ok(())
        })
        .await
    }
}

impl SqliteStore {
    pub async fn alert_count(&self) -> anyhow::Result<u64> {
        self.with_conn(|conn| {
            let count: Option<i64> = conn
                .query_row("SELECT COUNT(*) FROM alerts", [], |row| row.get(0))
                .optional()?;
            Ok(count.unwrap_or(0).max(0) as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use t2s_core::{AlertKind, AttemptOutcome, SessionState, Severity};

    async fn attempts_for(store: &SqliteStore, request_id: uuid::Uuid) -> Vec<(String, String)> {
        store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT provider, outcome FROM provider_attempts WHERE request_id = ?1 ORDER BY id",
                )?;
                let rows = stmt.query_map([request_id.to_string()], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .expect("attempts")
    }

    fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(&dir.path().join("nested").join("t2s.sqlite3")).expect("open");
        (dir, store)
    }

    #[tokio::test]
    async fn sessions_upsert_and_reload() {
        let (_dir, store) = store();
        let mut session = Session::new(OwnerId::new("42"), "/srv".to_string(), Utc::now());
        store.save_session(&session).await.expect("insert");
        session.state = SessionState::Ended;
        session.tasks_completed = 2;
        store.save_session(&session).await.expect("update");

        let loaded = store.load_sessions().await.expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].state, SessionState::Ended);
        assert_eq!(loaded[0].tasks_completed, 2);
        assert_eq!(loaded[0].owner, OwnerId::new("42"));
    }

    #[tokio::test]
    async fn rule_state_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t2s.sqlite3");
        let fired = Utc::now();
        {
            let store = SqliteStore::open(&path).expect("open");
            store
                .save_rule_state(&RuleStateRecord {
                    rule: "disk_usage".to_string(),
                    last_fired_at: Some(fired),
                    active: true,
                })
                .await
                .expect("save");
        }
        let store = SqliteStore::open(&path).expect("reopen");
        let rules = store.load_rule_state().await.expect("load");
        assert_eq!(rules.len(), 1);
        assert!(rules[0].active);
        let got = rules[0].last_fired_at.expect("fired");
        assert_eq!(got.timestamp_millis(), fired.timestamp_millis());
    }

    #[tokio::test]
    async fn attempts_and_alerts_append() {
        let (_dir, store) = store();
        let request_id = uuid::Uuid::new_v4();
        for (provider, outcome) in [("local", AttemptOutcome::Timeout), ("groq", AttemptOutcome::Success)] {
            store
                .append_attempt(&ProviderAttempt {
                    request_id,
                    requester: OwnerId::new("42"),
                    provider: provider.to_string(),
                    started_at: Utc::now(),
                    latency_ms: 12,
                    outcome,
                    detail: None,
                    usage: (outcome == AttemptOutcome::Success).then_some(Usage {
                        prompt_tokens: 10,
                        completion_tokens: 5,
                    }),
                })
                .await
                .expect("append");
        }
        let rows = attempts_for(&store, request_id).await;
        assert_eq!(
            rows,
            vec![
                ("local".to_string(), "timeout".to_string()),
                ("groq".to_string(), "success".to_string()),
            ]
        );

        let event = AlertEvent {
            id: uuid::Uuid::new_v4(),
            rule: "disk_usage".to_string(),
            metric: "disk_percent".to_string(),
            kind: AlertKind::Fired,
            severity: Severity::Critical,
            value: 97.0,
            threshold: 90.0,
            message: "disk".to_string(),
            at: Utc::now(),
        };
        store.append_alert(&event).await.expect("alert");
        store.append_alert(&event).await.expect("duplicate ignored");
        assert_eq!(store.alert_count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn recent_attempts_reload_after_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t2s.sqlite3");
        {
            let store = SqliteStore::open(&path).expect("open");
            for (provider, outcome) in [
                ("local", AttemptOutcome::Timeout),
                ("groq", AttemptOutcome::Error),
                ("cloud", AttemptOutcome::Success),
            ] {
                store
                    .append_attempt(&ProviderAttempt {
                        request_id: uuid::Uuid::new_v4(),
                        requester: OwnerId::new("42"),
                        provider: provider.to_string(),
                        started_at: Utc::now(),
                        latency_ms: 7,
                        outcome,
                        detail: None,
                        usage: (outcome == AttemptOutcome::Success).then_some(Usage {
                            prompt_tokens: 3,
                            completion_tokens: 4,
                        }),
                    })
                    .await
                    .expect("append");
            }
        }
        let store = SqliteStore::open(&path).expect("reopen");
        let recent = store.load_recent_attempts(2).await.expect("load");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].provider, "groq");
        assert_eq!(recent[0].outcome, AttemptOutcome::Error);
        assert_eq!(recent[0].usage, None);
        assert_eq!(recent[1].provider, "cloud");
        assert_eq!(
            recent[1].usage,
            Some(Usage {
                prompt_tokens: 3,
                completion_tokens: 4
            })
        );
    }

    #[tokio::test]
    async fn legacy_attempt_table_gains_token_columns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t2s.sqlite3");
        {
            let conn = Connection::open(&path).expect("open raw");
            conn.execute_batch(
                "CREATE TABLE provider_attempts (
                   id INTEGER PRIMARY KEY AUTOINCREMENT,
                   request_id TEXT NOT NULL,
                   requester TEXT NOT NULL,
                   provider TEXT NOT NULL,
                   started_at TEXT NOT NULL,
                   latency_ms INTEGER NOT NULL,
                   outcome TEXT NOT NULL,
                   detail TEXT
                 );",
            )
            .expect("legacy schema");
        }
        let store = SqliteStore::open(&path).expect("open migrates");
        store
            .append_attempt(&ProviderAttempt {
                request_id: uuid::Uuid::new_v4(),
                requester: OwnerId::new("42"),
                provider: "cloud".to_string(),
                started_at: Utc::now(),
                latency_ms: 1,
                outcome: AttemptOutcome::Success,
                detail: None,
                usage: Some(Usage::default()),
            })
            .await
            .expect("append");
        assert_eq!(store.load_recent_attempts(10).await.expect("load").len(), 1);
    }
}
