use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use appforge_common::{
    CapabilityConfig, GenerationMetrics, Session, SessionStatus, TimelineItem, TimelineKind,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Async-safe handle to the session database.
///
/// Wraps `SessionDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<SessionDb>>,
}

impl DbHandle {
    pub fn new(db: SessionDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&SessionDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For start-up, CLI commands
    /// and tests only; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, SessionDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// A file the generator wrote, mirrored from the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub path: String,
    pub content: String,
    pub updated_at: i64,
}

/// Session with everything recorded for it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetail {
    pub session: Session,
    pub timeline: Vec<TimelineItem>,
    pub files: Vec<StoredFile>,
}

pub struct SessionDb {
    conn: Connection,
}

impl SessionDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    prompt TEXT NOT NULL,
                    config TEXT NOT NULL DEFAULT '{}',
                    model TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'generating',
                    error TEXT,
                    metrics TEXT,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    completed_at INTEGER
                );

                CREATE TABLE IF NOT EXISTS timeline (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                    kind TEXT NOT NULL,
                    item_id TEXT NOT NULL,
                    payload TEXT NOT NULL DEFAULT '{}',
                    timestamp INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS files (
                    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                    path TEXT NOT NULL,
                    content TEXT NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (session_id, path)
                );

                CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status, created_at);
                CREATE INDEX IF NOT EXISTS idx_timeline_session ON timeline(session_id, id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Sessions ──────────────────────────────────────────────────────

    pub fn create_session(&self, session: &Session) -> Result<()> {
        let config = serde_json::to_string(&session.config).context("Failed to encode config")?;
        let metrics = session
            .metrics
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode metrics")?;
        self.conn
            .execute(
                "INSERT INTO sessions (id, prompt, config, model, status, error, metrics, created_at, updated_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    session.id.to_string(),
                    session.prompt,
                    config,
                    session.model,
                    session.status.as_str(),
                    session.error,
                    metrics,
                    session.created_at.timestamp_millis(),
                    session.updated_at.timestamp_millis(),
                    session.completed_at.map(|t| t.timestamp_millis()),
                ],
            )
            .context("Failed to insert session")?;
        Ok(())
    }

    pub fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
                params![id.to_string()],
                SessionRow::from_row,
            )
            .optional()
            .context("Failed to query session")?;
        row.map(SessionRow::into_session).transpose()
    }

    /// All sessions, newest first.
    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        self.query_sessions(
            &format!("SELECT {} FROM sessions ORDER BY created_at DESC", SESSION_COLUMNS),
            [],
        )
    }

    /// Sessions still marked generating.
    pub fn list_generating(&self) -> Result<Vec<Session>> {
        self.query_sessions(
            &format!(
                "SELECT {} FROM sessions WHERE status = 'generating' ORDER BY created_at",
                SESSION_COLUMNS
            ),
            [],
        )
    }

    /// Sessions in `generating` strictly older than `threshold_ms` at `now`.
    pub fn find_stuck_sessions(&self, threshold_ms: i64, now: DateTime<Utc>) -> Result<Vec<Session>> {
        Ok(self
            .list_generating()?
            .into_iter()
            .filter(|s| s.is_stuck(now, threshold_ms))
            .collect())
    }

    /// Move a session to a terminal status. Returns false when the session
    /// does not exist.
    pub fn finish_session(
        &self,
        id: Uuid,
        status: SessionStatus,
        error: Option<&str>,
        metrics: Option<&GenerationMetrics>,
    ) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let metrics = metrics
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode metrics")?;
        let completed_at = status.is_terminal().then_some(now);
        let changed = self
            .conn
            .execute(
                "UPDATE sessions
                 SET status = ?1, error = ?2, metrics = COALESCE(?3, metrics), updated_at = ?4, completed_at = ?5
                 WHERE id = ?6",
                params![status.as_str(), error, metrics, now, completed_at, id.to_string()],
            )
            .context("Failed to update session")?;
        Ok(changed > 0)
    }

    /// Delete a session; its timeline and files cascade.
    pub fn delete_session(&self, id: Uuid) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM sessions WHERE id = ?1", params![id.to_string()])
            .context("Failed to delete session")?;
        Ok(changed > 0)
    }

    pub fn get_session_detail(&self, id: Uuid) -> Result<Option<SessionDetail>> {
        let Some(session) = self.get_session(id)? else {
            return Ok(None);
        };
        Ok(Some(SessionDetail {
            session,
            timeline: self.get_timeline(id)?,
            files: self.list_files(id)?,
        }))
    }

    fn query_sessions<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Session>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare session query")?;
        let rows = stmt
            .query_map(params, SessionRow::from_row)
            .context("Failed to query sessions")?;
        let mut sessions = Vec::new();
        for row in rows {
            let r = row.context("Failed to read session row")?;
            sessions.push(r.into_session()?);
        }
        Ok(sessions)
    }

    // ── Timeline ──────────────────────────────────────────────────────

    pub fn append_timeline(
        &self,
        session_id: Uuid,
        kind: TimelineKind,
        item_id: &str,
        payload: &Value,
        timestamp: i64,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO timeline (session_id, kind, item_id, payload, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    session_id.to_string(),
                    kind.as_str(),
                    item_id,
                    payload.to_string(),
                    timestamp
                ],
            )
            .context("Failed to insert timeline item")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Timeline in insertion order.
    pub fn get_timeline(&self, session_id: Uuid) -> Result<Vec<TimelineItem>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, kind, item_id, payload, timestamp FROM timeline WHERE session_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare get_timeline")?;
        let rows = stmt
            .query_map(params![session_id.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .context("Failed to query timeline")?;
        let mut items = Vec::new();
        for row in rows {
            let (id, kind, item_id, payload, timestamp) = row.context("Failed to read timeline row")?;
            let kind = TimelineKind::from_str(&kind)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to parse timeline kind")?;
            let payload: Value =
                serde_json::from_str(&payload).context("Failed to parse timeline payload")?;
            items.push(TimelineItem {
                id,
                session_id,
                kind,
                item_id,
                payload,
                timestamp,
            });
        }
        Ok(items)
    }

    // ── Files ─────────────────────────────────────────────────────────

    pub fn upsert_file(&self, session_id: Uuid, path: &str, content: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO files (session_id, path, content, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(session_id, path) DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at",
                params![session_id.to_string(), path, content, Utc::now().timestamp_millis()],
            )
            .context("Failed to upsert file")?;
        Ok(())
    }

    pub fn list_files(&self, session_id: Uuid) -> Result<Vec<StoredFile>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path, content, updated_at FROM files WHERE session_id = ?1 ORDER BY path")
            .context("Failed to prepare list_files")?;
        let rows = stmt
            .query_map(params![session_id.to_string()], |row| {
                Ok(StoredFile {
                    path: row.get(0)?,
                    content: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })
            .context("Failed to query files")?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row.context("Failed to read file row")?);
        }
        Ok(files)
    }
}

const SESSION_COLUMNS: &str =
    "id, prompt, config, model, status, error, metrics, created_at, updated_at, completed_at";

/// Intermediate row struct for reading sessions before converting the
/// id / status / JSON columns into typed values.
struct SessionRow {
    id: String,
    prompt: String,
    config: String,
    model: String,
    status: String,
    error: Option<String>,
    metrics: Option<String>,
    created_at: i64,
    updated_at: i64,
    completed_at: Option<i64>,
}

impl SessionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            prompt: row.get(1)?,
            config: row.get(2)?,
            model: row.get(3)?,
            status: row.get(4)?,
            error: row.get(5)?,
            metrics: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            completed_at: row.get(9)?,
        })
    }

    fn into_session(self) -> Result<Session> {
        let id = Uuid::parse_str(&self.id).context("Failed to parse session id")?;
        let status = SessionStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse session status")?;
        let config: CapabilityConfig =
            serde_json::from_str(&self.config).context("Failed to parse session config JSON")?;
        let metrics = self
            .metrics
            .as_deref()
            .map(serde_json::from_str::<GenerationMetrics>)
            .transpose()
            .context("Failed to parse session metrics JSON")?;
        Ok(Session {
            id,
            prompt: self.prompt,
            config,
            model: self.model,
            status,
            error: self.error,
            metrics,
            created_at: millis_to_datetime(self.created_at)?,
            updated_at: millis_to_datetime(self.updated_at)?,
            completed_at: self.completed_at.map(millis_to_datetime).transpose()?,
        })
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).with_context(|| format!("Timestamp out of range: {}", ms))
}

// ── Tests ─────────────────────────────────────────────────────────────
