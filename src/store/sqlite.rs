//! SQLite-backed action store.
//!
//! Claims and transitions run inside `BEGIN IMMEDIATE` transactions and end in
//! `UPDATE ... WHERE id = ? AND status = ?`, so several worker processes can
//! share one database file without double-dispatching or double-finalizing.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::{ActionStore, StoreError, Transition};
use crate::adapters::Handle;
use crate::domain::{Action, ActionId, ActionKind, ActionStatus, Server, ServerId, ServerSpec};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS servers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    image TEXT NOT NULL,
    server_type TEXT NOT NULL,
    datacenter TEXT NOT NULL,
    ipv4_address TEXT,
    is_deprovisioned INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS actions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'QUEUED',
    progress INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    server_id INTEGER NOT NULL REFERENCES servers(id),
    handle TEXT,
    dispatch_attempts INTEGER NOT NULL DEFAULT 0,
    failure_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_actions_status_created ON actions(status, created_at, id);
CREATE INDEX IF NOT EXISTS idx_actions_status_started ON actions(status, started_at, id);
CREATE INDEX IF NOT EXISTS idx_actions_server ON actions(server_id, status);
"#;

const ACTION_COLUMNS: &str = "id, kind, status, progress, created_at, started_at, finished_at, \
                              server_id, handle, dispatch_attempts, failure_reason";

/// True for rows the identity rule lets RUNNING right now
const IDENTITY_FREE: &str = "NOT (
    kind IN ('CREATE_SERVER', 'DELETE_SERVER')
    AND EXISTS (
      SELECT 1 FROM actions other
      WHERE other.server_id = actions.server_id
        AND other.id != actions.id
        AND other.status = 'RUNNING'
        AND other.kind IN ('CREATE_SERVER', 'DELETE_SERVER')
    )
  )";

const SERVER_COLUMNS: &str =
    "id, name, image, server_type, datacenter, ipv4_address, is_deprovisioned, created_at";

/// Action store persisted in a SQLite database file
#[derive(Debug, Clone)]
pub struct SqliteActionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteActionStore {
    /// Open (or create) the database at `path` and apply the schema
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(path)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::init(conn)
    }

    /// Private in-memory database, mostly for tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StoreError::Unavailable(format!("connection lock poisoned: {}", e)))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {}", e)))?
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

fn parse_ts(column: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| conversion_error(column, format!("bad timestamp '{}': {}", value, e)))
}

fn parse_opt_ts(column: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(column, v)).transpose()
}

fn action_from_row(row: &Row<'_>) -> rusqlite::Result<Action> {
    let kind: String = row.get(1)?;
    let status: String = row.get(2)?;
    let progress: i64 = row.get(3)?;
    let dispatch_attempts: i64 = row.get(9)?;

    Ok(Action {
        id: row.get(0)?,
        kind: kind.parse().map_err(|e: String| conversion_error(1, e))?,
        status: status.parse().map_err(|e: String| conversion_error(2, e))?,
        progress: progress.clamp(0, 100) as u8,
        created_at: parse_ts(4, row.get(4)?)?,
        started_at: parse_opt_ts(5, row.get(5)?)?,
        finished_at: parse_opt_ts(6, row.get(6)?)?,
        target_server_id: row.get(7)?,
        handle: row.get::<_, Option<String>>(8)?.map(Handle::new),
        dispatch_attempts: u32::try_from(dispatch_attempts)
            .map_err(|_| conversion_error(9, format!("bad dispatch_attempts {}", dispatch_attempts)))?,
        failure_reason: row.get(10)?,
    })
}

fn server_from_row(row: &Row<'_>) -> rusqlite::Result<Server> {
    Ok(Server {
        id: row.get(0)?,
        name: row.get(1)?,
        image: row.get(2)?,
        server_type: row.get(3)?,
        datacenter: row.get(4)?,
        ipv4_address: row.get(5)?,
        is_deprovisioned: row.get(6)?,
        created_at: parse_ts(7, row.get(7)?)?,
    })
}

fn load_action(conn: &Connection, id: ActionId) -> Result<Option<Action>, StoreError> {
    let sql = format!("SELECT {} FROM actions WHERE id = ?1", ACTION_COLUMNS);
    Ok(conn.query_row(&sql, params![id], action_from_row).optional()?)
}

fn load_server(conn: &Connection, id: ServerId) -> Result<Option<Server>, StoreError> {
    let sql = format!("SELECT {} FROM servers WHERE id = ?1", SERVER_COLUMNS);
    Ok(conn.query_row(&sql, params![id], server_from_row).optional()?)
}

fn select_by_status(
    conn: &Connection,
    status: ActionStatus,
    filter: Option<&str>,
    order_by: &str,
    limit: usize,
) -> Result<Vec<Action>, StoreError> {
    let sql = format!(
        "SELECT {} FROM actions WHERE status = ?1{} ORDER BY {} LIMIT ?2",
        ACTION_COLUMNS,
        filter.map(|f| format!(" AND {}", f)).unwrap_or_default(),
        order_by
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![status.as_str(), limit as i64], action_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[async_trait]
impl ActionStore for SqliteActionStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }

    async fn select_queued(&self, limit: usize) -> Result<Vec<Action>, StoreError> {
        self.with_conn(move |conn| {
            select_by_status(
                conn,
                ActionStatus::Queued,
                Some(IDENTITY_FREE),
                "created_at ASC, id ASC",
                limit,
            )
        })
        .await
    }

    async fn claim(&self, id: ActionId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let sql = format!(
                "UPDATE actions SET status = 'RUNNING', started_at = ?2
                 WHERE id = ?1 AND status = 'QUEUED' AND {}",
                IDENTITY_FREE
            );
            let changed = tx.execute(&sql, params![id, format_ts(now)])?;

            if changed == 0 && load_action(&tx, id)?.is_none() {
                return Err(StoreError::NotFound { entity: "action", id });
            }

            tx.commit()?;
            Ok(changed == 1)
        })
        .await
    }

    async fn select_running(&self, limit: usize) -> Result<Vec<Action>, StoreError> {
        self.with_conn(move |conn| {
            select_by_status(conn, ActionStatus::Running, None, "started_at ASC, id ASC", limit)
        })
        .await
    }

    async fn commit_transition(
        &self,
        id: ActionId,
        expected: ActionStatus,
        transition: Transition,
    ) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let Some(mut action) = load_action(&tx, id)? else {
                return Err(StoreError::NotFound { entity: "action", id });
            };
            if action.status != expected {
                return Ok(false);
            }

            transition.apply(&mut action)?;

            let changed = tx.execute(
                "UPDATE actions
                 SET status = ?3, progress = ?4, started_at = ?5, finished_at = ?6,
                     handle = ?7, dispatch_attempts = ?8, failure_reason = ?9
                 WHERE id = ?1 AND status = ?2",
                params![
                    id,
                    expected.as_str(),
                    action.status.as_str(),
                    i64::from(action.progress),
                    action.started_at.map(format_ts),
                    action.finished_at.map(format_ts),
                    action.handle.as_ref().map(|h| h.as_str().to_string()),
                    i64::from(action.dispatch_attempts),
                    action.failure_reason,
                ],
            )?;
            if changed == 0 {
                return Ok(false);
            }

            if let Some(patch) = transition.server_patch() {
                let mut server = load_server(&tx, action.target_server_id)?.ok_or(
                    StoreError::NotFound {
                        entity: "server",
                        id: action.target_server_id,
                    },
                )?;
                patch.apply(&mut server);
                tx.execute(
                    "UPDATE servers SET ipv4_address = ?2, is_deprovisioned = ?3 WHERE id = ?1",
                    params![server.id, server.ipv4_address, server.is_deprovisioned],
                )?;
            }

            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn create_server(
        &self,
        spec: ServerSpec,
        now: DateTime<Utc>,
    ) -> Result<Server, StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO servers (name, image, server_type, datacenter, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    spec.name,
                    spec.image,
                    spec.server_type,
                    spec.datacenter,
                    format_ts(now)
                ],
            )?;
            let id = conn.last_insert_rowid();
            load_server(conn, id)?.ok_or(StoreError::Corrupt(format!(
                "server {} vanished after insert",
                id
            )))
        })
        .await
    }

    async fn enqueue(
        &self,
        server_id: ServerId,
        kind: ActionKind,
        now: DateTime<Utc>,
    ) -> Result<Action, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            if load_server(&tx, server_id)?.is_none() {
                return Err(StoreError::NotFound {
                    entity: "server",
                    id: server_id,
                });
            }
            tx.execute(
                "INSERT INTO actions (kind, status, created_at, server_id)
                 VALUES (?1, 'QUEUED', ?2, ?3)",
                params![kind.as_str(), format_ts(now), server_id],
            )?;
            let id = tx.last_insert_rowid();
            let action = load_action(&tx, id)?.ok_or(StoreError::Corrupt(format!(
                "action {} vanished after insert",
                id
            )))?;
            tx.commit()?;
            Ok(action)
        })
        .await
    }

    async fn get_action(&self, id: ActionId) -> Result<Option<Action>, StoreError> {
        self.with_conn(move |conn| load_action(conn, id)).await
    }

    async fn get_server(&self, id: ServerId) -> Result<Option<Server>, StoreError> {
        self.with_conn(move |conn| load_server(conn, id)).await
    }

    async fn list_actions(
        &self,
        status: Option<ActionStatus>,
        limit: usize,
    ) -> Result<Vec<Action>, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM actions
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY id DESC LIMIT ?2",
                ACTION_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![status.map(|s| s.as_str()), limit as i64],
                action_from_row,
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}
