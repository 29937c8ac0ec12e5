use crate::{
    DueNotification, HealthStore, IncidentStore, NotificationQueue, Result, SilenceStore,
    StorageError,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use vigil_common::types::{AlertHealth, IncidentState, Silence};
use vigil_common::AlertKey;

const INCIDENTS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS incidents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    alert_key TEXT NOT NULL,
    alert TEXT NOT NULL,
    open INTEGER NOT NULL,
    unevaluated INTEGER NOT NULL DEFAULT 0,
    start INTEGER NOT NULL,
    end INTEGER,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_incidents_key ON incidents(alert_key, id);
CREATE INDEX IF NOT EXISTS idx_incidents_open ON incidents(open);
";

const KEYS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS unevaluated (
    alert_key TEXT PRIMARY KEY,
    alert TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS touched (
    alert_key TEXT PRIMARY KEY,
    alert TEXT NOT NULL,
    touched_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_touched_alert ON touched(alert, touched_at);
";

const QUEUE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS due_notifications (
    alert_key TEXT NOT NULL,
    notification TEXT NOT NULL,
    due_at INTEGER NOT NULL,
    PRIMARY KEY (alert_key, notification)
);
CREATE INDEX IF NOT EXISTS idx_due_at ON due_notifications(due_at);
";

const SILENCES_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS silences (
    id TEXT PRIMARY KEY,
    start INTEGER NOT NULL,
    end INTEGER NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_silences_end ON silences(end);
";

const HEALTH_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS alert_health (
    alert TEXT PRIMARY KEY,
    successes INTEGER NOT NULL DEFAULT 0,
    failures INTEGER NOT NULL DEFAULT 0,
    failing INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    last_checked INTEGER
);
";

/// Single-file SQLite backend. All writes go through one connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (creating if needed) `vigil.db` inside `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join("vigil.db"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(INCIDENTS_SCHEMA)?;
        conn.execute_batch(KEYS_SCHEMA)?;
        conn.execute_batch(QUEUE_SCHEMA)?;
        conn.execute_batch(SILENCES_SCHEMA)?;
        conn.execute_batch(HEALTH_SCHEMA)?;
        tracing::debug!("SQLite schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the connection, recovering from a poisoned Mutex if necessary.
    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R>,
    {
        let mut conn = self.lock_conn();
        f(&mut conn)
    }
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64, column: &'static str) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(StorageError::InvalidTimestamp(ms, column))
}

fn incident_from_body(body: &str, id: i64) -> Result<IncidentState> {
    let mut state: IncidentState = serde_json::from_str(body)?;
    state.id = id;
    Ok(state)
}

fn query_incidents(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<IncidentState>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (id, body) = row?;
        out.push(incident_from_body(&body, id)?);
    }
    Ok(out)
}

fn query_keys(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<AlertKey>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?.parse::<AlertKey>()?);
    }
    Ok(out)
}

fn query_due(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<DueNotification>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (key, notification, due) = row?;
        out.push(DueNotification {
            alert_key: key.parse()?,
            notification,
            due: from_millis(due, "due_at")?,
        });
    }
    Ok(out)
}

#[async_trait]
impl IncidentStore for SqliteStore {
    async fn get_open_incident(&self, key: &AlertKey) -> Result<Option<IncidentState>> {
        self.with_conn(|conn| {
            let mut found = query_incidents(
                conn,
                "SELECT id, body FROM incidents WHERE alert_key = ?1 AND open = 1
                 ORDER BY id DESC LIMIT 1",
                params![key.to_string()],
            )?;
            Ok(found.pop())
        })
    }

    async fn get_latest_incident(&self, key: &AlertKey) -> Result<Option<IncidentState>> {
        self.with_conn(|conn| {
            let mut found = query_incidents(
                conn,
                "SELECT id, body FROM incidents WHERE alert_key = ?1 ORDER BY id DESC LIMIT 1",
                params![key.to_string()],
            )?;
            Ok(found.pop())
        })
    }

    async fn get_incident(&self, id: i64) -> Result<Option<IncidentState>> {
        self.with_conn(|conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM incidents WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            body.map(|b| incident_from_body(&b, id)).transpose()
        })
    }

    async fn update_incident(&self, state: &IncidentState) -> Result<i64> {
        let body = serde_json::to_string(state)?;
        let key = state.alert_key.to_string();
        let end = state.end.map(to_millis);
        self.with_conn(|conn| {
            if state.id == 0 {
                conn.execute(
                    "INSERT INTO incidents (alert_key, alert, open, unevaluated, start, end, body)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        key,
                        state.alert(),
                        state.open,
                        state.unevaluated,
                        to_millis(state.start),
                        end,
                        body
                    ],
                )?;
                return Ok(conn.last_insert_rowid());
            }
            conn.execute(
                "INSERT INTO incidents (id, alert_key, alert, open, unevaluated, start, end, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    open = excluded.open,
                    unevaluated = excluded.unevaluated,
                    end = excluded.end,
                    body = excluded.body",
                params![
                    state.id,
                    key,
                    state.alert(),
                    state.open,
                    state.unevaluated,
                    to_millis(state.start),
                    end,
                    body
                ],
            )?;
            Ok(state.id)
        })
    }

    async fn incident_ids_for_key(&self, key: &AlertKey) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id FROM incidents WHERE alert_key = ?1 ORDER BY id ASC")?;
            let rows = stmt.query_map(params![key.to_string()], |row| row.get::<_, i64>(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    async fn get_all_open_incidents(&self) -> Result<Vec<IncidentState>> {
        self.with_conn(|conn| {
            query_incidents(
                conn,
                "SELECT id, body FROM incidents WHERE open = 1 ORDER BY id ASC",
                [],
            )
        })
    }

    async fn set_unevaluated(&self, key: &AlertKey, unevaluated: bool) -> Result<()> {
        self.with_conn(|conn| {
            if unevaluated {
                conn.execute(
                    "INSERT OR IGNORE INTO unevaluated (alert_key, alert) VALUES (?1, ?2)",
                    params![key.to_string(), key.name()],
                )?;
            } else {
                conn.execute(
                    "DELETE FROM unevaluated WHERE alert_key = ?1",
                    params![key.to_string()],
                )?;
            }
            Ok(())
        })
    }

    async fn get_unevaluated(&self, alert: &str) -> Result<Vec<AlertKey>> {
        self.with_conn(|conn| {
            let mut keys = query_keys(
                conn,
                "SELECT alert_key FROM unevaluated WHERE alert = ?1
                 UNION
                 SELECT alert_key FROM incidents WHERE alert = ?1 AND open = 1 AND unevaluated = 1",
                params![alert],
            )?;
            keys.sort();
            keys.dedup();
            Ok(keys)
        })
    }

    async fn forget(&self, key: &AlertKey) -> Result<()> {
        let key = key.to_string();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM incidents WHERE alert_key = ?1", params![key])?;
            tx.execute("DELETE FROM unevaluated WHERE alert_key = ?1", params![key])?;
            tx.execute("DELETE FROM touched WHERE alert_key = ?1", params![key])?;
            tx.execute(
                "DELETE FROM due_notifications WHERE alert_key = ?1",
                params![key],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    async fn touch_alert_key(&self, key: &AlertKey, time: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO touched (alert_key, alert, touched_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(alert_key) DO UPDATE SET touched_at = excluded.touched_at",
                params![key.to_string(), key.name(), to_millis(time)],
            )?;
            Ok(())
        })
    }

    async fn get_untouched_since(&self, alert: &str, time: DateTime<Utc>) -> Result<Vec<AlertKey>> {
        self.with_conn(|conn| {
            let mut keys = query_keys(
                conn,
                "SELECT alert_key FROM touched WHERE alert = ?1 AND touched_at < ?2",
                params![alert, to_millis(time)],
            )?;
            keys.sort();
            Ok(keys)
        })
    }
}

#[async_trait]
impl NotificationQueue for SqliteStore {
    async fn insert_due(&self, key: &AlertKey, notification: &str, due: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO due_notifications (alert_key, notification, due_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(alert_key, notification) DO UPDATE SET due_at = excluded.due_at",
                params![key.to_string(), notification, to_millis(due)],
            )?;
            Ok(())
        })
    }

    async fn get_due(&self, now: DateTime<Utc>) -> Result<Vec<DueNotification>> {
        self.with_conn(|conn| {
            let mut due = query_due(
                conn,
                "SELECT alert_key, notification, due_at FROM due_notifications WHERE due_at <= ?1",
                params![to_millis(now)],
            )?;
            due.sort();
            Ok(due)
        })
    }

    async fn remove_entries(&self, entries: &[DueNotification]) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            for entry in entries {
                tx.execute(
                    "DELETE FROM due_notifications
                     WHERE alert_key = ?1 AND notification = ?2 AND due_at = ?3",
                    params![
                        entry.alert_key.to_string(),
                        entry.notification,
                        to_millis(entry.due)
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    async fn clear_before(&self, time: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM due_notifications WHERE due_at <= ?1",
                params![to_millis(time)],
            )?;
            if removed > 0 {
                tracing::info!(removed, "Cleared stale due notifications");
            }
            Ok(())
        })
    }

    async fn clear_for_key(&self, key: &AlertKey) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM due_notifications WHERE alert_key = ?1",
                params![key.to_string()],
            )?;
            Ok(())
        })
    }

    async fn next_due_time(&self) -> Result<Option<DateTime<Utc>>> {
        self.with_conn(|conn| {
            let min: Option<i64> =
                conn.query_row("SELECT MIN(due_at) FROM due_notifications", [], |row| {
                    row.get(0)
                })?;
            min.map(|ms| from_millis(ms, "due_at")).transpose()
        })
    }

    async fn entries_for_key(&self, key: &AlertKey) -> Result<Vec<DueNotification>> {
        self.with_conn(|conn| {
            query_due(
                conn,
                "SELECT alert_key, notification, due_at FROM due_notifications
                 WHERE alert_key = ?1 ORDER BY notification",
                params![key.to_string()],
            )
        })
    }
}

fn query_silences(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Silence>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(serde_json::from_str(&row?)?);
    }
    Ok(out)
}

#[async_trait]
impl SilenceStore for SqliteStore {
    async fn get_active_silences(&self, now: DateTime<Utc>) -> Result<Vec<Silence>> {
        let now = to_millis(now);
        self.with_conn(|conn| {
            query_silences(
                conn,
                "SELECT body FROM silences WHERE start <= ?1 AND end > ?1 ORDER BY id",
                params![now],
            )
        })
    }

    async fn list_silences(&self) -> Result<Vec<Silence>> {
        self.with_conn(|conn| query_silences(conn, "SELECT body FROM silences ORDER BY id", []))
    }

    async fn add_silence(&self, silence: &Silence) -> Result<()> {
        let body = serde_json::to_string(silence)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO silences (id, start, end, body) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    start = excluded.start, end = excluded.end, body = excluded.body",
                params![
                    silence.id,
                    to_millis(silence.start),
                    to_millis(silence.end),
                    body
                ],
            )?;
            Ok(())
        })
    }

    async fn delete_silence(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM silences WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
    }
}

fn row_to_health(row: &rusqlite::Row) -> rusqlite::Result<(AlertHealth, Option<i64>)> {
    Ok((
        AlertHealth {
            successes: row.get::<_, i64>(0)? as u64,
            failures: row.get::<_, i64>(1)? as u64,
            failing: row.get(2)?,
            last_error: row.get(3)?,
            last_checked: None,
        },
        row.get(4)?,
    ))
}

fn finish_health((mut health, checked): (AlertHealth, Option<i64>)) -> Result<AlertHealth> {
    health.last_checked = checked
        .map(|ms| from_millis(ms, "last_checked"))
        .transpose()?;
    Ok(health)
}

#[async_trait]
impl HealthStore for SqliteStore {
    async fn mark_success(&self, alert: &str, time: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO alert_health (alert, successes, failing, last_checked)
                 VALUES (?1, 1, 0, ?2)
                 ON CONFLICT(alert) DO UPDATE SET
                    successes = successes + 1, failing = 0, last_checked = excluded.last_checked",
                params![alert, to_millis(time)],
            )?;
            Ok(())
        })
    }

    async fn mark_failure(&self, alert: &str, message: &str, time: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO alert_health (alert, failures, failing, last_error, last_checked)
                 VALUES (?1, 1, 1, ?2, ?3)
                 ON CONFLICT(alert) DO UPDATE SET
                    failures = failures + 1, failing = 1,
                    last_error = excluded.last_error, last_checked = excluded.last_checked",
                params![alert, message, to_millis(time)],
            )?;
            Ok(())
        })
    }

    async fn is_failing(&self, alert: &str) -> Result<bool> {
        Ok(self.health(alert).await?.failing)
    }

    async fn health(&self, alert: &str) -> Result<AlertHealth> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT successes, failures, failing, last_error, last_checked
                     FROM alert_health WHERE alert = ?1",
                    params![alert],
                    row_to_health,
                )
                .optional()?;
            match row {
                Some(row) => finish_health(row),
                None => Ok(AlertHealth::default()),
            }
        })
    }

    async fn all_health(&self) -> Result<BTreeMap<String, AlertHealth>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT successes, failures, failing, last_error, last_checked, alert
                 FROM alert_health ORDER BY alert",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row_to_health(row)?, row.get::<_, String>(5)?))
            })?;
            let mut out = BTreeMap::new();
            for row in rows {
                let (health, alert) = row?;
                out.insert(alert, finish_health(health)?);
            }
            Ok(out)
        })
    }
}
