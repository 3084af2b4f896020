//! SQLite persistence for turnwatch-daemon.
//!
//! Every process that monitors the fleet opens the same database file. WAL
//! mode plus a busy timeout lets them write concurrently; the advisory-lock
//! table (see `lock`) is what serializes per-entity critical sections.
//!
//! Connections come from a bounded r2d2 pool shared by work connections and
//! lock sessions, so a locked critical section consumes two checkouts.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use turnwatch_protocol::{BroadcastEvent, EntityRegistration};

pub const DEFAULT_POOL_SIZE: usize = 24;
pub const DEFAULT_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(10);
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_CHECKOUT_TIMEOUT: Duration = Duration::from_millis(1);

// ─────────────────────────────────────────────────────────────────────────────
// Connection pool
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub capacity: usize,
    pub checkout_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_POOL_SIZE,
            checkout_timeout: DEFAULT_CHECKOUT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    pub idle: usize,
    pub peak_in_use: usize,
}

/// Applied to every connection r2d2 opens.
#[derive(Debug)]
struct SqlitePragmas;

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct CheckoutCounters {
    in_use: AtomicUsize,
    peak: AtomicUsize,
}

/// Bounded set of SQLite connections. Checkout waits up to the configured
/// timeout for a free slot and then fails rather than queueing forever.
#[derive(Clone)]
pub struct ConnectionPool {
    pool: r2d2::Pool<SqliteConnectionManager>,
    counters: Arc<CheckoutCounters>,
}

impl ConnectionPool {
    pub fn new(path: &Path, options: PoolOptions) -> Result<Self, String> {
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create daemon data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let manager = SqliteConnectionManager::file(path).with_flags(flags);
        let capacity = u32::try_from(options.capacity.max(1)).unwrap_or(u32::MAX);

        let pool = r2d2::Pool::builder()
            .max_size(capacity)
            .min_idle(Some(0))
            .connection_timeout(options.checkout_timeout.max(MIN_CHECKOUT_TIMEOUT))
            .connection_customizer(Box::new(SqlitePragmas))
            .build(manager)
            .map_err(|err| format!("Failed to build connection pool: {}", err))?;

        Ok(Self {
            pool,
            counters: Arc::new(CheckoutCounters::default()),
        })
    }

    pub fn checkout(&self) -> Result<PooledConnection, String> {
        let conn = self.pool.get().map_err(|err| {
            format!(
                "Connection pool exhausted ({} of {} in use): {}",
                self.counters.in_use.load(Ordering::SeqCst),
                self.pool.max_size(),
                err
            )
        })?;

        let in_use = self.counters.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(in_use, Ordering::SeqCst);
        Ok(PooledConnection {
            conn,
            counters: Arc::clone(&self.counters),
        })
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.pool.state();
        PoolStats {
            capacity: self.pool.max_size() as usize,
            in_use: self.counters.in_use.load(Ordering::SeqCst),
            idle: state.idle_connections as usize,
            peak_in_use: self.counters.peak.load(Ordering::SeqCst),
        }
    }
}

/// A checked-out connection. Dropping it returns the connection to the pool.
pub struct PooledConnection {
    conn: r2d2::PooledConnection<SqliteConnectionManager>,
    counters: Arc<CheckoutCounters>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.counters.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityRecord {
    pub id: i64,
    pub external_id: String,
    pub pid: Option<u32>,
    pub transcript_path: Option<String>,
    pub terminal_target: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
    pub context_percent: Option<u8>,
    pub context_updated_at: Option<DateTime<Utc>>,
}

impl EntityRecord {
    pub fn is_live(&self) -> bool {
        self.ended_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastRow {
    pub id: i64,
    pub event_type: String,
    pub entity_id: i64,
    pub recorded_at: String,
    pub payload: serde_json::Value,
}

// ─────────────────────────────────────────────────────────────────────────────
// Db
// ─────────────────────────────────────────────────────────────────────────────

pub struct Db {
    path: PathBuf,
    pool: ConnectionPool,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        Self::with_pool(path, PoolOptions::default())
    }

    pub fn with_pool(path: PathBuf, options: PoolOptions) -> Result<Self, String> {
        let pool = ConnectionPool::new(&path, options)?;
        let db = Self { path, pool };
        db.init_schema()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub(crate) fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.pool.checkout()?;
        op(&mut *conn)
    }

    // ── entities ────────────────────────────────────────────────────────────

    /// Upserts by external id. Re-registering an ended entity revives it; a
    /// changed transcript path resets the transcript cursor.
    pub fn register_entity(
        &self,
        registration: &EntityRegistration,
        now: DateTime<Utc>,
    ) -> Result<EntityRecord, String> {
        let now = format_ts(now);
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| format!("Failed to begin registration: {}", err))?;

            let previous: Option<(i64, Option<String>)> = tx
                .query_row(
                    "SELECT id, transcript_path FROM entities WHERE external_id = ?1",
                    params![registration.external_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(|err| format!("Failed to query entity: {}", err))?;

            tx.execute(
                "INSERT INTO entities \
                    (external_id, pid, transcript_path, terminal_target, created_at, last_seen_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5) \
                 ON CONFLICT(external_id) DO UPDATE SET \
                    pid = COALESCE(excluded.pid, entities.pid), \
                    transcript_path = COALESCE(excluded.transcript_path, entities.transcript_path), \
                    terminal_target = COALESCE(excluded.terminal_target, entities.terminal_target), \
                    last_seen_at = excluded.last_seen_at, \
                    ended_at = NULL, \
                    end_reason = NULL",
                params![
                    registration.external_id,
                    registration.pid.map(i64::from),
                    registration.transcript_path,
                    registration.terminal_target,
                    now
                ],
            )
            .map_err(|err| format!("Failed to upsert entity: {}", err))?;

            if let Some((entity_id, previous_path)) = previous {
                let path_changed = registration.transcript_path.is_some()
                    && registration.transcript_path != previous_path;
                if path_changed {
                    tx.execute(
                        "DELETE FROM transcript_cursors WHERE entity_id = ?1",
                        params![entity_id],
                    )
                    .map_err(|err| format!("Failed to reset transcript cursor: {}", err))?;
                }
            }

            let record = tx
                .query_row(
                    &format!("{} WHERE external_id = ?1", ENTITY_SELECT),
                    params![registration.external_id],
                    entity_from_row,
                )
                .map_err(|err| format!("Failed to load registered entity: {}", err))?;

            tx.commit()
                .map_err(|err| format!("Failed to commit registration: {}", err))?;
            Ok(record)
        })
    }

    pub fn get_entity(&self, entity_id: i64) -> Result<Option<EntityRecord>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                &format!("{} WHERE id = ?1", ENTITY_SELECT),
                params![entity_id],
                entity_from_row,
            )
            .optional()
            .map_err(|err| format!("Failed to query entity: {}", err))
        })
    }

    pub fn list_live_entities(&self) -> Result<Vec<EntityRecord>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "{} WHERE ended_at IS NULL ORDER BY id ASC",
                    ENTITY_SELECT
                ))
                .map_err(|err| format!("Failed to prepare entities query: {}", err))?;
            let rows = stmt
                .query_map([], entity_from_row)
                .map_err(|err| format!("Failed to query entities: {}", err))?;

            let mut entities = Vec::new();
            for row in rows {
                entities.push(row.map_err(|err| format!("Failed to decode entity row: {}", err))?);
            }
            Ok(entities)
        })
    }

    pub fn touch_entity(&self, entity_id: i64, now: DateTime<Utc>) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE entities SET last_seen_at = MAX(last_seen_at, ?2) WHERE id = ?1",
                params![entity_id, format_ts(now)],
            )
            .map_err(|err| format!("Failed to touch entity: {}", err))?;
            Ok(())
        })
    }

    /// Marks an entity ended. Returns false if it was unknown or already ended.
    pub fn end_entity(
        &self,
        entity_id: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, String> {
        self.with_connection(|conn| {
            let changed = conn
                .execute(
                    "UPDATE entities SET ended_at = ?2, end_reason = ?3 \
                     WHERE id = ?1 AND ended_at IS NULL",
                    params![entity_id, format_ts(now), reason],
                )
                .map_err(|err| format!("Failed to end entity: {}", err))?;
            Ok(changed > 0)
        })
    }

    pub fn update_context(
        &self,
        entity_id: i64,
        percent: u8,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE entities SET context_percent = ?2, context_updated_at = ?3 WHERE id = ?1",
                params![entity_id, i64::from(percent), format_ts(now)],
            )
            .map_err(|err| format!("Failed to update context usage: {}", err))?;
            Ok(())
        })
    }

    // ── transcript cursors ──────────────────────────────────────────────────

    pub fn transcript_cursor(&self, entity_id: i64) -> Result<u64, String> {
        self.with_connection(|conn| {
            let offset: Option<i64> = conn
                .query_row(
                    "SELECT byte_offset FROM transcript_cursors WHERE entity_id = ?1",
                    params![entity_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| format!("Failed to query transcript cursor: {}", err))?;
            Ok(offset.map(|value| value.max(0) as u64).unwrap_or(0))
        })
    }

    pub fn set_transcript_cursor(
        &self,
        entity_id: i64,
        offset: u64,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO transcript_cursors (entity_id, byte_offset, updated_at) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(entity_id) DO UPDATE SET \
                    byte_offset = excluded.byte_offset, \
                    updated_at = excluded.updated_at",
                params![entity_id, offset as i64, format_ts(now)],
            )
            .map_err(|err| format!("Failed to save transcript cursor: {}", err))?;
            Ok(())
        })
    }

    // ── broadcast outbox ────────────────────────────────────────────────────

    pub fn insert_broadcast(
        &self,
        event: &BroadcastEvent,
        now: DateTime<Utc>,
    ) -> Result<i64, String> {
        let payload = serde_json::to_string(event)
            .map_err(|err| format!("Failed to serialize broadcast payload: {}", err))?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO outbox (event_type, entity_id, payload, recorded_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![event.event_type(), event.entity_id(), payload, format_ts(now)],
            )
            .map_err(|err| format!("Failed to insert broadcast: {}", err))?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn list_broadcasts(&self, after_id: i64, limit: usize) -> Result<Vec<BroadcastRow>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, event_type, entity_id, payload, recorded_at FROM outbox \
                     WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
                )
                .map_err(|err| format!("Failed to prepare outbox query: {}", err))?;
            let rows = stmt
                .query_map(params![after_id, limit as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })
                .map_err(|err| format!("Failed to query outbox: {}", err))?;

            let mut broadcasts = Vec::new();
            for row in rows {
                let (id, event_type, entity_id, payload, recorded_at) =
                    row.map_err(|err| format!("Failed to decode outbox row: {}", err))?;
                let payload = serde_json::from_str(&payload)
                    .map_err(|err| format!("Failed to parse outbox payload: {}", err))?;
                broadcasts.push(BroadcastRow {
                    id,
                    event_type,
                    entity_id,
                    recorded_at,
                    payload,
                });
            }
            Ok(broadcasts)
        })
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS entities (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    external_id TEXT NOT NULL UNIQUE,
                    pid INTEGER,
                    transcript_path TEXT,
                    terminal_target TEXT,
                    created_at TEXT NOT NULL,
                    last_seen_at TEXT NOT NULL,
                    ended_at TEXT,
                    end_reason TEXT,
                    context_percent INTEGER,
                    context_updated_at TEXT
                 );
                 CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    entity_id INTEGER NOT NULL REFERENCES entities(id),
                    state TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    completed_at TEXT
                 );
                 CREATE INDEX IF NOT EXISTS tasks_entity_idx ON tasks (entity_id, id);
                 CREATE TABLE IF NOT EXISTS turns (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    entity_id INTEGER NOT NULL REFERENCES entities(id),
                    task_id INTEGER NOT NULL REFERENCES tasks(id),
                    actor TEXT NOT NULL,
                    intent TEXT NOT NULL,
                    text TEXT NOT NULL,
                    fingerprint TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    timestamp_source TEXT NOT NULL,
                    created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS turns_entity_time_idx ON turns (entity_id, timestamp);
                 CREATE TABLE IF NOT EXISTS advisory_locks (
                    namespace INTEGER NOT NULL,
                    key INTEGER NOT NULL,
                    session_id TEXT NOT NULL,
                    holder_pid INTEGER NOT NULL,
                    granted_at TEXT NOT NULL,
                    PRIMARY KEY (namespace, key)
                 );
                 CREATE TABLE IF NOT EXISTS transcript_cursors (
                    entity_id INTEGER PRIMARY KEY REFERENCES entities(id),
                    byte_offset INTEGER NOT NULL,
                    updated_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS outbox (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    event_type TEXT NOT NULL,
                    entity_id INTEGER NOT NULL,
                    payload TEXT NOT NULL,
                    recorded_at TEXT NOT NULL
                 );
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))
        })
    }
}

const ENTITY_SELECT: &str = "SELECT id, external_id, pid, transcript_path, terminal_target, \
        created_at, last_seen_at, ended_at, end_reason, context_percent, context_updated_at \
     FROM entities";

fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<EntityRecord> {
    Ok(EntityRecord {
        id: row.get(0)?,
        external_id: row.get(1)?,
        pid: row
            .get::<_, Option<i64>>(2)?
            .and_then(|value| u32::try_from(value).ok()),
        transcript_path: row.get(3)?,
        terminal_target: row.get(4)?,
        created_at: ts_column(row, 5)?,
        last_seen_at: ts_column(row, 6)?,
        ended_at: opt_ts_column(row, 7)?,
        end_reason: row.get(8)?,
        context_percent: row
            .get::<_, Option<i64>>(9)?
            .and_then(|value| u8::try_from(value).ok()),
        context_updated_at: opt_ts_column(row, 10)?,
    })
}

/// Fixed-width UTC timestamps so TEXT columns sort chronologically.
pub fn format_ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Drops precision the TEXT columns cannot hold.
pub fn stored_precision(value: DateTime<Utc>) -> DateTime<Utc> {
    value.trunc_subsecs(6)
}

pub fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn ts_column(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    parse_ts(&raw).ok_or_else(|| invalid_column(index, format!("Invalid timestamp: {}", raw)))
}

pub(crate) fn opt_ts_column(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(index)?;
    match raw {
        Some(raw) => parse_ts(&raw)
            .map(Some)
            .ok_or_else(|| invalid_column(index, format!("Invalid timestamp: {}", raw))),
        None => Ok(None),
    }
}

pub(crate) fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}
