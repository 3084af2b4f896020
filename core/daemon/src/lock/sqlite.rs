//! Session-scoped advisory locks stored in the shared SQLite database.
//!
//! A lock is a row in `advisory_locks` keyed by `(namespace, key)` and tagged
//! with the ULID of the session that holds it. A session is one dedicated
//! pooled connection: the rows it owns live until it unlocks them or closes,
//! and commits on any other connection never touch them.
//!
//! A backend session that dies with its process would normally take its locks
//! with it. Rows are not tied to a live socket here, so a holder whose pid is
//! gone is treated as crashed and its row is reclaimed on the next contention.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use turnwatch_protocol::HeldLockInfo;

use super::{LockBackend, LockSession};
use crate::db::{format_ts, parse_ts, Db, PooledConnection};
use crate::error::LockError;
use crate::process::is_pid_alive;

const INITIAL_POLL: Duration = Duration::from_millis(5);
const MAX_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct SessionCounters {
    open: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub open: usize,
    pub peak: usize,
}

pub struct SqliteLockBackend {
    db: Arc<Db>,
    counters: Arc<SessionCounters>,
}

impl SqliteLockBackend {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            counters: Arc::new(SessionCounters::default()),
        }
    }

    /// Lock sessions currently open from this process, and the most that were
    /// ever open at once.
    pub fn session_stats(&self) -> SessionStats {
        SessionStats {
            open: self.counters.open.load(Ordering::SeqCst),
            peak: self.counters.peak.load(Ordering::SeqCst),
        }
    }

    /// Deletes rows whose holder process no longer exists.
    pub fn purge_orphaned(&self) -> Result<usize, String> {
        let rows = self.db.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT namespace, key, session_id, holder_pid FROM advisory_locks")
                .map_err(|err| format!("Failed to prepare lock catalog query: {}", err))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })
                .map_err(|err| format!("Failed to read lock catalog: {}", err))?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(|err| format!("Failed to decode lock row: {}", err))?);
            }
            Ok(entries)
        })?;

        let mut purged = 0;
        for (namespace, key, session_id, holder_pid) in rows {
            if holder_alive(holder_pid) {
                continue;
            }
            let removed = self.db.with_connection(|conn| {
                conn.execute(
                    "DELETE FROM advisory_locks \
                     WHERE namespace = ?1 AND key = ?2 AND session_id = ?3",
                    params![namespace, key, session_id],
                )
                .map_err(|err| format!("Failed to purge orphaned lock: {}", err))
            })?;
            if removed > 0 {
                warn!(
                    namespace,
                    key,
                    session_id = %session_id,
                    holder_pid,
                    "Purged advisory lock held by dead process"
                );
                purged += removed;
            }
        }
        Ok(purged)
    }
}

impl LockBackend for SqliteLockBackend {
    fn open_session(&self) -> Result<Box<dyn LockSession>, String> {
        let conn = self.db.pool().checkout()?;
        let open = self.counters.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(open, Ordering::SeqCst);
        Ok(Box::new(SqliteLockSession {
            conn,
            session_id: ulid::Ulid::new().to_string(),
            holder_pid: std::process::id(),
            counters: Arc::clone(&self.counters),
        }))
    }

    fn held_locks(&self) -> Result<Vec<HeldLockInfo>, String> {
        let now = Utc::now();
        self.db.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT namespace, key, session_id, holder_pid, granted_at \
                     FROM advisory_locks ORDER BY granted_at ASC",
                )
                .map_err(|err| format!("Failed to prepare lock catalog query: {}", err))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })
                .map_err(|err| format!("Failed to read lock catalog: {}", err))?;

            let mut locks = Vec::new();
            for row in rows {
                let (namespace, key, session_id, holder_pid, granted_at) =
                    row.map_err(|err| format!("Failed to decode lock row: {}", err))?;
                let held_for_secs = parse_ts(&granted_at)
                    .map(|granted| now.signed_duration_since(granted).num_seconds().max(0))
                    .unwrap_or(0);
                locks.push(HeldLockInfo {
                    namespace,
                    key,
                    mode: "exclusive".to_string(),
                    session_id,
                    holder_pid: u32::try_from(holder_pid).unwrap_or(0),
                    granted_at,
                    held_for_secs,
                });
            }
            Ok(locks)
        })
    }
}

struct SqliteLockSession {
    conn: PooledConnection,
    session_id: String,
    holder_pid: u32,
    counters: Arc<SessionCounters>,
}

impl SqliteLockSession {
    fn insert_if_absent(&self, namespace: i64, key: i64) -> Result<bool, LockError> {
        let inserted = self
            .conn
            .execute(
                "INSERT INTO advisory_locks (namespace, key, session_id, holder_pid, granted_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(namespace, key) DO NOTHING",
                params![
                    namespace,
                    key,
                    self.session_id,
                    i64::from(self.holder_pid),
                    format_ts(Utc::now())
                ],
            )
            .map_err(|err| LockError::Backend(format!("Failed to request lock: {}", err)))?;
        Ok(inserted > 0)
    }

    fn current_holder(&self, namespace: i64, key: i64) -> Result<Option<(String, i64)>, LockError> {
        self.conn
            .query_row(
                "SELECT session_id, holder_pid FROM advisory_locks \
                 WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|err| LockError::Backend(format!("Failed to read lock holder: {}", err)))
    }

    fn reclaim_orphan(&self, namespace: i64, key: i64, session_id: &str) -> Result<(), LockError> {
        self.conn
            .execute(
                "DELETE FROM advisory_locks \
                 WHERE namespace = ?1 AND key = ?2 AND session_id = ?3",
                params![namespace, key, session_id],
            )
            .map_err(|err| LockError::Backend(format!("Failed to reclaim orphaned lock: {}", err)))?;
        Ok(())
    }
}

impl LockSession for SqliteLockSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn try_lock(&mut self, namespace: i64, key: i64) -> Result<bool, LockError> {
        // Two attempts: the second follows a release or an orphan reclaim
        // observed between our insert and the holder lookup.
        for _ in 0..2 {
            if self.insert_if_absent(namespace, key)? {
                return Ok(true);
            }
            match self.current_holder(namespace, key)? {
                None => continue,
                Some((holder, _)) if holder == self.session_id => return Ok(true),
                Some((holder, holder_pid)) => {
                    if holder_alive(holder_pid) {
                        return Ok(false);
                    }
                    warn!(
                        namespace,
                        key,
                        session_id = %holder,
                        holder_pid,
                        "Reclaiming advisory lock from dead process"
                    );
                    self.reclaim_orphan(namespace, key, &holder)?;
                }
            }
        }
        Ok(false)
    }

    fn lock(&mut self, namespace: i64, key: i64, wait: Duration) -> Result<(), LockError> {
        let started = Instant::now();
        let deadline = started + wait;
        let mut poll = INITIAL_POLL;
        loop {
            if self.try_lock(namespace, key)? {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    namespace,
                    key,
                    waited: now.duration_since(started),
                });
            }
            thread::sleep(poll.min(deadline - now));
            poll = (poll * 2).min(MAX_POLL);
        }
    }

    fn unlock(&mut self, namespace: i64, key: i64) -> Result<bool, LockError> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM advisory_locks \
                 WHERE namespace = ?1 AND key = ?2 AND session_id = ?3",
                params![namespace, key, self.session_id],
            )
            .map_err(|err| LockError::Backend(format!("Failed to unlock: {}", err)))?;
        Ok(removed > 0)
    }
}

impl Drop for SqliteLockSession {
    fn drop(&mut self) {
        // Session end releases everything the session still owns.
        match self.conn.execute(
            "DELETE FROM advisory_locks WHERE session_id = ?1",
            params![self.session_id],
        ) {
            Ok(0) => {}
            Ok(released) => debug!(
                session_id = %self.session_id,
                released,
                "Lock session closed with locks still held"
            ),
            Err(err) => warn!(
                session_id = %self.session_id,
                error = %err,
                "Failed to release session locks on close"
            ),
        }
        self.counters.open.fetch_sub(1, Ordering::SeqCst);
    }
}

fn holder_alive(holder_pid: i64) -> bool {
    u32::try_from(holder_pid)
        .map(is_pid_alive)
        .unwrap_or(false)
}
