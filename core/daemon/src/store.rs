//! Turn and task persistence behind the `TurnStore` trait.
//!
//! Every write here is its own transaction. Callers that need per-entity
//! ordering hold the entity's advisory lock around the calls; the store does
//! not take it.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;

use turnwatch_protocol::{Actor, Intent, TaskState, TimestampSource, TurnView};

use crate::db::{
    format_ts, invalid_column, opt_ts_column, stored_precision, ts_column, Db, EntityRecord,
};
use crate::fingerprint::fingerprint;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub id: i64,
    pub entity_id: i64,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnRecord {
    pub id: i64,
    pub entity_id: i64,
    pub task_id: i64,
    pub actor: Actor,
    pub intent: Intent,
    pub text: String,
    pub fingerprint: String,
    pub timestamp: DateTime<Utc>,
    pub timestamp_source: TimestampSource,
    pub created_at: DateTime<Utc>,
}

impl TurnRecord {
    pub fn to_view(&self) -> TurnView {
        TurnView {
            id: self.id,
            entity_id: self.entity_id,
            task_id: self.task_id,
            actor: self.actor,
            intent: self.intent,
            text: self.text.clone(),
            timestamp: self.timestamp,
            timestamp_source: self.timestamp_source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewTurn {
    pub entity_id: i64,
    pub task_id: i64,
    pub actor: Actor,
    pub intent: Intent,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub timestamp_source: TimestampSource,
}

pub trait TurnStore: Send + Sync {
    fn get_entity(&self, entity_id: i64) -> Result<Option<EntityRecord>, String>;

    fn touch_entity(&self, entity_id: i64, now: DateTime<Utc>) -> Result<(), String>;

    fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>, String>;

    /// The entity's newest task that has not reached `Complete`.
    fn active_task(&self, entity_id: i64) -> Result<Option<TaskRecord>, String>;

    /// Task a new turn belongs to. The active task when there is one;
    /// otherwise a turn that starts work opens a fresh `Idle` task, and any
    /// other turn joins the entity's most recent task (opening one only for
    /// an entity that has none).
    fn task_for_turn(
        &self,
        entity_id: i64,
        starts_task: bool,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, String>;

    fn create_turn(&self, turn: &NewTurn, now: DateTime<Utc>) -> Result<TurnRecord, String>;

    /// Turns with `timestamp >= since`, oldest first.
    fn turns_since(&self, entity_id: i64, since: DateTime<Utc>)
        -> Result<Vec<TurnRecord>, String>;

    /// Newest first.
    fn list_turns(&self, entity_id: i64, limit: usize) -> Result<Vec<TurnRecord>, String>;

    fn latest_turn_id(&self, entity_id: i64) -> Result<Option<i64>, String>;

    fn update_turn_timestamp(
        &self,
        turn_id: i64,
        timestamp: DateTime<Utc>,
        source: TimestampSource,
    ) -> Result<bool, String>;

    /// Compare-and-set on the task state. Returns false, with nothing
    /// written, when the task is no longer in `from`.
    fn apply_transition(
        &self,
        task_id: i64,
        from: TaskState,
        to: TaskState,
        at: DateTime<Utc>,
    ) -> Result<bool, String>;
}

const TASK_SELECT: &str =
    "SELECT id, entity_id, state, created_at, updated_at, completed_at FROM tasks";

const TURN_SELECT: &str = "SELECT id, entity_id, task_id, actor, intent, text, fingerprint, \
        timestamp, timestamp_source, created_at \
     FROM turns";

impl TurnStore for Db {
    fn get_entity(&self, entity_id: i64) -> Result<Option<EntityRecord>, String> {
        Db::get_entity(self, entity_id)
    }

    fn touch_entity(&self, entity_id: i64, now: DateTime<Utc>) -> Result<(), String> {
        Db::touch_entity(self, entity_id, now)
    }

    fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                &format!("{} WHERE id = ?1", TASK_SELECT),
                params![task_id],
                task_from_row,
            )
            .optional()
            .map_err(|err| format!("Failed to query task: {}", err))
        })
    }

    fn active_task(&self, entity_id: i64) -> Result<Option<TaskRecord>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                &format!(
                    "{} WHERE entity_id = ?1 AND state != ?2 ORDER BY id DESC LIMIT 1",
                    TASK_SELECT
                ),
                params![entity_id, TaskState::Complete.as_str()],
                task_from_row,
            )
            .optional()
            .map_err(|err| format!("Failed to query active task: {}", err))
        })
    }

    fn task_for_turn(
        &self,
        entity_id: i64,
        starts_task: bool,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, String> {
        let now = stored_precision(now);
        let now_str = format_ts(now);
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| format!("Failed to begin task lookup: {}", err))?;

            let existing = tx
                .query_row(
                    &format!(
                        "{} WHERE entity_id = ?1 AND state != ?2 ORDER BY id DESC LIMIT 1",
                        TASK_SELECT
                    ),
                    params![entity_id, TaskState::Complete.as_str()],
                    task_from_row,
                )
                .optional()
                .map_err(|err| format!("Failed to query active task: {}", err))?;
            if let Some(task) = existing {
                return Ok(task);
            }
            if !starts_task {
                let latest = tx
                    .query_row(
                        &format!("{} WHERE entity_id = ?1 ORDER BY id DESC LIMIT 1", TASK_SELECT),
                        params![entity_id],
                        task_from_row,
                    )
                    .optional()
                    .map_err(|err| format!("Failed to query latest task: {}", err))?;
                if let Some(task) = latest {
                    return Ok(task);
                }
            }

            tx.execute(
                "INSERT INTO tasks (entity_id, state, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?3)",
                params![entity_id, TaskState::Idle.as_str(), now_str],
            )
            .map_err(|err| format!("Failed to open task: {}", err))?;
            let id = tx.last_insert_rowid();
            tx.commit()
                .map_err(|err| format!("Failed to commit task: {}", err))?;

            Ok(TaskRecord {
                id,
                entity_id,
                state: TaskState::Idle,
                created_at: now,
                updated_at: now,
                completed_at: None,
            })
        })
    }

    fn create_turn(&self, turn: &NewTurn, now: DateTime<Utc>) -> Result<TurnRecord, String> {
        let print = fingerprint(turn.actor, &turn.text);
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO turns (entity_id, task_id, actor, intent, text, fingerprint, \
                    timestamp, timestamp_source, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    turn.entity_id,
                    turn.task_id,
                    turn.actor.as_str(),
                    turn.intent.as_str(),
                    turn.text,
                    print,
                    format_ts(turn.timestamp),
                    turn.timestamp_source.as_str(),
                    format_ts(now),
                ],
            )
            .map_err(|err| format!("Failed to insert turn: {}", err))?;

            Ok(TurnRecord {
                id: conn.last_insert_rowid(),
                entity_id: turn.entity_id,
                task_id: turn.task_id,
                actor: turn.actor,
                intent: turn.intent,
                text: turn.text.clone(),
                fingerprint: print,
                timestamp: stored_precision(turn.timestamp),
                timestamp_source: turn.timestamp_source,
                created_at: stored_precision(now),
            })
        })
    }

    fn turns_since(
        &self,
        entity_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<TurnRecord>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "{} WHERE entity_id = ?1 AND timestamp >= ?2 ORDER BY timestamp ASC, id ASC",
                    TURN_SELECT
                ))
                .map_err(|err| format!("Failed to prepare turn window query: {}", err))?;
            let rows = stmt
                .query_map(params![entity_id, format_ts(since)], turn_from_row)
                .map_err(|err| format!("Failed to query turn window: {}", err))?;
            collect_turns(rows)
        })
    }

    fn list_turns(&self, entity_id: i64, limit: usize) -> Result<Vec<TurnRecord>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "{} WHERE entity_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
                    TURN_SELECT
                ))
                .map_err(|err| format!("Failed to prepare turns query: {}", err))?;
            let rows = stmt
                .query_map(params![entity_id, limit as i64], turn_from_row)
                .map_err(|err| format!("Failed to query turns: {}", err))?;
            collect_turns(rows)
        })
    }

    fn latest_turn_id(&self, entity_id: i64) -> Result<Option<i64>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT MAX(id) FROM turns WHERE entity_id = ?1",
                params![entity_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .map_err(|err| format!("Failed to query latest turn: {}", err))
        })
    }

    fn update_turn_timestamp(
        &self,
        turn_id: i64,
        timestamp: DateTime<Utc>,
        source: TimestampSource,
    ) -> Result<bool, String> {
        self.with_connection(|conn| {
            let changed = conn
                .execute(
                    "UPDATE turns SET timestamp = ?2, timestamp_source = ?3 WHERE id = ?1",
                    params![turn_id, format_ts(timestamp), source.as_str()],
                )
                .map_err(|err| format!("Failed to update turn timestamp: {}", err))?;
            Ok(changed > 0)
        })
    }

    fn apply_transition(
        &self,
        task_id: i64,
        from: TaskState,
        to: TaskState,
        at: DateTime<Utc>,
    ) -> Result<bool, String> {
        let at = format_ts(at);
        let completed_at = if to.is_terminal() { Some(at.clone()) } else { None };
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| format!("Failed to begin transition: {}", err))?;
            let changed = tx
                .execute(
                    "UPDATE tasks SET state = ?3, updated_at = ?4, \
                        completed_at = COALESCE(?5, completed_at) \
                     WHERE id = ?1 AND state = ?2",
                    params![task_id, from.as_str(), to.as_str(), at, completed_at],
                )
                .map_err(|err| format!("Failed to apply transition: {}", err))?;
            if changed == 0 {
                tx.rollback()
                    .map_err(|err| format!("Failed to roll back transition: {}", err))?;
                return Ok(false);
            }
            tx.commit()
                .map_err(|err| format!("Failed to commit transition: {}", err))?;
            Ok(true)
        })
    }
}

fn collect_turns(
    rows: impl Iterator<Item = rusqlite::Result<TurnRecord>>,
) -> Result<Vec<TurnRecord>, String> {
    let mut turns = Vec::new();
    for row in rows {
        turns.push(row.map_err(|err| format!("Failed to decode turn row: {}", err))?);
    }
    Ok(turns)
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let state: String = row.get(2)?;
    Ok(TaskRecord {
        id: row.get(0)?,
        entity_id: row.get(1)?,
        state: TaskState::from_str(&state)
            .ok_or_else(|| invalid_column(2, format!("Unknown task state: {}", state)))?,
        created_at: ts_column(row, 3)?,
        updated_at: ts_column(row, 4)?,
        completed_at: opt_ts_column(row, 5)?,
    })
}

fn turn_from_row(row: &Row<'_>) -> rusqlite::Result<TurnRecord> {
    let actor: String = row.get(3)?;
    let intent: String = row.get(4)?;
    let source: String = row.get(8)?;
    Ok(TurnRecord {
        id: row.get(0)?,
        entity_id: row.get(1)?,
        task_id: row.get(2)?,
        actor: Actor::from_str(&actor)
            .ok_or_else(|| invalid_column(3, format!("Unknown actor: {}", actor)))?,
        intent: Intent::from_str(&intent)
            .ok_or_else(|| invalid_column(4, format!("Unknown intent: {}", intent)))?,
        text: row.get(5)?,
        fingerprint: row.get(6)?,
        timestamp: ts_column(row, 7)?,
        timestamp_source: TimestampSource::from_str(&source)
            .ok_or_else(|| invalid_column(8, format!("Unknown timestamp source: {}", source)))?,
        created_at: ts_column(row, 9)?,
    })
}
