//! Tier-2 reconciliation: replace approximate turn timestamps with the
//! transcript's event times, and create turns tier 1 never delivered.
//!
//! Callers hold the entity's advisory lock for the whole pass.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::debug;
use turnwatch_protocol::{Actor, BroadcastEvent, Intent, TimestampSource};

use crate::broadcast::Broadcaster;
use crate::db::stored_precision;
use crate::error::ReconcileError;
use crate::fingerprint::{fingerprint, normalize_text};
use crate::state_machine;
use crate::store::{NewTurn, TurnRecord, TurnStore};
use crate::transcript::LogEntry;

pub const DEFAULT_WINDOW_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileResult {
    pub updated: usize,
    pub created: usize,
    /// Entries whose turn was already authoritative at the same time.
    pub unchanged: usize,
}

pub struct TranscriptReconciler {
    store: Arc<dyn TurnStore>,
    broadcaster: Arc<dyn Broadcaster>,
    window: ChronoDuration,
}

impl TranscriptReconciler {
    pub fn new(
        store: Arc<dyn TurnStore>,
        broadcaster: Arc<dyn Broadcaster>,
        window: ChronoDuration,
    ) -> Self {
        Self {
            store,
            broadcaster,
            window,
        }
    }

    pub fn reconcile(
        &self,
        entity_id: i64,
        entries: &[LogEntry],
        now: DateTime<Utc>,
    ) -> Result<ReconcileResult, ReconcileError> {
        let mut result = ReconcileResult::default();
        if entries.is_empty() {
            return Ok(result);
        }
        if self
            .store
            .get_entity(entity_id)
            .map_err(ReconcileError::Store)?
            .is_none()
        {
            return Err(ReconcileError::UnknownEntity(entity_id));
        }

        let anchor = entries
            .iter()
            .map(|entry| entry.event_time)
            .min()
            .map_or(now, |earliest| earliest.min(now));
        let mut window =
            ReconciliationWindow::load(self.store.as_ref(), entity_id, anchor - self.window)?;

        for entry in entries {
            let event_time = stored_precision(entry.event_time);
            match window.take_match(entry.actor, &entry.text) {
                Some(turn) => {
                    if turn.timestamp == event_time
                        && turn.timestamp_source == TimestampSource::Authoritative
                    {
                        result.unchanged += 1;
                        continue;
                    }
                    let changed = self
                        .store
                        .update_turn_timestamp(turn.id, event_time, TimestampSource::Authoritative)
                        .map_err(ReconcileError::Store)?;
                    if changed {
                        result.updated += 1;
                        self.broadcaster.publish(&BroadcastEvent::TurnUpdated {
                            entity_id,
                            turn_id: turn.id,
                            previous_timestamp: turn.timestamp,
                            timestamp: event_time,
                            timestamp_source: TimestampSource::Authoritative,
                        });
                    }
                }
                None => {
                    let intent = reconciled_intent(entry.actor);
                    let starts_task = state_machine::starts_task(entry.actor, intent);
                    let task = self
                        .store
                        .task_for_turn(entity_id, starts_task, now)
                        .map_err(ReconcileError::Store)?;
                    let turn = self
                        .store
                        .create_turn(
                            &NewTurn {
                                entity_id,
                                task_id: task.id,
                                actor: entry.actor,
                                intent,
                                text: entry.text.clone(),
                                timestamp: event_time,
                                timestamp_source: TimestampSource::Authoritative,
                            },
                            now,
                        )
                        .map_err(ReconcileError::Store)?;
                    result.created += 1;
                    self.broadcaster.publish(&BroadcastEvent::TurnCreated {
                        entity_id,
                        turn: turn.to_view(),
                    });
                }
            }
        }

        if result.updated > 0 || result.created > 0 {
            debug!(
                entity_id,
                updated = result.updated,
                created = result.created,
                unchanged = result.unchanged,
                "Reconciled transcript entries"
            );
        }
        Ok(result)
    }
}

/// Transcript entries carry no intent; use the neutral one for each actor.
fn reconciled_intent(actor: Actor) -> Intent {
    match actor {
        Actor::User => Intent::Command,
        Actor::Agent => Intent::Progress,
    }
}

/// Candidate turns for one pass, keyed by fingerprint, each queue oldest
/// first. A turn leaves the index once matched.
struct ReconciliationWindow {
    by_fingerprint: HashMap<String, VecDeque<TurnRecord>>,
}

impl ReconciliationWindow {
    fn load(
        store: &dyn TurnStore,
        entity_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Self, ReconcileError> {
        let turns = store
            .turns_since(entity_id, since)
            .map_err(ReconcileError::Store)?;
        let mut by_fingerprint: HashMap<String, VecDeque<TurnRecord>> = HashMap::new();
        for turn in turns {
            by_fingerprint
                .entry(turn.fingerprint.clone())
                .or_default()
                .push_back(turn);
        }
        Ok(Self { by_fingerprint })
    }

    /// Fingerprints only hash a prefix, so a hit whose full text differs is
    /// ambiguous and treated as no match.
    fn take_match(&mut self, actor: Actor, text: &str) -> Option<TurnRecord> {
        let key = fingerprint(actor, text);
        let queue = self.by_fingerprint.get_mut(&key)?;
        if queue.is_empty() {
            return None;
        }
        let normalized = normalize_text(text);
        let position = queue
            .iter()
            .position(|turn| normalize_text(&turn.text) == normalized);
        match position {
            Some(index) => queue.remove(index),
            None => {
                debug!(
                    fingerprint = %key,
                    candidates = queue.len(),
                    "Ambiguous fingerprint match; creating a new turn"
                );
                None
            }
        }
    }
}
