//! Tier-1 turn capture.
//!
//! Each inbound signal is handled under the entity's advisory lock:
//!
//! 1. persist the turn and commit it on its own
//! 2. broadcast `turn_created`
//! 3. validate the task transition and commit it as a separate
//!    compare-and-set, or leave the task untouched
//!
//! A rejected transition never takes the turn with it.
//!
//! A handler first takes a slot from the shared [`ForegroundLimit`]; the wait
//! for that slot and the lock wait share one budget.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use turnwatch_protocol::{BroadcastEvent, TaskState, TimestampSource, TurnSignal};

use crate::admission::ForegroundLimit;
use crate::broadcast::Broadcaster;
use crate::error::{CaptureError, TransitionError};
use crate::lock::{AdvisoryLockManager, LockGuard, ENTITY_NAMESPACE};
use crate::state_machine;
use crate::store::{NewTurn, TurnRecord, TurnStore};

#[derive(Debug, Clone, Copy)]
pub struct CaptureTimeouts {
    pub foreground: Duration,
    /// For signals that already waited on upstream work.
    pub deferred: Duration,
}

impl Default for CaptureTimeouts {
    fn default() -> Self {
        Self {
            foreground: Duration::from_secs(15),
            deferred: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied { from: TaskState, to: TaskState },
    Rejected(TransitionError),
    /// The task left `expected` between read and write. Nothing was written.
    Conflict { expected: TaskState },
}

#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub turn: TurnRecord,
    pub task_id: i64,
    pub transition: TransitionOutcome,
}

pub struct TurnCaptureCoordinator {
    locks: Arc<AdvisoryLockManager>,
    store: Arc<dyn TurnStore>,
    broadcaster: Arc<dyn Broadcaster>,
    timeouts: CaptureTimeouts,
    foreground: Arc<ForegroundLimit>,
}

impl TurnCaptureCoordinator {
    pub fn new(
        locks: Arc<AdvisoryLockManager>,
        store: Arc<dyn TurnStore>,
        broadcaster: Arc<dyn Broadcaster>,
        timeouts: CaptureTimeouts,
    ) -> Self {
        Self {
            locks,
            store,
            broadcaster,
            timeouts,
            foreground: Arc::new(ForegroundLimit::default()),
        }
    }

    /// Shares `limit` with the other foreground handlers of this process.
    pub fn with_foreground_limit(mut self, limit: Arc<ForegroundLimit>) -> Self {
        self.foreground = limit;
        self
    }

    pub fn capture(&self, signal: &TurnSignal) -> Result<CaptureOutcome, CaptureError> {
        let wait = if signal.deferred {
            self.timeouts.deferred
        } else {
            self.timeouts.foreground
        };
        let receipt_time = signal.receipt_time_utc().unwrap_or_else(Utc::now);

        let started = Instant::now();
        let permit = self.foreground.acquire(wait)?;
        let guard = self.locks.acquire_blocking(
            ENTITY_NAMESPACE,
            signal.entity_id,
            wait.saturating_sub(started.elapsed()),
        )?;
        let outcome = self.capture_locked(&guard, signal, receipt_time);
        guard.release();
        drop(permit);
        outcome
    }

    fn capture_locked(
        &self,
        _guard: &LockGuard,
        signal: &TurnSignal,
        receipt_time: DateTime<Utc>,
    ) -> Result<CaptureOutcome, CaptureError> {
        let entity_id = signal.entity_id;
        let entity = self
            .store
            .get_entity(entity_id)
            .map_err(CaptureError::Store)?
            .ok_or(CaptureError::UnknownEntity(entity_id))?;
        if !entity.is_live() {
            return Err(CaptureError::EntityEnded(entity_id));
        }

        let now = Utc::now();
        self.store
            .touch_entity(entity_id, now)
            .map_err(CaptureError::Store)?;
        let task = self
            .store
            .task_for_turn(
                entity_id,
                state_machine::starts_task(signal.actor, signal.intent),
                now,
            )
            .map_err(CaptureError::Store)?;

        let turn = self
            .store
            .create_turn(
                &NewTurn {
                    entity_id,
                    task_id: task.id,
                    actor: signal.actor,
                    intent: signal.intent,
                    text: signal.text.clone().unwrap_or_default(),
                    timestamp: receipt_time,
                    timestamp_source: TimestampSource::Approximate,
                },
                now,
            )
            .map_err(CaptureError::Store)?;
        debug!(
            entity_id,
            turn_id = turn.id,
            task_id = task.id,
            actor = signal.actor.as_str(),
            intent = signal.intent.as_str(),
            "Turn captured"
        );
        self.broadcaster.publish(&BroadcastEvent::TurnCreated {
            entity_id,
            turn: turn.to_view(),
        });

        let transition = match state_machine::transition(task.state, signal.actor, signal.intent) {
            Ok(next) => {
                let applied = self
                    .store
                    .apply_transition(task.id, task.state, next, now)
                    .map_err(CaptureError::Store)?;
                if applied {
                    if next != task.state {
                        self.broadcaster.publish(&BroadcastEvent::StateChanged {
                            entity_id,
                            task_id: task.id,
                            from: task.state,
                            to: next,
                        });
                    }
                    TransitionOutcome::Applied {
                        from: task.state,
                        to: next,
                    }
                } else {
                    warn!(
                        entity_id,
                        task_id = task.id,
                        from_state = task.state.as_str(),
                        "Task state changed underneath capture; transition not applied"
                    );
                    TransitionOutcome::Conflict {
                        expected: task.state,
                    }
                }
            }
            Err(err) => {
                warn!(
                    entity_id,
                    turn_id = turn.id,
                    task_id = task.id,
                    from_state = task.state.as_str(),
                    actor = signal.actor.as_str(),
                    intent = signal.intent.as_str(),
                    error = %err,
                    "Rejected task transition; turn preserved"
                );
                TransitionOutcome::Rejected(err)
            }
        };

        Ok(CaptureOutcome {
            turn,
            task_id: task.id,
            transition,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::lock::SqliteLockBackend;
    use std::sync::Mutex;
    use tempfile::tempdir;
    use turnwatch_protocol::{Actor, EntityRegistration, Intent};

    #[derive(Default)]
    struct CollectingBroadcaster {
        events: Mutex<Vec<BroadcastEvent>>,
    }

    impl Broadcaster for CollectingBroadcaster {
        fn publish(&self, event: &BroadcastEvent) {
            self.events.lock().expect("events").push(event.clone());
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        db: Arc<Db>,
        events: Arc<CollectingBroadcaster>,
        coordinator: TurnCaptureCoordinator,
        entity_id: i64,
    }

    fn harness() -> Harness {
        let dir = tempdir().expect("tempdir");
        let db = Arc::new(Db::new(dir.path().join("state.db")).expect("db"));
        let entity = db
            .register_entity(
                &EntityRegistration {
                    external_id: "agent-a".to_string(),
                    pid: None,
                    transcript_path: None,
                    terminal_target: None,
                },
                Utc::now(),
            )
            .expect("register");
        let events = Arc::new(CollectingBroadcaster::default());
        let locks = Arc::new(AdvisoryLockManager::new(Arc::new(SqliteLockBackend::new(
            db.clone(),
        ))));
        let coordinator = TurnCaptureCoordinator::new(
            locks,
            db.clone(),
            events.clone(),
            CaptureTimeouts::default(),
        );
        Harness {
            _dir: dir,
            db,
            events,
            coordinator,
            entity_id: entity.id,
        }
    }

    fn signal(entity_id: i64, actor: Actor, intent: Intent, text: &str) -> TurnSignal {
        TurnSignal {
            entity_id,
            actor,
            intent,
            text: Some(text.to_string()),
            receipt_time: Utc::now().to_rfc3339(),
            deferred: false,
        }
    }

    #[test]
    fn valid_command_commits_turn_and_transition() {
        let h = harness();
        let outcome = h
            .coordinator
            .capture(&signal(h.entity_id, Actor::User, Intent::Command, "build it"))
            .expect("capture");

        assert_eq!(
            outcome.transition,
            TransitionOutcome::Applied {
                from: TaskState::Idle,
                to: TaskState::Commanded
            }
        );
        assert_eq!(outcome.turn.timestamp_source, TimestampSource::Approximate);

        let task = h.db.get_task(outcome.task_id).expect("get").expect("task");
        assert_eq!(task.state, TaskState::Commanded);

        let events = h.events.events.lock().expect("events");
        let kinds: Vec<_> = events.iter().map(|event| event.event_type()).collect();
        assert_eq!(kinds, vec!["turn_created", "state_changed"]);
    }

    #[test]
    fn rejected_transition_keeps_the_turn() {
        let h = harness();
        let outcome = h
            .coordinator
            .capture(&signal(h.entity_id, Actor::Agent, Intent::Completion, "done"))
            .expect("capture");

        assert!(matches!(outcome.transition, TransitionOutcome::Rejected(_)));
        let turns = h.db.list_turns(h.entity_id, 10).expect("turns");
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].id, outcome.turn.id);

        let task = h.db.get_task(outcome.task_id).expect("get").expect("task");
        assert_eq!(task.state, TaskState::Idle);

        // The idle task is reused by the next valid command.
        let next = h
            .coordinator
            .capture(&signal(h.entity_id, Actor::User, Intent::Command, "go"))
            .expect("capture");
        assert_eq!(next.task_id, outcome.task_id);
    }

    #[test]
    fn unknown_and_ended_entities_are_refused() {
        let h = harness();
        let err = h
            .coordinator
            .capture(&signal(999, Actor::User, Intent::Command, "hi"))
            .expect_err("unknown");
        assert!(matches!(err, CaptureError::UnknownEntity(999)));

        h.db.end_entity(h.entity_id, "test", Utc::now()).expect("end");
        let err = h
            .coordinator
            .capture(&signal(h.entity_id, Actor::User, Intent::Command, "hi"))
            .expect_err("ended");
        assert!(matches!(err, CaptureError::EntityEnded(_)));
        assert!(h.db.list_turns(h.entity_id, 10).expect("turns").is_empty());
    }

    #[test]
    fn self_transition_does_not_broadcast_state_change() {
        let h = harness();
        h.coordinator
            .capture(&signal(h.entity_id, Actor::User, Intent::Command, "one"))
            .expect("first");
        let outcome = h
            .coordinator
            .capture(&signal(h.entity_id, Actor::User, Intent::Command, "two"))
            .expect("second");
        assert_eq!(
            outcome.transition,
            TransitionOutcome::Applied {
                from: TaskState::Commanded,
                to: TaskState::Commanded
            }
        );
        let state_changes = h
            .events
            .events
            .lock()
            .expect("events")
            .iter()
            .filter(|event| event.event_type() == "state_changed")
            .count();
        assert_eq!(state_changes, 1);
    }

    #[test]
    fn capture_releases_the_entity_lock() {
        let h = harness();
        h.coordinator
            .capture(&signal(h.entity_id, Actor::User, Intent::Command, "one"))
            .expect("capture");
        let locks = AdvisoryLockManager::new(Arc::new(SqliteLockBackend::new(h.db.clone())));
        let guard = locks
            .acquire_non_blocking(ENTITY_NAMESPACE, h.entity_id)
            .expect("acquire");
        assert!(guard.is_some());
    }
}
