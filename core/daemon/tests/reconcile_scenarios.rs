use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use turnwatch_daemon::broadcast::Broadcaster;
use turnwatch_daemon::capture::{CaptureTimeouts, TurnCaptureCoordinator};
use turnwatch_daemon::db::{format_ts, stored_precision, Db, EntityRecord};
use turnwatch_daemon::lock::{AdvisoryLockManager, SqliteLockBackend, ENTITY_NAMESPACE};
use turnwatch_daemon::reconciler::{TranscriptReconciler, DEFAULT_WINDOW_SECS};
use turnwatch_daemon::error::ReconcileError;
use turnwatch_daemon::store::{NewTurn, TaskRecord, TurnRecord, TurnStore};
use turnwatch_daemon::transcript::{JsonlTranscriptSource, LogEntry};
use turnwatch_daemon::workers::ReconcilerDriver;
use turnwatch_protocol::{
    Actor, BroadcastEvent, EntityRegistration, Intent, TaskState, TimestampSource, TurnSignal,
};

#[derive(Default)]
struct CollectingBroadcaster {
    events: Mutex<Vec<BroadcastEvent>>,
}

impl CollectingBroadcaster {
    fn kinds(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .expect("events")
            .iter()
            .map(|event| event.event_type())
            .collect()
    }

    fn clear(&self) {
        self.events.lock().expect("events").clear();
    }
}

impl Broadcaster for CollectingBroadcaster {
    fn publish(&self, event: &BroadcastEvent) {
        self.events.lock().expect("events").push(event.clone());
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    db: Arc<Db>,
    locks: Arc<AdvisoryLockManager>,
    events: Arc<CollectingBroadcaster>,
    reconciler: Arc<TranscriptReconciler>,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Arc::new(Db::new(dir.path().join("state.db")).expect("db"));
    let locks = Arc::new(AdvisoryLockManager::new(Arc::new(SqliteLockBackend::new(
        db.clone(),
    ))));
    let events = Arc::new(CollectingBroadcaster::default());
    let reconciler = Arc::new(TranscriptReconciler::new(
        db.clone(),
        events.clone(),
        ChronoDuration::seconds(DEFAULT_WINDOW_SECS),
    ));
    Fixture {
        dir,
        db,
        locks,
        events,
        reconciler,
    }
}

fn register(db: &Db, external_id: &str, transcript: Option<&Path>) -> i64 {
    db.register_entity(
        &EntityRegistration {
            external_id: external_id.to_string(),
            pid: None,
            transcript_path: transcript.map(|path| path.display().to_string()),
            terminal_target: None,
        },
        Utc::now(),
    )
    .expect("register")
    .id
}

fn append_line(path: &Path, kind: &str, at: chrono::DateTime<Utc>, text: &str) {
    let line = serde_json::json!({
        "type": kind,
        "timestamp": format_ts(at),
        "message": { "content": text },
    });
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .expect("open transcript");
    writeln!(file, "{}", line).expect("append transcript");
}

#[test]
fn unmatched_entry_on_idle_entity_creates_one_authoritative_turn() {
    let f = fixture();
    let entity_id = register(&f.db, "scenario-a", None);
    let event_time = Utc::now() - ChronoDuration::seconds(10);
    let entries = vec![LogEntry {
        actor: Actor::Agent,
        text: "Starting on the migration.".to_string(),
        event_time,
    }];

    let result = f
        .reconciler
        .reconcile(entity_id, &entries, Utc::now())
        .expect("reconcile");
    assert_eq!(result.created, 1);
    assert_eq!(result.updated, 0);

    let turns = f.db.list_turns(entity_id, 10).expect("turns");
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].timestamp_source, TimestampSource::Authoritative);
    assert_eq!(turns[0].timestamp, stored_precision(event_time));
    assert_eq!(turns[0].intent, Intent::Progress);
    assert_eq!(f.events.kinds(), vec!["turn_created"]);

    // Reconciled turns never move the task.
    let task = f
        .db
        .get_task(turns[0].task_id)
        .expect("get")
        .expect("task");
    assert_eq!(task.state, TaskState::Idle);

    // Replaying the same entries matches the turn it just wrote.
    f.events.clear();
    let again = f
        .reconciler
        .reconcile(entity_id, &entries, Utc::now())
        .expect("reconcile again");
    assert_eq!(again.created, 0);
    assert_eq!(again.updated, 0);
    assert_eq!(again.unchanged, 1);
    assert_eq!(f.db.list_turns(entity_id, 10).expect("turns").len(), 1);
    assert!(f.events.kinds().is_empty());
}

#[test]
fn captured_signal_is_corrected_from_transcript_and_cursor_advances() {
    let f = fixture();
    let transcript = f.dir.path().join("session.jsonl");
    let entity_id = register(&f.db, "reconcile-driver", Some(&transcript));
    let coordinator = TurnCaptureCoordinator::new(
        Arc::clone(&f.locks),
        f.db.clone(),
        f.events.clone(),
        CaptureTimeouts::default(),
    );

    let receipt = Utc::now();
    let captured = coordinator
        .capture(&TurnSignal {
            entity_id,
            actor: Actor::User,
            intent: Intent::Command,
            text: Some("refactor   the parser".to_string()),
            receipt_time: receipt.to_rfc3339(),
            deferred: false,
        })
        .expect("capture");
    f.events.clear();

    let typed_at = receipt - ChronoDuration::seconds(3);
    append_line(&transcript, "user", typed_at, "refactor the parser");
    append_line(
        &transcript,
        "assistant",
        typed_at + ChronoDuration::seconds(1),
        "Looking at the parser now.",
    );

    let driver = ReconcilerDriver::new(
        f.db.clone(),
        Arc::new(JsonlTranscriptSource),
        Arc::clone(&f.reconciler),
    );
    let entity = f.db.get_entity(entity_id).expect("get").expect("entity");

    let guard = f
        .locks
        .acquire_blocking(ENTITY_NAMESPACE, entity_id, Duration::from_secs(1))
        .expect("lock");
    let result = driver
        .reconcile_entity_locked(&guard, &entity, Utc::now())
        .expect("reconcile");
    assert_eq!(result.updated, 1);
    assert_eq!(result.created, 1);

    let cursor = f.db.transcript_cursor(entity_id).expect("cursor");
    assert_eq!(
        cursor,
        std::fs::metadata(&transcript).expect("metadata").len()
    );

    // Nothing new past the cursor.
    let idle = driver
        .reconcile_entity_locked(&guard, &entity, Utc::now())
        .expect("second pass");
    assert_eq!(idle.updated + idle.created + idle.unchanged, 0);
    guard.release();

    let turns = f.db.list_turns(entity_id, 10).expect("turns");
    assert_eq!(turns.len(), 2);
    let corrected = turns
        .iter()
        .find(|turn| turn.id == captured.turn.id)
        .expect("captured turn kept its id");
    assert_eq!(corrected.timestamp, stored_precision(typed_at));
    assert_eq!(corrected.timestamp_source, TimestampSource::Authoritative);
    assert_eq!(f.events.kinds(), vec!["turn_updated", "turn_created"]);

    // The captured transition is untouched by reconciliation.
    let task = f
        .db
        .get_task(captured.task_id)
        .expect("get")
        .expect("task");
    assert_eq!(task.state, TaskState::Commanded);
}

#[test]
fn partial_trailing_line_waits_for_the_next_pass() {
    let f = fixture();
    let transcript = f.dir.path().join("partial.jsonl");
    let entity_id = register(&f.db, "partial", Some(&transcript));
    let at = Utc::now() - ChronoDuration::seconds(2);
    append_line(&transcript, "assistant", at, "first reply");

    let tail = serde_json::json!({
        "type": "assistant",
        "timestamp": format_ts(at + ChronoDuration::seconds(1)),
        "message": { "content": "second reply" },
    })
    .to_string();
    let (head, rest) = tail.split_at(tail.len() / 2);
    {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&transcript)
            .expect("open");
        file.write_all(head.as_bytes()).expect("write head");
    }

    let driver = ReconcilerDriver::new(
        f.db.clone(),
        Arc::new(JsonlTranscriptSource),
        Arc::clone(&f.reconciler),
    );
    let entity = f.db.get_entity(entity_id).expect("get").expect("entity");
    let guard = f
        .locks
        .acquire_blocking(ENTITY_NAMESPACE, entity_id, Duration::from_secs(1))
        .expect("lock");

    let first = driver
        .reconcile_entity_locked(&guard, &entity, Utc::now())
        .expect("first pass");
    assert_eq!(first.created, 1);

    {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&transcript)
            .expect("open");
        writeln!(file, "{}", rest).expect("write rest");
    }
    let second = driver
        .reconcile_entity_locked(&guard, &entity, Utc::now())
        .expect("second pass");
    assert_eq!(second.created, 1);
    guard.release();

    let texts: Vec<String> = f
        .db
        .list_turns(entity_id, 10)
        .expect("turns")
        .into_iter()
        .map(|turn| turn.text)
        .collect();
    assert_eq!(texts, vec!["second reply", "first reply"]);
}

/// Fails the Nth `create_turn` call once, delegating everything else.
struct FailingCreateStore {
    inner: Arc<Db>,
    creates: AtomicUsize,
    fail_on: usize,
}

impl TurnStore for FailingCreateStore {
    fn get_entity(&self, entity_id: i64) -> Result<Option<EntityRecord>, String> {
        self.inner.get_entity(entity_id)
    }

    fn touch_entity(&self, entity_id: i64, now: DateTime<Utc>) -> Result<(), String> {
        self.inner.touch_entity(entity_id, now)
    }

    fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>, String> {
        self.inner.get_task(task_id)
    }

    fn active_task(&self, entity_id: i64) -> Result<Option<TaskRecord>, String> {
        self.inner.active_task(entity_id)
    }

    fn task_for_turn(
        &self,
        entity_id: i64,
        starts_task: bool,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, String> {
        self.inner.task_for_turn(entity_id, starts_task, now)
    }

    fn create_turn(&self, turn: &NewTurn, now: DateTime<Utc>) -> Result<TurnRecord, String> {
        if self.creates.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            return Err("disk I/O error".to_string());
        }
        self.inner.create_turn(turn, now)
    }

    fn turns_since(
        &self,
        entity_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<TurnRecord>, String> {
        self.inner.turns_since(entity_id, since)
    }

    fn list_turns(&self, entity_id: i64, limit: usize) -> Result<Vec<TurnRecord>, String> {
        self.inner.list_turns(entity_id, limit)
    }

    fn latest_turn_id(&self, entity_id: i64) -> Result<Option<i64>, String> {
        self.inner.latest_turn_id(entity_id)
    }

    fn update_turn_timestamp(
        &self,
        turn_id: i64,
        timestamp: DateTime<Utc>,
        source: TimestampSource,
    ) -> Result<bool, String> {
        self.inner.update_turn_timestamp(turn_id, timestamp, source)
    }

    fn apply_transition(
        &self,
        task_id: i64,
        from: TaskState,
        to: TaskState,
        at: DateTime<Utc>,
    ) -> Result<bool, String> {
        self.inner.apply_transition(task_id, from, to, at)
    }
}

#[test]
fn turns_written_before_a_failed_pass_are_still_announced() {
    let f = fixture();
    let entity_id = register(&f.db, "store-failure", None);
    let reconciler = TranscriptReconciler::new(
        Arc::new(FailingCreateStore {
            inner: f.db.clone(),
            creates: AtomicUsize::new(0),
            fail_on: 2,
        }),
        f.events.clone(),
        ChronoDuration::seconds(DEFAULT_WINDOW_SECS),
    );
    let base = Utc::now() - ChronoDuration::seconds(20);
    let entries: Vec<LogEntry> = ["first", "second", "third"]
        .iter()
        .enumerate()
        .map(|(index, text)| LogEntry {
            actor: Actor::Agent,
            text: text.to_string(),
            event_time: base + ChronoDuration::seconds(index as i64),
        })
        .collect();

    let err = reconciler
        .reconcile(entity_id, &entries, Utc::now())
        .expect_err("second create fails");
    assert!(matches!(err, ReconcileError::Store(_)));
    assert_eq!(f.db.list_turns(entity_id, 10).expect("turns").len(), 1);
    assert_eq!(f.events.kinds(), vec!["turn_created"]);

    // The retry matches the committed turn and announces only the new ones.
    f.events.clear();
    let retry = reconciler
        .reconcile(entity_id, &entries, Utc::now())
        .expect("retry");
    assert_eq!(retry.unchanged, 1);
    assert_eq!(retry.created, 2);
    assert_eq!(f.events.kinds(), vec!["turn_created", "turn_created"]);
    assert_eq!(f.db.list_turns(entity_id, 10).expect("turns").len(), 3);
}
