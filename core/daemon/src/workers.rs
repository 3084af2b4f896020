//! Periodic background workers.
//!
//! Every worker walks its working set one entity at a time: one
//! non-blocking lock attempt, bounded work, commit, release. A busy entity is
//! skipped and picked up on the next pass, so a worker never holds more than
//! one lock session and never waits on a foreground handler. Terminal sampling
//! runs before the lock attempt, never inside it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::{Db, EntityRecord};
use crate::error::ReconcileError;
use crate::lock::{AdvisoryLockManager, LockGuard, SqliteLockBackend, ENTITY_NAMESPACE};
use crate::process::is_pid_alive;
use crate::reconciler::{ReconcileResult, TranscriptReconciler};
use crate::sampler::{OutputSample, OutputSampler};
use crate::store::TurnStore;
use crate::transcript::TranscriptSource;
use crate::watchdog::{GapVerdict, GapWatchdog};

/// Reaper, reconciler driver, watchdog driver and context poller. Each may
/// hold one entity lock at a time.
pub const BACKGROUND_WORKER_COUNT: usize = 4;

pub trait EntityWorker: Send + Sync {
    fn name(&self) -> &'static str;

    fn working_set(&self) -> Result<Vec<EntityRecord>, String>;

    /// Lock-free sample taken before the lock attempt; its result is handed
    /// to `process`.
    fn observe(&self, _entity: &EntityRecord) -> Option<OutputSample> {
        None
    }

    /// Runs with the entity's lock held by the caller.
    fn process(
        &self,
        guard: &LockGuard,
        entity: &EntityRecord,
        observed: Option<OutputSample>,
        now: DateTime<Utc>,
    ) -> Result<(), String>;

    /// Called once after every pass with the set that was walked.
    fn finish_pass(&self, _working_set: &[EntityRecord]) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct WorkerCounters {
    passes: AtomicU64,
    processed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub name: &'static str,
    pub passes: u64,
    pub processed: u64,
    pub skipped: u64,
    pub failed: u64,
}

pub struct WorkerLoop {
    worker: Arc<dyn EntityWorker>,
    locks: Arc<AdvisoryLockManager>,
    counters: Arc<WorkerCounters>,
}

impl WorkerLoop {
    pub fn new(worker: Arc<dyn EntityWorker>, locks: Arc<AdvisoryLockManager>) -> Self {
        Self {
            worker,
            locks,
            counters: Arc::new(WorkerCounters::default()),
        }
    }

    pub fn run_pass(&self) -> PassReport {
        let name = self.worker.name();
        let mut report = PassReport::default();
        let entities = match self.worker.working_set() {
            Ok(entities) => entities,
            Err(err) => {
                warn!(worker = name, error = %err, "Failed to load worker working set");
                return report;
            }
        };

        for entity in &entities {
            let observed = self.worker.observe(entity);
            match self.locks.acquire_non_blocking(ENTITY_NAMESPACE, entity.id) {
                Ok(Some(guard)) => {
                    match self.worker.process(&guard, entity, observed, Utc::now()) {
                        Ok(()) => report.processed += 1,
                        Err(err) => {
                            warn!(
                                worker = name,
                                entity_id = entity.id,
                                error = %err,
                                "Background work failed for entity"
                            );
                            report.failed += 1;
                        }
                    }
                    guard.release();
                }
                Ok(None) => {
                    debug!(
                        worker = name,
                        entity_id = entity.id,
                        "Entity lock busy; skipping until next pass"
                    );
                    report.skipped += 1;
                }
                Err(err) => {
                    warn!(
                        worker = name,
                        entity_id = entity.id,
                        error = %err,
                        "Failed to attempt entity lock"
                    );
                    report.failed += 1;
                }
            }
        }

        self.worker.finish_pass(&entities);
        self.record(report);
        report
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            name: self.worker.name(),
            passes: self.counters.passes.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Runs a pass every `interval` on a dedicated thread.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> Result<JoinHandle<()>, String> {
        let name = self.worker.name();
        thread::Builder::new()
            .name(format!("turnwatch-{}", name))
            .spawn(move || loop {
                thread::sleep(interval);
                let report = self.run_pass();
                if report.failed > 0 {
                    warn!(
                        worker = name,
                        processed = report.processed,
                        skipped = report.skipped,
                        failed = report.failed,
                        "Background pass finished with failures"
                    );
                }
            })
            .map_err(|err| format!("Failed to spawn {} worker: {}", name, err))
    }

    fn record(&self, report: PassReport) {
        self.counters.passes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .processed
            .fetch_add(report.processed as u64, Ordering::Relaxed);
        self.counters
            .skipped
            .fetch_add(report.skipped as u64, Ordering::Relaxed);
        self.counters
            .failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Health reaper
// ─────────────────────────────────────────────────────────────────────────────

/// Ends entities whose process is gone or that stopped reporting. Tasks are
/// left as they are.
pub struct HealthReaper {
    db: Arc<Db>,
    lock_backend: Arc<SqliteLockBackend>,
    inactivity_timeout: ChronoDuration,
}

impl HealthReaper {
    pub fn new(
        db: Arc<Db>,
        lock_backend: Arc<SqliteLockBackend>,
        inactivity_timeout: ChronoDuration,
    ) -> Self {
        Self {
            db,
            lock_backend,
            inactivity_timeout,
        }
    }

    fn end_reason(&self, entity: &EntityRecord, now: DateTime<Utc>) -> Option<&'static str> {
        if let Some(pid) = entity.pid {
            if !is_pid_alive(pid) {
                return Some("process_exited");
            }
        }
        if now - entity.last_seen_at > self.inactivity_timeout {
            return Some("inactive");
        }
        None
    }
}

impl EntityWorker for HealthReaper {
    fn name(&self) -> &'static str {
        "reaper"
    }

    fn working_set(&self) -> Result<Vec<EntityRecord>, String> {
        self.db.list_live_entities()
    }

    fn process(
        &self,
        _guard: &LockGuard,
        entity: &EntityRecord,
        _observed: Option<OutputSample>,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        // The working set may be stale by the time the lock is ours.
        let Some(current) = self.db.get_entity(entity.id)? else {
            return Ok(());
        };
        if !current.is_live() {
            return Ok(());
        }
        let Some(reason) = self.end_reason(&current, now) else {
            return Ok(());
        };
        if self.db.end_entity(current.id, reason, now)? {
            info!(entity_id = current.id, reason, "Entity ended by health reaper");
        }
        Ok(())
    }

    fn finish_pass(&self, _working_set: &[EntityRecord]) {
        match self.lock_backend.purge_orphaned() {
            Ok(0) => {}
            Ok(purged) => info!(purged, "Purged orphaned advisory locks"),
            Err(err) => warn!(error = %err, "Failed to purge orphaned advisory locks"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transcript reconciliation
// ─────────────────────────────────────────────────────────────────────────────

pub struct ReconcilerDriver {
    db: Arc<Db>,
    source: Arc<dyn TranscriptSource>,
    reconciler: Arc<TranscriptReconciler>,
}

impl ReconcilerDriver {
    pub fn new(
        db: Arc<Db>,
        source: Arc<dyn TranscriptSource>,
        reconciler: Arc<TranscriptReconciler>,
    ) -> Self {
        Self {
            db,
            source,
            reconciler,
        }
    }

    /// Reconciles new transcript entries for `entity`. The guard is the
    /// caller's hold on that entity's lock; it is not re-acquired here.
    pub fn reconcile_entity_locked(
        &self,
        guard: &LockGuard,
        entity: &EntityRecord,
        now: DateTime<Utc>,
    ) -> Result<ReconcileResult, ReconcileError> {
        debug_assert_eq!(guard.key(), entity.id);
        let offset = self
            .db
            .transcript_cursor(entity.id)
            .map_err(ReconcileError::Store)?;
        let batch = self
            .source
            .read_since(entity, offset)
            .map_err(ReconcileError::Transcript)?;
        let result = self.reconciler.reconcile(entity.id, &batch.entries, now)?;
        if batch.next_offset != offset {
            self.db
                .set_transcript_cursor(entity.id, batch.next_offset, now)
                .map_err(ReconcileError::Store)?;
        }
        Ok(result)
    }
}

impl EntityWorker for ReconcilerDriver {
    fn name(&self) -> &'static str {
        "reconciler"
    }

    fn working_set(&self) -> Result<Vec<EntityRecord>, String> {
        Ok(self
            .db
            .list_live_entities()?
            .into_iter()
            .filter(|entity| entity.transcript_path.is_some())
            .collect())
    }

    fn process(
        &self,
        guard: &LockGuard,
        entity: &EntityRecord,
        _observed: Option<OutputSample>,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        self.reconcile_entity_locked(guard, entity, now)
            .map(|_| ())
            .map_err(|err| err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Gap watchdog
// ─────────────────────────────────────────────────────────────────────────────

pub struct WatchdogDriver {
    db: Arc<Db>,
    sampler: Arc<dyn OutputSampler>,
    watchdog: Arc<GapWatchdog>,
    reconciler: Arc<ReconcilerDriver>,
}

impl WatchdogDriver {
    pub fn new(
        db: Arc<Db>,
        sampler: Arc<dyn OutputSampler>,
        watchdog: Arc<GapWatchdog>,
        reconciler: Arc<ReconcilerDriver>,
    ) -> Self {
        Self {
            db,
            sampler,
            watchdog,
            reconciler,
        }
    }
}

impl EntityWorker for WatchdogDriver {
    fn name(&self) -> &'static str {
        "watchdog"
    }

    fn working_set(&self) -> Result<Vec<EntityRecord>, String> {
        self.db.list_live_entities()
    }

    fn observe(&self, entity: &EntityRecord) -> Option<OutputSample> {
        self.sampler.sample(entity)
    }

    fn process(
        &self,
        guard: &LockGuard,
        entity: &EntityRecord,
        observed: Option<OutputSample>,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        let latest_turn_id = self.db.latest_turn_id(entity.id)?;
        match self
            .watchdog
            .observe(entity.id, observed.as_ref(), latest_turn_id, now)
        {
            GapVerdict::Unavailable => {
                debug!(entity_id = entity.id, "No output channel; skipping gap check");
            }
            GapVerdict::Gap { since } => {
                info!(
                    entity_id = entity.id,
                    since = %since,
                    "Output changed without a new turn; reconciling out of cycle"
                );
                let result = self
                    .reconciler
                    .reconcile_entity_locked(guard, entity, now)
                    .map_err(|err| err.to_string())?;
                debug!(
                    entity_id = entity.id,
                    updated = result.updated,
                    created = result.created,
                    "Out-of-cycle reconciliation finished"
                );
            }
            GapVerdict::Baseline
            | GapVerdict::Quiet
            | GapVerdict::Pending { .. }
            | GapVerdict::Covered => {}
        }
        Ok(())
    }

    fn finish_pass(&self, working_set: &[EntityRecord]) {
        self.watchdog
            .retain(|entity_id| working_set.iter().any(|entity| entity.id == entity_id));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Context usage
// ─────────────────────────────────────────────────────────────────────────────

/// `(pattern, reports remaining rather than used)`
static CONTEXT_PATTERNS: Lazy<Vec<(Regex, bool)>> = Lazy::new(|| {
    [
        (r"(?i)(\d{1,3})%\s+context\s+left", true),
        (r"(?i)context\s+left\s+until\s+auto-compact:\s*(\d{1,3})%", true),
        (r"(?i)context:\s*(\d{1,3})%", false),
    ]
    .into_iter()
    .map(|(pattern, remaining)| {
        (
            Regex::new(pattern).expect("context pattern compiles"),
            remaining,
        )
    })
    .collect()
});

/// Percentage of the context window in use, from the last indicator in
/// `text`.
pub fn parse_context_percent(text: &str) -> Option<u8> {
    let mut latest: Option<(usize, u8)> = None;
    for (pattern, remaining) in CONTEXT_PATTERNS.iter() {
        for caps in pattern.captures_iter(text) {
            let (Some(whole), Some(value)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let Ok(percent) = value.as_str().parse::<u8>() else {
                continue;
            };
            if percent > 100 {
                continue;
            }
            let used = if *remaining { 100 - percent } else { percent };
            if latest.map_or(true, |(offset, _)| whole.start() >= offset) {
                latest = Some((whole.start(), used));
            }
        }
    }
    latest.map(|(_, used)| used)
}

pub struct ContextPoller {
    db: Arc<Db>,
    sampler: Arc<dyn OutputSampler>,
}

impl ContextPoller {
    pub fn new(db: Arc<Db>, sampler: Arc<dyn OutputSampler>) -> Self {
        Self { db, sampler }
    }
}

impl EntityWorker for ContextPoller {
    fn name(&self) -> &'static str {
        "context"
    }

    fn working_set(&self) -> Result<Vec<EntityRecord>, String> {
        Ok(self
            .db
            .list_live_entities()?
            .into_iter()
            .filter(|entity| entity.terminal_target.is_some())
            .collect())
    }

    fn observe(&self, entity: &EntityRecord) -> Option<OutputSample> {
        self.sampler.sample(entity)
    }

    fn process(
        &self,
        _guard: &LockGuard,
        entity: &EntityRecord,
        observed: Option<OutputSample>,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        let Some(sample) = observed else {
            debug!(entity_id = entity.id, "No output channel; skipping context poll");
            return Ok(());
        };
        if let Some(percent) = parse_context_percent(&sample.text) {
            if entity.context_percent != Some(percent) {
                debug!(entity_id = entity.id, percent, "Context usage changed");
            }
            self.db.update_context(entity.id, percent, now)?;
        }
        Ok(())
    }
}
