//! Gap detection on tier-3 output.
//!
//! Terminal output that changes without a matching new turn inside the gap
//! threshold means tier 1 probably missed something. The verdict tells the
//! caller to reconcile that entity out of cycle.
//!
//! Sample state is process-local; it carries no cross-process meaning.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::sampler::OutputSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapVerdict {
    /// No output channel for this entity.
    Unavailable,
    /// First sample; nothing to compare against yet.
    Baseline,
    Quiet,
    /// Output changed and no turn has arrived yet; still inside the threshold.
    Pending { since: DateTime<Utc> },
    /// A new turn arrived after the output changed.
    Covered,
    Gap { since: DateTime<Utc> },
}

#[derive(Debug)]
struct PendingChange {
    since: DateTime<Utc>,
    latest_turn_id: Option<i64>,
}

#[derive(Debug)]
struct EntityWatch {
    last_hash: String,
    pending: Option<PendingChange>,
}

pub struct GapWatchdog {
    threshold: ChronoDuration,
    watches: Mutex<HashMap<i64, EntityWatch>>,
}

impl GapWatchdog {
    pub fn new(threshold: ChronoDuration) -> Self {
        Self {
            threshold,
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// `latest_turn_id` is the entity's newest turn as of this observation.
    pub fn observe(
        &self,
        entity_id: i64,
        sample: Option<&OutputSample>,
        latest_turn_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> GapVerdict {
        let Some(sample) = sample else {
            return GapVerdict::Unavailable;
        };
        let hash = format!("{:x}", md5::compute(sample.text.as_bytes()));

        let mut watches = self.lock_watches();
        let Some(watch) = watches.get_mut(&entity_id) else {
            watches.insert(
                entity_id,
                EntityWatch {
                    last_hash: hash,
                    pending: None,
                },
            );
            return GapVerdict::Baseline;
        };

        if watch.last_hash != hash {
            watch.last_hash = hash;
            if watch.pending.is_none() {
                watch.pending = Some(PendingChange {
                    since: now,
                    latest_turn_id,
                });
            }
        }

        let Some(pending) = watch.pending.as_ref() else {
            return GapVerdict::Quiet;
        };
        if latest_turn_id != pending.latest_turn_id {
            watch.pending = None;
            return GapVerdict::Covered;
        }
        if now - pending.since >= self.threshold {
            let since = pending.since;
            watch.pending = None;
            return GapVerdict::Gap { since };
        }
        GapVerdict::Pending {
            since: pending.since,
        }
    }

    /// Drops state for entities that left the working set.
    pub fn retain(&self, live: impl Fn(i64) -> bool) {
        self.lock_watches().retain(|entity_id, _| live(*entity_id));
    }

    pub fn watched(&self) -> usize {
        self.lock_watches().len()
    }

    fn lock_watches(&self) -> MutexGuard<'_, HashMap<i64, EntityWatch>> {
        match self.watches.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
