//! Caps how many foreground handlers may run a critical section at once.
//!
//! Each handler needs a lock session and a work connection from the shared
//! pool. Without a cap, a burst of signals for one entity parks a lock session
//! per waiter and the holder can no longer check out its work connection. The
//! pool is sized for `2 x (limit + background workers)`, so admitting at most
//! `limit` foreground handlers keeps every checkout satisfiable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::error::AdmissionError;

pub const DEFAULT_FOREGROUND_HANDLERS: usize = 8;

const INITIAL_POLL: Duration = Duration::from_millis(2);
const MAX_POLL: Duration = Duration::from_millis(50);

pub struct ForegroundLimit {
    permits: Arc<Semaphore>,
    limit: usize,
    peak: AtomicUsize,
}

/// Held for the whole critical section; dropping it admits the next handler.
#[must_use = "the slot is freed as soon as the permit is dropped"]
pub struct ForegroundPermit {
    _permit: OwnedSemaphorePermit,
}

impl ForegroundLimit {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
            peak: AtomicUsize::new(0),
        }
    }

    /// Waits up to `wait` for a free slot.
    pub fn acquire(&self, wait: Duration) -> Result<ForegroundPermit, AdmissionError> {
        let started = Instant::now();
        let deadline = started + wait;
        let mut poll = INITIAL_POLL;
        loop {
            match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => {
                    self.peak.fetch_max(self.in_flight(), Ordering::SeqCst);
                    return Ok(ForegroundPermit { _permit: permit });
                }
                Err(TryAcquireError::Closed) => {
                    return Err(AdmissionError::Closed);
                }
                Err(TryAcquireError::NoPermits) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(AdmissionError::Timeout {
                    limit: self.limit,
                    waited: now.duration_since(started),
                });
            }
            thread::sleep(poll.min(deadline - now));
            poll = (poll * 2).min(MAX_POLL);
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.limit.saturating_sub(self.permits.available_permits())
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Default for ForegroundLimit {
    fn default() -> Self {
        Self::new(DEFAULT_FOREGROUND_HANDLERS)
    }
}
