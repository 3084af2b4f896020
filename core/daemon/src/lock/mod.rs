//! Cross-process advisory locking keyed per monitored entity.
//!
//! # Model
//!
//! A lock is addressed by an integer `(namespace, key)` pair and lives on a
//! *dedicated* backend session, never on the caller's work connection. The
//! caller can commit as often as it likes inside its critical section; the
//! lock goes away only when the guard is released or the session closes.
//!
//! # Reentrancy
//!
//! Each thread records the pairs it holds. Asking for a pair the thread
//! already holds would open a second session that waits on the first one
//! forever, so blocking acquisition fails immediately with
//! [`LockError::Reentrancy`] and non-blocking acquisition reports "not
//! acquired".
//!
//! # Release
//!
//! Release always issues the backend unlock and always closes the session,
//! including after a timed-out wait. A backend can grant a lock just after the
//! client gave up waiting; unlocking anyway keeps that grant from outliving
//! the caller.

mod sqlite;

pub use sqlite::{SessionStats, SqliteLockBackend};

use std::cell::RefCell;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use turnwatch_protocol::HeldLockInfo;

use crate::error::LockError;

/// Namespace for per-entity critical sections; the key is the entity id.
pub const ENTITY_NAMESPACE: i64 = 1;

/// Source of dedicated lock sessions.
pub trait LockBackend: Send + Sync {
    /// Opens a dedicated session, distinct from any work connection.
    fn open_session(&self) -> Result<Box<dyn LockSession>, String>;

    /// Snapshot of the backend's lock catalog.
    fn held_locks(&self) -> Result<Vec<HeldLockInfo>, String>;
}

/// One dedicated backend session. Dropping it closes the session and releases
/// anything it still holds.
pub trait LockSession: Send {
    fn session_id(&self) -> &str;

    /// Waits up to `wait` for the lock.
    fn lock(&mut self, namespace: i64, key: i64, wait: Duration) -> Result<(), LockError>;

    /// Single attempt; never waits.
    fn try_lock(&mut self, namespace: i64, key: i64) -> Result<bool, LockError>;

    /// Returns whether this session actually held the lock.
    fn unlock(&mut self, namespace: i64, key: i64) -> Result<bool, LockError>;
}

thread_local! {
    static HELD_LOCKS: RefCell<HashSet<(i64, i64)>> = RefCell::new(HashSet::new());
}

fn held_by_current_thread(namespace: i64, key: i64) -> bool {
    HELD_LOCKS.with(|held| held.borrow().contains(&(namespace, key)))
}

fn mark_held(namespace: i64, key: i64) {
    HELD_LOCKS.with(|held| {
        held.borrow_mut().insert((namespace, key));
    });
}

fn forget_held(namespace: i64, key: i64) {
    HELD_LOCKS.with(|held| {
        held.borrow_mut().remove(&(namespace, key));
    });
}

pub struct AdvisoryLockManager {
    backend: Arc<dyn LockBackend>,
}

impl AdvisoryLockManager {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self { backend }
    }

    /// Waits up to `timeout` for the lock on a dedicated session.
    pub fn acquire_blocking(
        &self,
        namespace: i64,
        key: i64,
        timeout: Duration,
    ) -> Result<LockGuard, LockError> {
        if held_by_current_thread(namespace, key) {
            warn!(namespace, key, "Refusing reentrant blocking lock acquisition");
            return Err(LockError::Reentrancy { namespace, key });
        }

        let mut session = self.open_session(namespace, key)?;
        match session.lock(namespace, key, timeout) {
            Ok(()) => {
                mark_held(namespace, key);
                debug!(namespace, key, session_id = %session.session_id(), "Lock acquired");
                Ok(LockGuard::new(namespace, key, session))
            }
            Err(err) => {
                debug!(namespace, key, error = %err, "Blocking lock acquisition failed");
                close_session(session, namespace, key);
                Err(err)
            }
        }
    }

    /// Single attempt. `Ok(None)` means the lock is busy, or already held by
    /// this thread.
    pub fn acquire_non_blocking(
        &self,
        namespace: i64,
        key: i64,
    ) -> Result<Option<LockGuard>, LockError> {
        if held_by_current_thread(namespace, key) {
            warn!(namespace, key, "Lock already held by this thread; not acquiring");
            return Ok(None);
        }

        let mut session = self.open_session(namespace, key)?;
        match session.try_lock(namespace, key) {
            Ok(true) => {
                mark_held(namespace, key);
                Ok(Some(LockGuard::new(namespace, key, session)))
            }
            Ok(false) => {
                close_session(session, namespace, key);
                Ok(None)
            }
            Err(err) => {
                close_session(session, namespace, key);
                Err(err)
            }
        }
    }

    pub fn held_locks(&self) -> Result<Vec<HeldLockInfo>, String> {
        self.backend.held_locks()
    }

    fn open_session(&self, namespace: i64, key: i64) -> Result<Box<dyn LockSession>, LockError> {
        self.backend
            .open_session()
            .map_err(|details| LockError::PoolExhausted {
                namespace,
                key,
                details,
            })
    }
}

/// Unlock regardless of what the caller believes it holds, then close.
fn close_session(mut session: Box<dyn LockSession>, namespace: i64, key: i64) {
    if let Err(err) = session.unlock(namespace, key) {
        warn!(namespace, key, error = %err, "Advisory unlock failed during cleanup");
    }
    drop(session);
}

/// Proof that the current thread holds `(namespace, key)`.
///
/// Dropping the guard releases the lock. The guard is `!Send`: the held-lock
/// bookkeeping is per thread, so it must be released where it was taken.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    namespace: i64,
    key: i64,
    session: Option<Box<dyn LockSession>>,
    acquired_at: Instant,
    _not_send: PhantomData<*const ()>,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("namespace", &self.namespace)
            .field("key", &self.key)
            .field("acquired_at", &self.acquired_at)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    fn new(namespace: i64, key: i64, session: Box<dyn LockSession>) -> Self {
        Self {
            namespace,
            key,
            session: Some(session),
            acquired_at: Instant::now(),
            _not_send: PhantomData,
        }
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        forget_held(self.namespace, self.key);
        match session.unlock(self.namespace, self.key) {
            Ok(true) => debug!(
                namespace = self.namespace,
                key = self.key,
                held_ms = self.held_for().as_millis() as u64,
                "Lock released"
            ),
            Ok(false) => warn!(
                namespace = self.namespace,
                key = self.key,
                "Lock was no longer held at release"
            ),
            Err(err) => warn!(
                namespace = self.namespace,
                key = self.key,
                error = %err,
                "Advisory unlock failed; closing session"
            ),
        }
        drop(session);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory backend that records every unlock call.
    #[derive(Default)]
    struct RecordingBackend {
        held: Arc<Mutex<HashSet<(i64, i64)>>>,
        unlocks: Arc<AtomicUsize>,
        fail_unlock: Arc<AtomicBool>,
        grant_after_timeout: Arc<AtomicBool>,
    }

    struct RecordingSession {
        held: Arc<Mutex<HashSet<(i64, i64)>>>,
        owned: HashSet<(i64, i64)>,
        unlocks: Arc<AtomicUsize>,
        fail_unlock: Arc<AtomicBool>,
        grant_after_timeout: Arc<AtomicBool>,
    }

    impl LockBackend for RecordingBackend {
        fn open_session(&self) -> Result<Box<dyn LockSession>, String> {
            Ok(Box::new(RecordingSession {
                held: Arc::clone(&self.held),
                owned: HashSet::new(),
                unlocks: Arc::clone(&self.unlocks),
                fail_unlock: Arc::clone(&self.fail_unlock),
                grant_after_timeout: Arc::clone(&self.grant_after_timeout),
            }))
        }

        fn held_locks(&self) -> Result<Vec<HeldLockInfo>, String> {
            Ok(Vec::new())
        }
    }

    impl LockSession for RecordingSession {
        fn session_id(&self) -> &str {
            "recording"
        }

        fn lock(&mut self, namespace: i64, key: i64, wait: Duration) -> Result<(), LockError> {
            if self.grant_after_timeout.load(Ordering::SeqCst) {
                // The grant lands just as the client stops waiting.
                self.held.lock().expect("held").insert((namespace, key));
                self.owned.insert((namespace, key));
                return Err(LockError::Timeout {
                    namespace,
                    key,
                    waited: wait,
                });
            }
            if self.try_lock(namespace, key)? {
                Ok(())
            } else {
                Err(LockError::Timeout {
                    namespace,
                    key,
                    waited: wait,
                })
            }
        }

        fn try_lock(&mut self, namespace: i64, key: i64) -> Result<bool, LockError> {
            let granted = self.held.lock().expect("held").insert((namespace, key));
            if granted {
                self.owned.insert((namespace, key));
            }
            Ok(granted)
        }

        fn unlock(&mut self, namespace: i64, key: i64) -> Result<bool, LockError> {
            self.unlocks.fetch_add(1, Ordering::SeqCst);
            if self.fail_unlock.load(Ordering::SeqCst) {
                return Err(LockError::Backend("connection reset".to_string()));
            }
            if !self.owned.remove(&(namespace, key)) {
                return Ok(false);
            }
            Ok(self.held.lock().expect("held").remove(&(namespace, key)))
        }
    }

    fn manager() -> (Arc<RecordingBackend>, AdvisoryLockManager) {
        let backend = Arc::new(RecordingBackend::default());
        let manager = AdvisoryLockManager::new(backend.clone());
        (backend, manager)
    }

    #[test]
    fn blocking_reentry_fails_fast() {
        let (_backend, manager) = manager();
        let guard = manager
            .acquire_blocking(ENTITY_NAMESPACE, 1, Duration::from_secs(5))
            .expect("first acquire");

        let started = Instant::now();
        let err = manager
            .acquire_blocking(ENTITY_NAMESPACE, 1, Duration::from_secs(5))
            .expect_err("reentry");
        assert!(matches!(err, LockError::Reentrancy { key: 1, .. }));
        assert!(started.elapsed() < Duration::from_millis(100));

        drop(guard);
        let again = manager
            .acquire_blocking(ENTITY_NAMESPACE, 1, Duration::from_secs(5))
            .expect("acquire after release");
        drop(again);
    }

    #[test]
    fn non_blocking_reentry_reports_not_acquired() {
        let (_backend, manager) = manager();
        let _guard = manager
            .acquire_non_blocking(ENTITY_NAMESPACE, 2)
            .expect("acquire")
            .expect("granted");
        let second = manager
            .acquire_non_blocking(ENTITY_NAMESPACE, 2)
            .expect("no error");
        assert!(second.is_none());
    }

    #[test]
    fn timeout_still_unlocks_phantom_grant() {
        let (backend, manager) = manager();
        backend.grant_after_timeout.store(true, Ordering::SeqCst);

        let err = manager
            .acquire_blocking(ENTITY_NAMESPACE, 3, Duration::from_millis(10))
            .expect_err("timeout");
        assert!(matches!(err, LockError::Timeout { .. }));
        assert_eq!(backend.unlocks.load(Ordering::SeqCst), 1);
        assert!(backend.held.lock().expect("held").is_empty());
        assert!(!held_by_current_thread(ENTITY_NAMESPACE, 3));
    }

    #[test]
    fn unlock_failure_is_swallowed_and_bookkeeping_cleared() {
        let (backend, manager) = manager();
        let guard = manager
            .acquire_blocking(ENTITY_NAMESPACE, 4, Duration::from_secs(1))
            .expect("acquire");
        backend.fail_unlock.store(true, Ordering::SeqCst);
        guard.release();

        assert_eq!(backend.unlocks.load(Ordering::SeqCst), 1);
        assert!(!held_by_current_thread(ENTITY_NAMESPACE, 4));
    }

    #[test]
    fn busy_non_blocking_acquire_still_issues_unlock() {
        let (backend, manager) = manager();
        backend
            .held
            .lock()
            .expect("held")
            .insert((ENTITY_NAMESPACE, 5));

        let result = manager
            .acquire_non_blocking(ENTITY_NAMESPACE, 5)
            .expect("no error");
        assert!(result.is_none());
        assert_eq!(backend.unlocks.load(Ordering::SeqCst), 1);
        // The cleanup unlock only touches what this session owned.
        assert!(backend
            .held
            .lock()
            .expect("held")
            .contains(&(ENTITY_NAMESPACE, 5)));
    }

    #[test]
    fn distinct_keys_are_tracked_independently() {
        let (_backend, manager) = manager();
        let first = manager
            .acquire_blocking(ENTITY_NAMESPACE, 6, Duration::from_secs(1))
            .expect("first");
        let second = manager
            .acquire_blocking(ENTITY_NAMESPACE, 7, Duration::from_secs(1))
            .expect("second");
        assert_eq!(first.key(), 6);
        assert_eq!(second.key(), 7);
        assert!(held_by_current_thread(ENTITY_NAMESPACE, 6));
        assert!(held_by_current_thread(ENTITY_NAMESPACE, 7));
        drop(first);
        assert!(!held_by_current_thread(ENTITY_NAMESPACE, 6));
        assert!(held_by_current_thread(ENTITY_NAMESPACE, 7));
    }
}
