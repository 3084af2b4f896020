//! Error types for the coordination core.
//!
//! Storage helpers keep the daemon's `Result<T, String>` convention; the
//! types here are the ones callers are expected to branch on.

use std::path::PathBuf;
use std::time::Duration;

use turnwatch_protocol::{Actor, Intent, TaskState};

// ─────────────────────────────────────────────────────────────────────────────
// Lock errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Blocking acquire waited the full lock-wait budget without a grant.
    #[error("Timed out after {waited:?} waiting for lock ({namespace}, {key})")]
    Timeout {
        namespace: i64,
        key: i64,
        waited: Duration,
    },

    /// The calling thread already holds this lock. Acquiring it again on a
    /// second dedicated connection would block forever.
    #[error("Lock ({namespace}, {key}) is already held by this thread")]
    Reentrancy { namespace: i64, key: i64 },

    #[error("No connection available for lock ({namespace}, {key}): {details}")]
    PoolExhausted {
        namespace: i64,
        key: i64,
        details: String,
    },

    #[error("Lock backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// Every foreground slot stayed busy for the whole wait.
    #[error("All {limit} foreground handler slots busy after {waited:?}")]
    Timeout { limit: usize, waited: Duration },

    #[error("Foreground handler limit is shut down")]
    Closed,
}

// ─────────────────────────────────────────────────────────────────────────────
// State machine errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error(
        "Invalid transition from {} on {} {}",
        from.as_str(),
        actor.as_str(),
        intent.as_str()
    )]
    Invalid {
        from: TaskState,
        actor: Actor,
        intent: Intent,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Unknown entity: {0}")]
    UnknownEntity(i64),

    #[error("Entity {0} has ended")]
    EntityEnded(i64),

    #[error("Turn store failure: {0}")]
    Store(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Unknown entity: {0}")]
    UnknownEntity(i64),

    #[error("Turn store failure: {0}")]
    Store(String),

    #[error("Transcript read failure: {0}")]
    Transcript(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {details}")]
    Malformed { path: PathBuf, details: String },

    #[error("pool_size {pool_size} is below the required minimum of {required} (2 x {holders} concurrent lock holders)")]
    PoolTooSmall {
        pool_size: usize,
        required: usize,
        holders: usize,
    },

    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("{field} must admit at least one handler")]
    ZeroLimit { field: &'static str },
}
