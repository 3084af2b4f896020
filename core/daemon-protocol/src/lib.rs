//! IPC protocol types and validation for turnwatch-daemon.
//!
//! Shared by the daemon and the layers around it (webhook decoder, dashboard)
//! so the wire schema cannot drift. The daemon remains the authority on
//! validation, but clients can reuse the same types to build valid requests.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_TURN_TEXT_BYTES: usize = 256 * 1024;
const MAX_EXTERNAL_ID_LEN: usize = 128;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    RegisterEntity,
    EndEntity,
    Signal,
    GetTurns,
    GetLocks,
    GetBroadcasts,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Domain vocabulary
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    User,
    Agent,
}

impl Actor {
    pub const ALL: [Actor; 2] = [Actor::User, Actor::Agent];

    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::User => "user",
            Actor::Agent => "agent",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Actor::User),
            "agent" => Some(Actor::Agent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Command,
    Progress,
    Question,
    Answer,
    Completion,
    EndOfCommand,
}

impl Intent {
    pub const ALL: [Intent; 6] = [
        Intent::Command,
        Intent::Progress,
        Intent::Question,
        Intent::Answer,
        Intent::Completion,
        Intent::EndOfCommand,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Command => "command",
            Intent::Progress => "progress",
            Intent::Question => "question",
            Intent::Answer => "answer",
            Intent::Completion => "completion",
            Intent::EndOfCommand => "end_of_command",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "command" => Some(Intent::Command),
            "progress" => Some(Intent::Progress),
            "question" => Some(Intent::Question),
            "answer" => Some(Intent::Answer),
            "completion" => Some(Intent::Completion),
            "end_of_command" => Some(Intent::EndOfCommand),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Commanded,
    Processing,
    AwaitingInput,
    Complete,
}

impl TaskState {
    pub const ALL: [TaskState; 5] = [
        TaskState::Idle,
        TaskState::Commanded,
        TaskState::Processing,
        TaskState::AwaitingInput,
        TaskState::Complete,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Complete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Idle => "idle",
            TaskState::Commanded => "commanded",
            TaskState::Processing => "processing",
            TaskState::AwaitingInput => "awaiting_input",
            TaskState::Complete => "complete",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(TaskState::Idle),
            "commanded" => Some(TaskState::Commanded),
            "processing" => Some(TaskState::Processing),
            "awaiting_input" => Some(TaskState::AwaitingInput),
            "complete" => Some(TaskState::Complete),
            _ => None,
        }
    }
}

/// Where a turn's `timestamp` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampSource {
    /// Receipt time of a tier-1 signal.
    Approximate,
    /// Event time read from the agent's own transcript.
    Authoritative,
}

impl TimestampSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimestampSource::Approximate => "approximate",
            TimestampSource::Authoritative => "authoritative",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "approximate" => Some(TimestampSource::Approximate),
            "authoritative" => Some(TimestampSource::Authoritative),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Tier-1 lifecycle signal decoded by the webhook layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TurnSignal {
    pub entity_id: i64,
    pub actor: Actor,
    pub intent: Intent,
    #[serde(default)]
    pub text: Option<String>,
    pub receipt_time: String,
    /// Signals that had to wait on upstream (e.g. a transcript flush) get the
    /// longer lock-wait budget.
    #[serde(default)]
    pub deferred: bool,
}

impl TurnSignal {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_entity_id(self.entity_id)?;
        if DateTime::parse_from_rfc3339(&self.receipt_time).is_err() {
            return Err(ErrorInfo::new(
                "invalid_timestamp",
                "receipt_time must be RFC3339",
            ));
        }
        if let Some(text) = &self.text {
            if text.len() > MAX_TURN_TEXT_BYTES {
                return Err(ErrorInfo::new(
                    "text_too_large",
                    format!("text must be {} bytes or fewer", MAX_TURN_TEXT_BYTES),
                ));
            }
        }
        Ok(())
    }

    pub fn receipt_time_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.receipt_time)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntityRegistration {
    pub external_id: String,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub transcript_path: Option<String>,
    #[serde(default)]
    pub terminal_target: Option<String>,
}

impl EntityRegistration {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.external_id.trim().is_empty() {
            return Err(ErrorInfo::new(
                "invalid_external_id",
                "external_id is required",
            ));
        }
        if self.external_id.len() > MAX_EXTERNAL_ID_LEN {
            return Err(ErrorInfo::new(
                "invalid_external_id",
                "external_id must be 128 characters or fewer",
            ));
        }
        if self.pid == Some(0) {
            return Err(ErrorInfo::new("invalid_pid", "pid must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndEntityParams {
    pub entity_id: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

impl EndEntityParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_entity_id(self.entity_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TurnQuery {
    pub entity_id: i64,
    #[serde(default = "default_query_limit")]
    pub limit: usize,
}

impl TurnQuery {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_entity_id(self.entity_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BroadcastQuery {
    #[serde(default)]
    pub after_id: i64,
    #[serde(default = "default_query_limit")]
    pub limit: usize,
}

impl BroadcastQuery {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.after_id < 0 {
            return Err(ErrorInfo::new(
                "invalid_params",
                "after_id must be non-negative",
            ));
        }
        Ok(())
    }
}

fn default_query_limit() -> usize {
    100
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound payloads
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnView {
    pub id: i64,
    pub entity_id: i64,
    pub task_id: i64,
    pub actor: Actor,
    pub intent: Intent,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub timestamp_source: TimestampSource,
}

/// Events published to the dashboard/notification layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BroadcastEvent {
    TurnCreated {
        entity_id: i64,
        turn: TurnView,
    },
    TurnUpdated {
        entity_id: i64,
        turn_id: i64,
        previous_timestamp: DateTime<Utc>,
        timestamp: DateTime<Utc>,
        timestamp_source: TimestampSource,
    },
    StateChanged {
        entity_id: i64,
        task_id: i64,
        from: TaskState,
        to: TaskState,
    },
}

impl BroadcastEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            BroadcastEvent::TurnCreated { .. } => "turn_created",
            BroadcastEvent::TurnUpdated { .. } => "turn_updated",
            BroadcastEvent::StateChanged { .. } => "state_changed",
        }
    }

    pub fn entity_id(&self) -> i64 {
        match self {
            BroadcastEvent::TurnCreated { entity_id, .. }
            | BroadcastEvent::TurnUpdated { entity_id, .. }
            | BroadcastEvent::StateChanged { entity_id, .. } => *entity_id,
        }
    }
}

/// Row of the lock catalog, for the monitoring endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeldLockInfo {
    pub namespace: i64,
    pub key: i64,
    pub mode: String,
    pub session_id: String,
    pub holder_pid: u32,
    pub granted_at: String,
    pub held_for_secs: i64,
}

/// Deserialize and validate request params in one step.
pub fn parse_params<T, F>(params: Value, validate: F) -> Result<T, ErrorInfo>
where
    T: DeserializeOwned,
    F: FnOnce(&T) -> Result<(), ErrorInfo>,
{
    let parsed: T = serde_json::from_value(params)
        .map_err(|err| ErrorInfo::new("invalid_params", format!("params are invalid: {}", err)))?;
    validate(&parsed)?;
    Ok(parsed)
}

fn require_entity_id(entity_id: i64) -> Result<(), ErrorInfo> {
    if entity_id <= 0 {
        return Err(ErrorInfo::new(
            "invalid_entity_id",
            "entity_id must be positive",
        ));
    }
    Ok(())
}
