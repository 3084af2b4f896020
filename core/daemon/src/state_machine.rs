//! Task lifecycle validator.
//!
//! Pure lookup over a fixed table. Anything not listed is rejected; callers
//! never apply a transition this module did not return.

use turnwatch_protocol::{Actor, Intent, TaskState};

use crate::error::TransitionError;

type Edge = (TaskState, Actor, Intent, TaskState);

const TRANSITIONS: &[Edge] = &[
    (TaskState::Idle, Actor::User, Intent::Command, TaskState::Commanded),
    (TaskState::Commanded, Actor::User, Intent::Command, TaskState::Commanded),
    (TaskState::Commanded, Actor::Agent, Intent::Progress, TaskState::Processing),
    (TaskState::Commanded, Actor::Agent, Intent::Question, TaskState::AwaitingInput),
    (TaskState::Commanded, Actor::Agent, Intent::Completion, TaskState::Complete),
    (TaskState::Commanded, Actor::Agent, Intent::EndOfCommand, TaskState::Complete),
    (TaskState::Processing, Actor::User, Intent::Command, TaskState::Processing),
    (TaskState::Processing, Actor::User, Intent::Answer, TaskState::Processing),
    (TaskState::Processing, Actor::Agent, Intent::Progress, TaskState::Processing),
    (TaskState::Processing, Actor::Agent, Intent::Question, TaskState::AwaitingInput),
    (TaskState::Processing, Actor::Agent, Intent::Completion, TaskState::Complete),
    (TaskState::Processing, Actor::Agent, Intent::EndOfCommand, TaskState::Complete),
    (TaskState::AwaitingInput, Actor::User, Intent::Answer, TaskState::Processing),
    (TaskState::AwaitingInput, Actor::User, Intent::Command, TaskState::Processing),
    (TaskState::AwaitingInput, Actor::Agent, Intent::Progress, TaskState::Processing),
    (TaskState::AwaitingInput, Actor::Agent, Intent::Question, TaskState::AwaitingInput),
    (TaskState::AwaitingInput, Actor::Agent, Intent::Completion, TaskState::Complete),
    (TaskState::AwaitingInput, Actor::Agent, Intent::EndOfCommand, TaskState::Complete),
];

pub fn transition(
    current: TaskState,
    actor: Actor,
    intent: Intent,
) -> Result<TaskState, TransitionError> {
    TRANSITIONS
        .iter()
        .find(|(from, edge_actor, edge_intent, _)| {
            *from == current && *edge_actor == actor && *edge_intent == intent
        })
        .map(|(_, _, _, to)| *to)
        .ok_or(TransitionError::Invalid {
            from: current,
            actor,
            intent,
        })
}

/// Whether `(actor, intent)` may open work on an idle entity.
pub fn starts_task(actor: Actor, intent: Intent) -> bool {
    transition(TaskState::Idle, actor, intent).is_ok()
}
