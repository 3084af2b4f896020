//! Outbound change notifications.

use std::sync::Arc;

use chrono::Utc;
use turnwatch_protocol::BroadcastEvent;

use crate::db::Db;

/// Publishing is best effort: implementations log failures and return.
pub trait Broadcaster: Send + Sync {
    fn publish(&self, event: &BroadcastEvent);
}

/// Appends events to the shared `outbox` table, readable by any process via
/// `get_broadcasts`.
pub struct OutboxBroadcaster {
    db: Arc<Db>,
}

impl OutboxBroadcaster {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

impl Broadcaster for OutboxBroadcaster {
    fn publish(&self, event: &BroadcastEvent) {
        match self.db.insert_broadcast(event, Utc::now()) {
            Ok(id) => tracing::debug!(
                outbox_id = id,
                event = event.event_type(),
                entity_id = event.entity_id(),
                "Broadcast recorded"
            ),
            Err(err) => tracing::warn!(
                event = event.event_type(),
                entity_id = event.entity_id(),
                error = %err,
                "Failed to record broadcast"
            ),
        }
    }
}
