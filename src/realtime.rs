//! Per-session publish/subscribe topics for push delivery of turn replies and
//! plan-ready notifications. Delivery is best-effort: there is no replay, and
//! a client that misses events resynchronizes through the history and plan
//! read endpoints.

use crate::engine::TurnPhase;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

const TOPIC_CAPACITY: usize = 64;

/// Event payloads published on a session topic.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    #[serde(rename = "message.received")]
    MessageReceived {
        message: String,
        role: String,
        turn_number: i32,
        turn_status: TurnPhase,
    },
    #[serde(rename = "plan.ready")]
    PlanReady {
        plan_id: Uuid,
        status: String,
        summary: String,
    },
}

impl SessionEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            SessionEvent::MessageReceived { .. } => "message.received",
            SessionEvent::PlanReady { .. } => "plan.ready",
        }
    }

    pub fn assistant_message(message: String, turn_number: i32, turn_status: TurnPhase) -> Self {
        SessionEvent::MessageReceived {
            message,
            role: "assistant".to_string(),
            turn_number,
            turn_status,
        }
    }

    pub fn plan_ready(plan_id: Uuid, summary: String) -> Self {
        SessionEvent::PlanReady {
            plan_id,
            status: "completed".to_string(),
            summary,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

/// Topic registry keyed by session id. Topics are created lazily on first
/// subscribe or publish and dropped when a session reaches a terminal state.
pub struct RealtimeNotifier {
    topics: Mutex<HashMap<Uuid, broadcast::Sender<SessionEvent>>>,
}

impl Default for RealtimeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeNotifier {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Conventional topic name for a session.
    pub fn topic_name(session_id: Uuid) -> String {
        format!("discovery.{}", session_id)
    }

    pub fn subscribe(&self, session_id: Uuid) -> broadcast::Receiver<SessionEvent> {
        let mut topics = self.topics.lock().expect("topic registry poisoned");
        topics
            .entry(session_id)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Publishes an event to the session topic. Publishing with no connected
    /// subscribers is a successful no-op.
    pub fn publish(&self, session_id: Uuid, event: SessionEvent) {
        let topics = self.topics.lock().expect("topic registry poisoned");
        match topics.get(&session_id) {
            Some(sender) => {
                let delivered = sender.send(event.clone()).unwrap_or(0);
                trace!(
                    "Published {} on {} to {} subscriber(s)",
                    event.event_name(),
                    Self::topic_name(session_id),
                    delivered
                );
            }
            None => {
                trace!(
                    "Dropping {} for {}: no topic",
                    event.event_name(),
                    Self::topic_name(session_id)
                );
            }
        }
    }

    /// Removes the topic for a session that has reached a terminal state.
    pub fn close_topic(&self, session_id: Uuid) {
        let mut topics = self.topics.lock().expect("topic registry poisoned");
        if topics.remove(&session_id).is_some() {
            debug!("Closed topic {}", Self::topic_name(session_id));
        }
    }
}
