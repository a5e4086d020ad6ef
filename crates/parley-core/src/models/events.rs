//! Events pushed to connected endpoints
//!
//! Serialized as `{"event": "<name>", "data": {...}}` on the real-time
//! transport, and wrapped in a `PushAlert` when the target has no live channel.

use crate::models::queue::QueueEntry;
use crate::models::session::{EndReason, InteractionKind, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server to client event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum OutboundEvent {
    /// Sent to the callee of a new session
    IncomingSession {
        session_id: Uuid,
        kind: InteractionKind,
        from_id: String,
        from_role: Role,
    },
    /// Sent to the initiator once the invitation went out
    SessionInitiated {
        session_id: Uuid,
        kind: InteractionKind,
        to_id: String,
    },
    SessionAccepted {
        session_id: Uuid,
    },
    SessionEnded {
        session_id: Uuid,
        reason: EndReason,
        duration_seconds: Option<i64>,
    },
    /// The expert was busy; the requester waits at `position` (1-based)
    Queued {
        expert_id: String,
        position: usize,
    },
    /// The expert freed up; the requester may request again
    YourTurn {
        expert_id: String,
        kind: InteractionKind,
    },
    LowBalanceAlert {
        session_id: Uuid,
        remaining_intervals: i64,
        balance: i64,
    },
    /// Full wait queue, sent to the expert
    QueueSnapshot {
        expert_id: String,
        entries: Vec<QueueEntry>,
    },
    OnlineEntities {
        ids: Vec<String>,
    },
    Error {
        message: String,
    },
    Pong,
}

impl OutboundEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::IncomingSession { .. } => "incomingSession",
            OutboundEvent::SessionInitiated { .. } => "sessionInitiated",
            OutboundEvent::SessionAccepted { .. } => "sessionAccepted",
            OutboundEvent::SessionEnded { .. } => "sessionEnded",
            OutboundEvent::Queued { .. } => "queued",
            OutboundEvent::YourTurn { .. } => "yourTurn",
            OutboundEvent::LowBalanceAlert { .. } => "lowBalanceAlert",
            OutboundEvent::QueueSnapshot { .. } => "queueSnapshot",
            OutboundEvent::OnlineEntities { .. } => "onlineEntities",
            OutboundEvent::Error { .. } => "error",
            OutboundEvent::Pong => "pong",
        }
    }
}

/// Out-of-band notification for an entity without a live channel
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushAlert {
    pub target_id: String,
    pub title: String,
    pub event: OutboundEvent,
    pub created_at: DateTime<Utc>,
}

impl PushAlert {
    pub fn new(target_id: impl Into<String>, event: OutboundEvent) -> Self {
        let title = match &event {
            OutboundEvent::IncomingSession { kind, .. } => format!("Incoming {} session", kind),
            OutboundEvent::YourTurn { kind, .. } => format!("Your turn to {}", kind),
            OutboundEvent::SessionEnded { reason, .. } => format!("Session ended ({})", reason),
            other => other.name().to_string(),
        };

        Self {
            target_id: target_id.into(),
            title,
            event,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format() {
        let event = OutboundEvent::YourTurn {
            expert_id: "e1".to_string(),
            kind: InteractionKind::Chat,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "yourTurn", "data": {"expertId": "e1", "kind": "chat"}})
        );

        let ended = OutboundEvent::SessionEnded {
            session_id: Uuid::nil(),
            reason: EndReason::LowBalance,
            duration_seconds: Some(180),
        };
        let value = serde_json::to_value(&ended).unwrap();
        assert_eq!(value["event"], "sessionEnded");
        assert_eq!(value["data"]["reason"], "low-balance");
        assert_eq!(value["data"]["durationSeconds"], 180);
    }

    #[test]
    fn test_name_matches_tag() {
        let event = OutboundEvent::LowBalanceAlert {
            session_id: Uuid::nil(),
            remaining_intervals: 1,
            balance: 30,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], event.name());
        assert_eq!(serde_json::to_value(OutboundEvent::Pong).unwrap()["event"], "pong");
    }

    #[test]
    fn test_push_alert_title() {
        let alert = PushAlert::new(
            "u1",
            OutboundEvent::IncomingSession {
                session_id: Uuid::nil(),
                kind: InteractionKind::Video,
                from_id: "e1".to_string(),
                from_role: Role::Expert,
            },
        );
        assert_eq!(alert.title, "Incoming video session");
        assert_eq!(alert.target_id, "u1");
    }
}
