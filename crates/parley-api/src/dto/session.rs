//! Session DTOs
//!
//! Request and response types for session endpoints.

use parley_core::models::{InteractionKind, Participant, Role, Session};
use parley_services::{InitiateOutcome, SessionRequest};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Session creation request
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[validate(length(min = 1, max = 128, message = "initiatorId is required"))]
    pub initiator_id: String,

    pub initiator_role: Role,

    #[validate(length(min = 1, max = 128, message = "targetId is required"))]
    pub target_id: String,

    pub target_role: Role,

    pub kind: InteractionKind,
}

impl CreateSessionRequest {
    pub fn into_request(self) -> SessionRequest {
        SessionRequest {
            initiator: Participant::new(self.initiator_id, self.initiator_role),
            target: Participant::new(self.target_id, self.target_role),
            kind: self.kind,
        }
    }
}

/// Accept, reject and end requests name the acting participant
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SessionActionRequest {
    #[validate(length(min = 1, max = 128, message = "entityId is required"))]
    pub entity_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitiateStatus {
    Invited,
    Queued,
    ReceiverOffline,
}

/// Outcome of a session request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub status: InitiateStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expert_id: Option<String>,
    /// 1-based queue position
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

impl From<InitiateOutcome> for InitiateResponse {
    fn from(outcome: InitiateOutcome) -> Self {
        match outcome {
            InitiateOutcome::Invited(session) => Self {
                status: InitiateStatus::Invited,
                session: Some(session),
                expert_id: None,
                position: None,
            },
            InitiateOutcome::Queued {
                expert_id,
                position,
            } => Self {
                status: InitiateStatus::Queued,
                session: None,
                expert_id: Some(expert_id),
                position: Some(position),
            },
            InitiateOutcome::ReceiverOffline(session) => Self {
                status: InitiateStatus::ReceiverOffline,
                session: Some(session),
                expert_id: None,
                position: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_parses_wire_names() {
        let req: CreateSessionRequest = serde_json::from_value(serde_json::json!({
            "initiatorId": "u1",
            "initiatorRole": "requester",
            "targetId": "e1",
            "targetRole": "expert",
            "kind": "video"
        }))
        .unwrap();
        assert!(req.validate().is_ok());

        let request = req.into_request();
        assert_eq!(request.initiator, Participant::requester("u1"));
        assert_eq!(request.target, Participant::expert("e1"));
        assert_eq!(request.kind, InteractionKind::Video);
    }

    #[test]
    fn test_empty_ids_fail_validation() {
        let req = CreateSessionRequest {
            initiator_id: String::new(),
            initiator_role: Role::Requester,
            target_id: "e1".to_string(),
            target_role: Role::Expert,
            kind: InteractionKind::Chat,
        };
        assert!(req.validate().is_err());

        let action = SessionActionRequest {
            entity_id: String::new(),
        };
        assert!(action.validate().is_err());
    }

    #[test]
    fn test_queued_response_shape() {
        let response = InitiateResponse::from(InitiateOutcome::Queued {
            expert_id: "e1".to_string(),
            position: 2,
        });
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "queued");
        assert_eq!(json["position"], 2);
        assert_eq!(json["expertId"], "e1");
        assert!(json.get("session").is_none());
    }
}
