//! Session models
//!
//! A session is one metered interaction between a requester and an expert.
//! Participant roles are resolved once, when the session is created.

use crate::error::AppError;
use crate::AppResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Which side of the marketplace an entity belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The paying party
    Requester,
    /// The single-slot provider
    Expert,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Requester => write!(f, "requester"),
            Role::Expert => write!(f, "expert"),
        }
    }
}

impl Role {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "requester" => Some(Role::Requester),
            "expert" => Some(Role::Expert),
            _ => None,
        }
    }
}

/// A role-tagged entity identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub role: Role,
}

impl Participant {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    pub fn requester(id: impl Into<String>) -> Self {
        Self::new(id, Role::Requester)
    }

    pub fn expert(id: impl Into<String>) -> Self {
        Self::new(id, Role::Expert)
    }
}

/// Kind of interaction; selects the expert's per-interval charge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionKind {
    Chat,
    Audio,
    Video,
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InteractionKind::Chat => write!(f, "chat"),
            InteractionKind::Audio => write!(f, "audio"),
            InteractionKind::Video => write!(f, "video"),
        }
    }
}

impl InteractionKind {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "chat" => Some(InteractionKind::Chat),
            "audio" => Some(InteractionKind::Audio),
            "video" => Some(InteractionKind::Video),
            _ => None,
        }
    }
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Invitation sent, not yet accepted
    #[default]
    Created,
    /// Accepted and being billed
    Active,
    /// Terminal
    Ended,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Created => write!(f, "created"),
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Ended => write!(f, "ended"),
        }
    }
}

impl SessionStatus {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "created" => Some(SessionStatus::Created),
            "active" => Some(SessionStatus::Active),
            "ended" => Some(SessionStatus::Ended),
            _ => None,
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    Manual,
    LowBalance,
    Rejected,
    Unreachable,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Manual => write!(f, "manual"),
            EndReason::LowBalance => write!(f, "low-balance"),
            EndReason::Rejected => write!(f, "rejected"),
            EndReason::Unreachable => write!(f, "unreachable"),
        }
    }
}

impl EndReason {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "manual" => Some(EndReason::Manual),
            "low-balance" => Some(EndReason::LowBalance),
            "rejected" => Some(EndReason::Rejected),
            "unreachable" => Some(EndReason::Unreachable),
            _ => None,
        }
    }
}

/// Session record
///
/// `participant_a` is the initiator. Exactly one participant is a requester
/// and the other an expert; `Session::new` refuses anything else, so the
/// role accessors below never have to guess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub participant_a: Participant,
    pub participant_b: Participant,
    pub kind: InteractionKind,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub end_reason: Option<EndReason>,
}

impl Session {
    /// Create a session in `created` state after validating both parties
    pub fn new(
        initiator: Participant,
        target: Participant,
        kind: InteractionKind,
    ) -> AppResult<Self> {
        validate_pair(&initiator, &target)?;

        Ok(Self {
            id: Uuid::now_v7(),
            participant_a: initiator,
            participant_b: target,
            kind,
            status: SessionStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            duration_seconds: None,
            end_reason: None,
        })
    }

    pub fn expert(&self) -> &Participant {
        if self.participant_a.role == Role::Expert {
            &self.participant_a
        } else {
            &self.participant_b
        }
    }

    pub fn requester(&self) -> &Participant {
        if self.participant_a.role == Role::Requester {
            &self.participant_a
        } else {
            &self.participant_b
        }
    }

    pub fn expert_id(&self) -> &str {
        &self.expert().id
    }

    pub fn requester_id(&self) -> &str {
        &self.requester().id
    }

    /// The initiator
    pub fn initiator(&self) -> &Participant {
        &self.participant_a
    }

    /// The party that has to accept
    pub fn callee(&self) -> &Participant {
        &self.participant_b
    }

    pub fn involves(&self, entity_id: &str) -> bool {
        self.participant_a.id == entity_id || self.participant_b.id == entity_id
    }

    pub fn is_ended(&self) -> bool {
        self.status == SessionStatus::Ended
    }

    /// Next state after the callee accepts
    pub fn to_started(&self, at: DateTime<Utc>) -> AppResult<Self> {
        match self.status {
            SessionStatus::Created => {
                let mut next = self.clone();
                next.status = SessionStatus::Active;
                next.started_at = Some(at);
                Ok(next)
            }
            SessionStatus::Active => Err(AppError::Conflict(format!(
                "session {} already accepted",
                self.id
            ))),
            SessionStatus::Ended => Err(AppError::Conflict(format!(
                "session {} already ended",
                self.id
            ))),
        }
    }

    /// Next state after termination; `None` when already ended
    ///
    /// The duration is fixed here and nowhere else.
    pub fn to_ended(&self, at: DateTime<Utc>, reason: EndReason) -> Option<Self> {
        if self.is_ended() {
            return None;
        }

        let mut next = self.clone();
        next.status = SessionStatus::Ended;
        next.ended_at = Some(at);
        next.end_reason = Some(reason);
        next.duration_seconds = Some(
            self.started_at
                .map(|started| duration_seconds(started, at))
                .unwrap_or(0),
        );
        Some(next)
    }
}

/// Whole seconds between two instants, rounded to nearest
pub fn duration_seconds(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> i64 {
    let millis = (ended_at - started_at).num_milliseconds();
    if millis <= 0 {
        return 0;
    }
    (millis + 500) / 1000
}

fn validate_pair(initiator: &Participant, target: &Participant) -> AppResult<()> {
    if initiator.id.trim().is_empty() || target.id.trim().is_empty() {
        return Err(AppError::Validation(
            "participant ids must not be empty".to_string(),
        ));
    }
    if initiator.id == target.id {
        return Err(AppError::Validation(
            "a session needs two distinct participants".to_string(),
        ));
    }
    if initiator.role == target.role {
        return Err(AppError::Validation(format!(
            "a session pairs a requester with an expert, got two {}s",
            initiator.role
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample() -> Session {
        Session::new(
            Participant::requester("u1"),
            Participant::expert("e1"),
            InteractionKind::Chat,
        )
        .unwrap()
    }

    #[test]
    fn test_roles_resolved_regardless_of_initiator() {
        let s = Session::new(
            Participant::expert("e1"),
            Participant::requester("u1"),
            InteractionKind::Video,
        )
        .unwrap();

        assert_eq!(s.expert_id(), "e1");
        assert_eq!(s.requester_id(), "u1");
        assert_eq!(s.initiator().id, "e1");
        assert_eq!(s.callee().id, "u1");
    }

    #[test]
    fn test_rejects_same_role_and_same_id() {
        assert!(matches!(
            Session::new(
                Participant::requester("u1"),
                Participant::requester("u2"),
                InteractionKind::Chat
            ),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            Session::new(
                Participant::requester("x"),
                Participant::expert("x"),
                InteractionKind::Chat
            ),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            Session::new(
                Participant::requester(" "),
                Participant::expert("e1"),
                InteractionKind::Chat
            ),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_duration_rounds_to_nearest_second() {
        let start = Utc::now();
        assert_eq!(duration_seconds(start, start + Duration::milliseconds(1499)), 1);
        assert_eq!(duration_seconds(start, start + Duration::milliseconds(1500)), 2);
        assert_eq!(duration_seconds(start, start - Duration::seconds(3)), 0);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let created = sample();
        let start = created.created_at + Duration::seconds(2);
        let active = created.to_started(start).unwrap();
        assert_eq!(active.status, SessionStatus::Active);
        assert!(active.to_started(start).is_err());

        let ended = active
            .to_ended(start + Duration::seconds(90), EndReason::Manual)
            .unwrap();
        assert_eq!(ended.duration_seconds, Some(90));
        assert_eq!(ended.end_reason, Some(EndReason::Manual));

        // Terminal: a second end is a no-op and the duration is never recomputed.
        assert!(ended
            .to_ended(start + Duration::seconds(500), EndReason::LowBalance)
            .is_none());
        assert!(matches!(ended.to_started(start), Err(AppError::Conflict(_))));
    }

    #[test]
    fn test_rejected_before_start_has_zero_duration() {
        let created = sample();
        let ended = created
            .to_ended(created.created_at + Duration::seconds(20), EndReason::Rejected)
            .unwrap();
        assert_eq!(ended.duration_seconds, Some(0));
        assert!(ended.started_at.is_none());
    }

    #[test]
    fn test_enum_round_trip_strings() {
        assert_eq!(EndReason::from_str("low-balance"), Some(EndReason::LowBalance));
        assert_eq!(EndReason::LowBalance.to_string(), "low-balance");
        assert_eq!(SessionStatus::from_str("ACTIVE"), Some(SessionStatus::Active));
        assert_eq!(InteractionKind::from_str("fax"), None);
        assert_eq!(Role::from_str("expert"), Some(Role::Expert));
    }
}
