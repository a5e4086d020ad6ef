//! Wait queue entries

use crate::models::session::InteractionKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A requester waiting for an expert's slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub requester_id: String,
    pub kind: InteractionKind,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(requester_id: impl Into<String>, kind: InteractionKind) -> Self {
        Self {
            requester_id: requester_id.into(),
            kind,
            enqueued_at: Utc::now(),
        }
    }
}
