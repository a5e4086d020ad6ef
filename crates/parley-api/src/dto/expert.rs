//! Expert and presence DTOs

use parley_core::models::QueueEntry;
use serde::Serialize;

/// An expert's wait queue, head first
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueResponse {
    pub expert_id: String,
    pub length: usize,
    pub entries: Vec<QueueEntry>,
}

impl QueueResponse {
    pub fn new(expert_id: impl Into<String>, entries: Vec<QueueEntry>) -> Self {
        Self {
            expert_id: expert_id.into(),
            length: entries.len(),
            entries,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OnlineResponse {
    pub count: usize,
    pub ids: Vec<String>,
}

impl From<Vec<String>> for OnlineResponse {
    fn from(ids: Vec<String>) -> Self {
        Self {
            count: ids.len(),
            ids,
        }
    }
}
