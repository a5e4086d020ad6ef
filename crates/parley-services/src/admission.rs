//! Busy-slot controller
//!
//! Each expert has one slot. Acquiring it is a single check-and-insert under
//! one lock, so two concurrent requests can never both be granted.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// The slot is taken; `held_by` is empty until a session is bound to it
    Denied { held_by: Option<Uuid> },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

#[derive(Debug, Default)]
struct Slot {
    session_id: Option<Uuid>,
}

/// Sole authority on whether an expert is busy
#[derive(Debug, Default)]
pub struct AdmissionController {
    slots: Mutex<HashMap<String, Slot>>,
}

impl AdmissionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, expert_id: &str) -> Admission {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(expert_id) {
            debug!(expert_id, "Admission denied");
            return Admission::Denied {
                held_by: slot.session_id,
            };
        }
        slots.insert(expert_id.to_string(), Slot::default());
        debug!(expert_id, "Admission granted");
        Admission::Granted
    }

    /// Attach the session that now owns a held slot
    pub fn bind(&self, expert_id: &str, session_id: Uuid) -> bool {
        match self.slots.lock().get_mut(expert_id) {
            Some(slot) if slot.session_id.is_none() || slot.session_id == Some(session_id) => {
                slot.session_id = Some(session_id);
                true
            }
            _ => false,
        }
    }

    /// Free the slot unconditionally; freeing a free slot is a no-op
    pub fn release(&self, expert_id: &str) -> bool {
        self.slots.lock().remove(expert_id).is_some()
    }

    /// Free the slot only if `session_id` owns it
    pub fn release_held_by(&self, expert_id: &str, session_id: Uuid) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(expert_id) {
            Some(slot) if slot.session_id == Some(session_id) => {
                slots.remove(expert_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_busy(&self, expert_id: &str) -> bool {
        self.slots.lock().contains_key(expert_id)
    }

    pub fn holder(&self, expert_id: &str) -> Option<Uuid> {
        self.slots.lock().get(expert_id).and_then(|s| s.session_id)
    }

    pub fn busy_experts(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
