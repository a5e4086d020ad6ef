//! Per-expert FIFO wait queues
//!
//! Each expert's queue has its own lock: operations on one expert are
//! linearized, different experts never contend. A requester appears at most
//! once per queue. An expert's queue exists only while someone is waiting.

use parking_lot::{Mutex, RwLock};
use parley_core::models::QueueEntry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Appended; 1-based position
    Enqueued { position: usize },
    /// Already waiting; nothing changed
    AlreadyQueued { position: usize },
    /// The slot was released before the entry could be added; retry admission
    SlotFreed,
}

type Queue = Arc<Mutex<VecDeque<QueueEntry>>>;

#[derive(Default)]
pub struct WaitQueue {
    queues: RwLock<HashMap<String, Queue>>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop an expert's queue once it is empty
    ///
    /// Runs under the map's write lock, which excludes every push in flight,
    /// so no entry can land in a queue that is being removed.
    fn prune(&self, expert_id: &str) {
        let mut queues = self.queues.write();
        if queues
            .get(expert_id)
            .is_some_and(|queue| queue.lock().is_empty())
        {
            queues.remove(expert_id);
            debug!(expert_id, "Dropped empty queue");
        }
    }

    fn existing(&self, expert_id: &str) -> Option<Queue> {
        self.queues.read().get(expert_id).cloned()
    }

    pub fn push(&self, expert_id: &str, entry: QueueEntry) -> PushOutcome {
        self.push_unless_free(expert_id, entry, || true)
    }

    /// Append unless `still_busy` reports the slot free
    ///
    /// `still_busy` runs under the queue lock. A releaser that frees the slot
    /// and then pops this queue therefore either sees the new entry or makes
    /// the push return `SlotFreed`; the request is never stranded.
    pub fn push_unless_free(
        &self,
        expert_id: &str,
        entry: QueueEntry,
        still_busy: impl FnOnce() -> bool,
    ) -> PushOutcome {
        loop {
            let queues = self.queues.read();
            if let Some(queue) = queues.get(expert_id) {
                let outcome = Self::push_locked(expert_id, &mut queue.lock(), entry, still_busy);
                drop(queues);
                if outcome == PushOutcome::SlotFreed {
                    self.prune(expert_id);
                }
                return outcome;
            }
            drop(queues);
            self.queues
                .write()
                .entry(expert_id.to_string())
                .or_default();
        }
    }

    fn push_locked(
        expert_id: &str,
        queue: &mut VecDeque<QueueEntry>,
        entry: QueueEntry,
        still_busy: impl FnOnce() -> bool,
    ) -> PushOutcome {
        if let Some(index) = queue
            .iter()
            .position(|e| e.requester_id == entry.requester_id)
        {
            debug!(
                expert_id,
                requester_id = %entry.requester_id,
                "Requester already queued"
            );
            return PushOutcome::AlreadyQueued { position: index + 1 };
        }

        if !still_busy() {
            return PushOutcome::SlotFreed;
        }

        info!(expert_id, requester_id = %entry.requester_id, kind = %entry.kind, "Requester queued");
        queue.push_back(entry);
        PushOutcome::Enqueued {
            position: queue.len(),
        }
    }

    /// Remove and return the head; the entry is gone as soon as it is selected
    pub fn pop_front(&self, expert_id: &str) -> Option<QueueEntry> {
        let (entry, emptied) = {
            let queue = self.existing(expert_id)?;
            let mut queue = queue.lock();
            let entry = queue.pop_front();
            (entry, queue.is_empty())
        };
        if emptied {
            self.prune(expert_id);
        }
        entry
    }

    pub fn list_all(&self, expert_id: &str) -> Vec<QueueEntry> {
        self.existing(expert_id)
            .map(|q| q.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn remove(&self, expert_id: &str, requester_id: &str) -> bool {
        let Some(queue) = self.existing(expert_id) else {
            return false;
        };
        let (removed, emptied) = {
            let mut queue = queue.lock();
            let before = queue.len();
            queue.retain(|e| e.requester_id != requester_id);
            (queue.len() < before, queue.is_empty())
        };
        if emptied {
            self.prune(expert_id);
        }
        removed
    }

    pub fn position(&self, expert_id: &str, requester_id: &str) -> Option<usize> {
        self.existing(expert_id)?
            .lock()
            .iter()
            .position(|e| e.requester_id == requester_id)
            .map(|i| i + 1)
    }

    pub fn len(&self, expert_id: &str) -> usize {
        self.existing(expert_id).map(|q| q.lock().len()).unwrap_or(0)
    }

    /// Experts with at least one waiting requester
    pub fn expert_count(&self) -> usize {
        self.queues.read().len()
    }
}
