//! Presence registry
//!
//! Maps an entity id to its live real-time channel. A channel whose receiving
//! side went away without a disconnect event is detected on the next lookup
//! and purged, so the registry heals itself instead of trusting the transport
//! to always report closes.

use parking_lot::RwLock;
use parley_core::models::OutboundEvent;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Sending half of a connection's outbound event stream
pub type EventSender = mpsc::UnboundedSender<OutboundEvent>;

/// Receiving half, drained by the transport writer
pub type EventReceiver = mpsc::UnboundedReceiver<OutboundEvent>;

/// Handle to one live connection
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    connection_id: Uuid,
    tx: EventSender,
}

impl ChannelHandle {
    /// Open a new channel; the transport keeps the receiver
    pub fn open() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn new(tx: EventSender) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            tx,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// False once the transport dropped its receiver
    pub fn is_live(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue an event; never blocks
    pub fn send(&self, event: OutboundEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Entity id to channel map
#[derive(Default)]
pub struct PresenceRegistry {
    channels: RwLock<HashMap<String, ChannelHandle>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an entity to a channel, returning the channel it replaces
    pub fn register(&self, entity_id: impl Into<String>, channel: ChannelHandle) -> Option<ChannelHandle> {
        let entity_id = entity_id.into();
        debug!(entity_id = %entity_id, connection_id = %channel.connection_id, "Channel registered");
        self.channels.write().insert(entity_id, channel)
    }

    pub fn unregister(&self, entity_id: &str) -> Option<ChannelHandle> {
        self.channels.write().remove(entity_id)
    }

    /// Remove whichever entity owns this connection
    ///
    /// A newer connection registered for the same entity is left in place.
    pub fn unregister_channel(&self, connection_id: Uuid) -> Option<String> {
        let mut channels = self.channels.write();
        let entity_id = channels
            .iter()
            .find(|(_, handle)| handle.connection_id == connection_id)
            .map(|(id, _)| id.clone())?;
        channels.remove(&entity_id);
        debug!(entity_id = %entity_id, connection_id = %connection_id, "Channel unregistered");
        Some(entity_id)
    }

    /// Live channel of an entity; purges a stale entry instead of returning it
    pub fn lookup(&self, entity_id: &str) -> Option<ChannelHandle> {
        let stale_connection = {
            let channels = self.channels.read();
            let handle = channels.get(entity_id)?;
            if handle.is_live() {
                return Some(handle.clone());
            }
            handle.connection_id
        };

        let mut channels = self.channels.write();
        // Re-check under the write lock: the entity may have reconnected.
        match channels.get(entity_id) {
            Some(handle) if handle.connection_id == stale_connection => {
                channels.remove(entity_id);
                debug!(entity_id, "Purged stale channel");
                None
            }
            Some(handle) if handle.is_live() => Some(handle.clone()),
            _ => None,
        }
    }

    pub fn is_online(&self, entity_id: &str) -> bool {
        self.lookup(entity_id).is_some()
    }

    /// Ids with a live channel, sorted; drops every stale entry found
    pub fn list_online(&self) -> Vec<String> {
        let mut channels = self.channels.write();
        let before = channels.len();
        channels.retain(|_, handle| handle.is_live());
        if channels.len() < before {
            debug!("Purged {} stale channels", before - channels.len());
        }

        let mut ids: Vec<String> = channels.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Registered entries, stale ones included
    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }
}
