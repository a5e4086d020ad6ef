//! Outbound event delivery
//!
//! Sends over the entity's live channel when there is one. Otherwise the event
//! is either handed to the notification gateway or dropped, depending on the
//! call site. Nothing here waits on the gateway.

use crate::presence::PresenceRegistry;
use parley_core::models::{OutboundEvent, PushAlert};
use parley_core::traits::NotificationGateway;
use std::sync::Arc;
use tracing::{debug, warn};

/// How an event reached (or failed to reach) its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the live channel
    Delivered,
    /// Handed to the notification gateway
    Alerted,
    /// No channel and no fallback
    Unreachable,
}

pub struct Notifier {
    presence: Arc<PresenceRegistry>,
    gateway: Arc<dyn NotificationGateway>,
}

impl Notifier {
    pub fn new(presence: Arc<PresenceRegistry>, gateway: Arc<dyn NotificationGateway>) -> Self {
        Self { presence, gateway }
    }

    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.presence
    }

    /// Channel only; an offline target is a normal outcome
    pub fn send(&self, target_id: &str, event: OutboundEvent) -> Delivery {
        match self.presence.lookup(target_id) {
            Some(channel) if channel.send(event.clone()) => Delivery::Delivered,
            _ => {
                debug!(target_id, event = event.name(), "Target unreachable, event dropped");
                Delivery::Unreachable
            }
        }
    }

    /// Channel first, then the push gateway
    pub fn send_or_alert(&self, target_id: &str, event: OutboundEvent) -> Delivery {
        if let Some(channel) = self.presence.lookup(target_id) {
            if channel.send(event.clone()) {
                return Delivery::Delivered;
            }
        }

        let alert = PushAlert::new(target_id, event);
        let gateway = Arc::clone(&self.gateway);
        debug!(target_id, title = %alert.title, "Target offline, falling back to push alert");
        tokio::spawn(async move {
            if let Err(e) = gateway.push_alert(&alert).await {
                warn!(target_id = %alert.target_id, "Push alert failed: {}", e);
            }
        });
        Delivery::Alerted
    }
}
