//! Notification gateways
//!
//! Push alerts for entities without a live channel. Delivery is best effort:
//! callers fire and forget.

use async_trait::async_trait;
use parley_core::{models::PushAlert, traits::NotificationGateway, AppError, AppResult};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Posts each alert as JSON to a configured webhook
pub struct WebhookGateway {
    client: Client,
    url: String,
}

impl WebhookGateway {
    pub fn new(url: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationGateway for WebhookGateway {
    #[instrument(skip(self, alert), fields(target = %alert.target_id, event = alert.event.name()))]
    async fn push_alert(&self, alert: &PushAlert) -> AppResult<()> {
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| AppError::Gateway(format!("Webhook request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            warn!("Webhook answered {}", status);
            return Err(AppError::Gateway(format!("Webhook answered {}", status)));
        }

        debug!("Push alert delivered");
        Ok(())
    }
}

/// Writes alerts to the log; used when no webhook is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct LogGateway;

#[async_trait]
impl NotificationGateway for LogGateway {
    async fn push_alert(&self, alert: &PushAlert) -> AppResult<()> {
        info!(
            target_id = %alert.target_id,
            event = alert.event.name(),
            "Push alert: {}",
            alert.title
        );
        Ok(())
    }
}
