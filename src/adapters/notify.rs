//! Approval notifications.
//!
//! Delivery is fire-and-forget: the orchestrator never waits on a channel and
//! a failed delivery never affects the workflow.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{info, warn};

use super::{DeliveryResult, Notice, Notifier};

/// Writes notices to the log
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notice: &Notice) -> Vec<DeliveryResult> {
        info!(
            task_id = %notice.task_id,
            step = %notice.step_id,
            tool = %notice.intent.tool_name,
            lane = %notice.triage.lane,
            reason = %notice.triage.reason,
            risk_factors = ?notice.triage.risk_factors,
            url = %notice.dashboard_url,
            expires_at = %notice.expires_at,
            "Approval needed"
        );
        vec![DeliveryResult::delivered("log")]
    }
}

/// Posts notices as JSON to a webhook
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notice: &Notice) -> Vec<DeliveryResult> {
        let response = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", &notice.idempotency_key)
            .json(notice)
            .send()
            .await;

        let result = match response {
            Ok(resp) if resp.status().is_success() => DeliveryResult::delivered("webhook"),
            Ok(resp) => DeliveryResult::failed("webhook", format!("HTTP {}", resp.status())),
            Err(e) => DeliveryResult::failed("webhook", e.to_string()),
        };
        vec![result]
    }
}

/// Fans notices out to every channel, at most once per idempotency key
#[derive(Default)]
pub struct Notifications {
    channels: Vec<Arc<dyn Notifier>>,
    sent: Arc<Mutex<HashSet<String>>>,
}

impl Notifications {
    pub fn new(channels: Vec<Arc<dyn Notifier>>) -> Self {
        Self {
            channels,
            sent: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Spawn delivery in the background.
    ///
    /// Returns false when a notice with the same key was already dispatched.
    pub fn dispatch(&self, notice: Notice) -> bool {
        {
            let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
            if !sent.insert(notice.idempotency_key.clone()) {
                return false;
            }
        }

        let channels = self.channels.clone();
        tokio::spawn(async move {
            for channel in channels {
                for result in channel.notify(&notice).await {
                    if !result.delivered {
                        warn!(
                            channel = %result.channel,
                            task_id = %notice.task_id,
                            error = result.error.as_deref().unwrap_or("unknown"),
                            "Notification delivery failed"
                        );
                    }
                }
            }
        });
        true
    }
}
