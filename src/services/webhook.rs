//! Outbound webhook notification.
//!
//! Fire-and-forget: lifecycle events are posted to the platform's webhook
//! URL on a dedicated client with a fixed 5 second timeout. Any failure
//! (network, non-2xx, timeout) is logged and swallowed; notifications never
//! fail the command that triggered them and carry no ordering guarantee.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::error;

#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Posts `{event_type, checkout_id, order}` to `webhook_url` on a
    /// background task.
    pub fn notify(
        &self,
        webhook_url: &str,
        event_type: &str,
        checkout_id: &str,
        order: Option<Value>,
    ) {
        let client = self.client.clone();
        let url = webhook_url.to_string();
        let payload = json!({
            "event_type": event_type,
            "checkout_id": checkout_id,
            "order": order,
        });

        tokio::spawn(async move {
            match client.post(&url).json(&payload).send().await {
                Ok(response) if !response.status().is_success() => {
                    error!(
                        "Failed to notify webhook at {url}: status {}",
                        response.status()
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Failed to notify webhook at {url}: {e}");
                }
            }
        });
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}
