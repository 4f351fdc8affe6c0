//! Outbound notifications
//!
//! A bus listener that POSTs terminal task events to a configured webhook
//! as JSON. Registered on the awaited listener path so the runner's final
//! `task:completed` flushes before the process exits. Failures are logged
//! and never propagate.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::NotifyConfig;
use crate::events::{Event, EventBus, Listener};

/// Posts terminal events to a webhook
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }

    /// Build from config when notifications are enabled
    pub fn from_config(config: &NotifyConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let url = config.webhook_url.as_ref()?;
        Some(Self::new(url))
    }

    async fn post(&self, event: &Event) -> eyre::Result<()> {
        let response = self.client.post(&self.url).json(event).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(eyre::eyre!("webhook returned {}", status));
        }
        debug!(event_type = event.event_type(), "WebhookNotifier: delivered");
        Ok(())
    }

    /// Terminal events only; everything else passes through untouched
    pub fn listener(&self) -> Listener {
        let notifier = self.clone();
        Arc::new(move |event| {
            let notifier = notifier.clone();
            Box::pin(async move {
                if !event.is_terminal() {
                    return Ok(());
                }
                if let Err(e) = notifier.post(&event).await {
                    warn!(error = %e, event_type = event.event_type(), "WebhookNotifier: delivery failed");
                }
                Ok(())
            })
        })
    }

    pub async fn register(&self, bus: &EventBus) {
        bus.on("webhook-notifier", self.listener()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotifyConfig;

    #[test]
    fn test_from_config_disabled() {
        let config = NotifyConfig {
            enabled: false,
            webhook_url: Some("https://example.com".to_string()),
        };
        assert!(WebhookNotifier::from_config(&config).is_none());
    }

    #[test]
    fn test_from_config_requires_url() {
        let config = NotifyConfig {
            enabled: true,
            webhook_url: None,
        };
        assert!(WebhookNotifier::from_config(&config).is_none());

        let config = NotifyConfig {
            enabled: true,
            webhook_url: Some("https://example.com/hook".to_string()),
        };
        assert!(WebhookNotifier::from_config(&config).is_some());
    }

    #[tokio::test]
    async fn test_unreachable_webhook_does_not_error() {
        // Delivery failure must stay contained in the listener
        let notifier = WebhookNotifier::new("http://127.0.0.1:1/unreachable");
        let listener = notifier.listener();

        let result = listener(Event::TaskCompleted {
            task_id: "t1".to_string(),
            status: "completed".to_string(),
            summary: None,
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_non_terminal_events_skipped() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:1/unreachable");
        let listener = notifier.listener();

        // A non-terminal event never attempts delivery, so this returns
        // immediately even with an unreachable endpoint
        let started = std::time::Instant::now();
        listener(Event::NodeStarted {
            task_id: "t1".to_string(),
            instance_id: "i1".to_string(),
            node_id: "a".to_string(),
            node_type: "task".to_string(),
            attempt: 1,
        })
        .await
        .unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
    }
}
