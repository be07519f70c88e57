//! Slack webhook notification channel.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::{Notification, Severity};
use crate::NotifyChannel;

/// Environment variable for Slack webhook URL.
const ENV_SLACK_WEBHOOK_URL: &str = "SLACK_WEBHOOK_URL";

/// Slack webhook notification channel.
pub struct SlackChannel {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl SlackChannel {
    /// Create a new Slack channel from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let webhook_url = std::env::var(ENV_SLACK_WEBHOOK_URL).ok();

        if webhook_url.is_some() {
            debug!("Slack notifications enabled");
        } else {
            debug!("Slack notifications disabled (SLACK_WEBHOOK_URL not set)");
        }

        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Create a Slack channel with a specific webhook URL.
    #[must_use]
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url: Some(webhook_url),
            client: reqwest::Client::new(),
        }
    }

    /// Format a notification as a Slack webhook payload.
    fn format_payload(notification: &Notification) -> SlackPayload {
        let color = match notification.severity {
            Severity::Info => "#3498db",     // Blue
            Severity::Warning => "#f39c12",  // Orange
            Severity::Critical => "#e74c3c", // Red
        };

        let mut fields = vec![SlackField {
            title: "Severity".to_string(),
            value: notification.severity.as_str().to_string(),
            short: true,
        }];
        if !notification.recipients.is_empty() {
            fields.push(SlackField {
                title: "Recipients".to_string(),
                value: notification.recipients.join(", "),
                short: true,
            });
        }

        let attachment = SlackAttachment {
            fallback: notification.subject.clone(),
            color: color.to_string(),
            author_name: Some("ETL Healer".to_string()),
            title: notification.subject.clone(),
            text: notification.body.clone(),
            fields,
            footer: Some(
                notification
                    .timestamp
                    .format("%Y-%m-%d %H:%M:%S UTC")
                    .to_string(),
            ),
            ts: Some(notification.timestamp.timestamp()),
        };

        SlackPayload {
            attachments: vec![attachment],
        }
    }
}

#[async_trait]
impl NotifyChannel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
        let webhook_url = self
            .webhook_url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured(ENV_SLACK_WEBHOOK_URL.to_string()))?;

        let payload = Self::format_payload(notification);

        debug!(channel = "slack", subject = %notification.subject, "Sending notification");

        let response = self.client.post(webhook_url).json(&payload).send().await?;

        if response.status().is_success() {
            debug!(channel = "slack", "Notification sent successfully");
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();

            warn!(
                channel = "slack",
                status = %status,
                body = %body,
                "Slack webhook request failed"
            );

            Err(ChannelError::Other(format!("Slack returned {status}: {body}")))
        }
    }
}

// =============================================================================
// Slack API types
// =============================================================================

#[derive(Debug, Serialize)]
struct SlackPayload {
    attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Serialize)]
struct SlackAttachment {
    fallback: String,
    color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    author_name: Option<String>,
    title: String,
    text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<SlackField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ts: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SlackField {
    title: String,
    value: String,
    short: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_colors_follow_severity() {
        let n = Notification::new("[CRITICAL] Disk full", "0% free", &[]);
        let payload = SlackChannel::format_payload(&n);
        assert_eq!(payload.attachments[0].color, "#e74c3c");
        assert_eq!(payload.attachments[0].fields.len(), 1);
    }

    #[test]
    fn test_payload_lists_recipients() {
        let n = Notification::new(
            "Health warning",
            "stale data",
            &["ops@example.com".to_string(), "@oncall".to_string()],
        );
        let payload = SlackChannel::format_payload(&n);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json["attachments"][0]["fields"][1]["value"],
            "ops@example.com, @oncall"
        );
    }
}
