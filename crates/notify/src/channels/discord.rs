//! Discord webhook notification channel.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::Notification;
use crate::NotifyChannel;

/// Environment variable for Discord webhook URL.
const ENV_DISCORD_WEBHOOK_URL: &str = "DISCORD_WEBHOOK_URL";

/// Discord embeds reject descriptions longer than this.
const MAX_DESCRIPTION_LEN: usize = 4096;

/// Discord webhook notification channel.
pub struct DiscordChannel {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl DiscordChannel {
    /// Create a new Discord channel from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let webhook_url = std::env::var(ENV_DISCORD_WEBHOOK_URL).ok();
        if webhook_url.is_none() {
            debug!("Discord notifications disabled (DISCORD_WEBHOOK_URL not set)");
        }
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Create a Discord channel with a specific webhook URL.
    #[must_use]
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url: Some(webhook_url),
            client: reqwest::Client::new(),
        }
    }

    fn format_payload(notification: &Notification) -> DiscordPayload {
        let mut description = notification.body.clone();
        if description.len() > MAX_DESCRIPTION_LEN {
            let mut cut = MAX_DESCRIPTION_LEN - 3;
            while !description.is_char_boundary(cut) {
                cut -= 1;
            }
            description.truncate(cut);
            description.push_str("...");
        }

        let content = if notification.recipients.is_empty() {
            None
        } else {
            Some(notification.recipients.join(" "))
        };

        DiscordPayload {
            content,
            embeds: vec![DiscordEmbed {
                title: notification.subject.clone(),
                description,
                color: notification.severity.color(),
                timestamp: notification.timestamp.to_rfc3339(),
            }],
        }
    }
}

#[async_trait]
impl NotifyChannel for DiscordChannel {
    fn name(&self) -> &'static str {
        "discord"
    }

    fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
        let webhook_url = self
            .webhook_url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured(ENV_DISCORD_WEBHOOK_URL.to_string()))?;

        let payload = Self::format_payload(notification);
        let response = self.client.post(webhook_url).json(&payload).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<f64>().ok())
                .map_or(1, |secs| secs.ceil() as u64);
            return Err(ChannelError::RateLimited { retry_after_secs });
        }

        let body = response.text().await.unwrap_or_default();
        warn!(channel = "discord", status = %status, "Discord webhook request failed");
        Err(ChannelError::Other(format!("Discord returned {status}: {body}")))
    }
}

#[derive(Debug, Serialize)]
struct DiscordPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    embeds: Vec<DiscordEmbed>,
}

#[derive(Debug, Serialize)]
struct DiscordEmbed {
    title: String,
    description: String,
    color: u32,
    timestamp: String,
}
