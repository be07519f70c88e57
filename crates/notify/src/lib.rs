//! Best-effort operator notifications for the ETL healer.
//!
//! Recovery procedures and the health monitor report through the
//! [`NotificationSink`] trait. Delivery is best effort: a failed or slow
//! channel is logged and reported as `false`, it never propagates an error to
//! the caller.
//!
//! # Usage
//!
//! ```no_run
//! use notify::{NotificationSink, Notifier};
//!
//! # async fn run() {
//! let notifier = Notifier::from_env();
//! let delivered = notifier
//!     .deliver("[CRITICAL] ETL run failed", "disk_space_full", &["ops@example.com".into()])
//!     .await;
//! # let _ = delivered;
//! # }
//! ```
//!
//! # Configuration
//!
//! - `SLACK_WEBHOOK_URL`: Slack webhook URL (enables Slack channel)
//! - `DISCORD_WEBHOOK_URL`: Discord webhook URL (enables Discord channel)
//! - `NOTIFY_DISABLED`: Set to "true" to disable all notifications
//!
//! With no webhook configured the notifier falls back to [`LogChannel`].

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod events;

pub use channels::discord::DiscordChannel;
pub use channels::log::LogChannel;
pub use channels::slack::SlackChannel;
pub use channels::NotifyChannel;
pub use error::ChannelError;
pub use events::{Notification, Severity};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Environment variable to disable all notifications.
const ENV_NOTIFY_DISABLED: &str = "NOTIFY_DISABLED";

/// Upper bound on a single channel send.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Anything that can deliver an operator notification.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver a message. Returns `true` if at least one channel accepted it.
    async fn deliver(&self, subject: &str, body: &str, recipients: &[String]) -> bool;
}

/// Central notification dispatcher.
///
/// The `Notifier` fans a notification out to every enabled channel.
pub struct Notifier {
    channels: Vec<Arc<dyn NotifyChannel>>,
    disabled: bool,
    timeout: Duration,
}

impl Notifier {
    /// Create a new notifier from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let disabled = std::env::var(ENV_NOTIFY_DISABLED)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        if disabled {
            info!("Notifications disabled via NOTIFY_DISABLED");
            return Self::disabled();
        }

        let mut channels: Vec<Arc<dyn NotifyChannel>> = vec![];

        let slack = SlackChannel::from_env();
        if slack.enabled() {
            info!("Slack notifications enabled");
            channels.push(Arc::new(slack));
        }

        let discord = DiscordChannel::from_env();
        if discord.enabled() {
            info!("Discord notifications enabled");
            channels.push(Arc::new(discord));
        }

        if channels.is_empty() {
            warn!("No webhook configured, notifications go to the log only");
            channels.push(Arc::new(LogChannel));
        } else {
            info!(
                channel_count = channels.len(),
                "Notification system initialized"
            );
        }

        Self::with_channels(channels)
    }

    /// Create a notifier with specific channels.
    #[must_use]
    pub fn with_channels(channels: Vec<Arc<dyn NotifyChannel>>) -> Self {
        Self {
            channels,
            disabled: false,
            timeout: SEND_TIMEOUT,
        }
    }

    /// Create a disabled notifier (for testing or when notifications are off).
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            channels: vec![],
            disabled: true,
            timeout: SEND_TIMEOUT,
        }
    }

    /// Override the per-channel send timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check if any notification channels are enabled.
    #[must_use]
    pub fn has_channels(&self) -> bool {
        !self.disabled && !self.channels.is_empty()
    }

    /// Get the number of enabled channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        if self.disabled {
            0
        } else {
            self.channels.len()
        }
    }

    /// Send to every channel and collect per-channel results.
    pub async fn send_all(&self, notification: &Notification) -> Vec<(String, Result<(), ChannelError>)> {
        if self.disabled {
            debug!("Notifications disabled, skipping");
            return vec![];
        }

        let mut results = vec![];
        for channel in &self.channels {
            let name = channel.name().to_string();
            if !channel.enabled() {
                debug!(channel = %name, "Channel disabled, skipping");
                continue;
            }

            let result = match tokio::time::timeout(self.timeout, channel.send(notification)).await {
                Ok(result) => result,
                Err(_) => Err(ChannelError::Other(format!(
                    "timed out after {}s",
                    self.timeout.as_secs()
                ))),
            };

            if let Err(e) = &result {
                error!(channel = %name, error = %e, "Failed to send notification");
            }
            results.push((name, result));
        }
        results
    }
}

#[async_trait]
impl NotificationSink for Notifier {
    async fn deliver(&self, subject: &str, body: &str, recipients: &[String]) -> bool {
        let notification = Notification::new(subject, body, recipients);
        let results = self.send_all(&notification).await;
        let delivered = results.iter().any(|(_, r)| r.is_ok());
        if !delivered && !self.disabled {
            warn!(subject = %subject, "Notification was not delivered by any channel");
        }
        delivered
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingChannel;

    #[async_trait]
    impl NotifyChannel for FailingChannel {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn enabled(&self) -> bool {
            true
        }
        async fn send(&self, _notification: &Notification) -> Result<(), ChannelError> {
            Err(ChannelError::Other("boom".to_string()))
        }
    }

    struct SlowChannel;

    #[async_trait]
    impl NotifyChannel for SlowChannel {
        fn name(&self) -> &'static str {
            "slow"
        }
        fn enabled(&self) -> bool {
            true
        }
        async fn send(&self, _notification: &Notification) -> Result<(), ChannelError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingChannel(AtomicUsize);

    #[async_trait]
    impl NotifyChannel for CountingChannel {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn enabled(&self) -> bool {
            true
        }
        async fn send(&self, _notification: &Notification) -> Result<(), ChannelError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_disabled_notifier() {
        let notifier = Notifier::disabled();
        assert!(!notifier.has_channels());
        assert_eq!(notifier.channel_count(), 0);
    }

    #[test]
    fn test_severity_from_subject() {
        assert_eq!(Severity::from_subject("[CRITICAL] db down"), Severity::Critical);
        assert_eq!(Severity::from_subject("[info] run finished"), Severity::Info);
        assert_eq!(Severity::from_subject("stale data"), Severity::Warning);
        assert!(Severity::Critical > Severity::Warning);
    }

    #[tokio::test]
    async fn test_deliver_false_when_all_channels_fail() {
        let notifier = Notifier::with_channels(vec![Arc::new(FailingChannel)]);
        assert!(!notifier.deliver("subject", "body", &[]).await);
    }

    #[tokio::test]
    async fn test_deliver_true_when_any_channel_succeeds() {
        let counting = Arc::new(CountingChannel::default());
        let notifier = Notifier::with_channels(vec![
            Arc::new(FailingChannel),
            Arc::clone(&counting) as Arc<dyn NotifyChannel>,
        ]);
        assert!(notifier.deliver("subject", "body", &[]).await);
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_channel_times_out() {
        let notifier = Notifier::with_channels(vec![Arc::new(SlowChannel)])
            .with_timeout(Duration::from_millis(20));
        assert!(!notifier.deliver("subject", "body", &[]).await);
    }

    #[tokio::test]
    async fn test_log_channel_always_delivers() {
        let notifier = Notifier::with_channels(vec![Arc::new(LogChannel)]);
        assert!(notifier.deliver("[INFO] hello", "world", &[]).await);
    }
}
