//! Notification channel implementations.

pub mod discord;
pub mod log;
pub mod slack;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::events::Notification;

/// Trait for notification channels (Slack, Discord, log-only).
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    /// Get the name of this channel.
    fn name(&self) -> &'static str;

    /// Check if this channel is enabled/configured.
    fn enabled(&self) -> bool;

    /// Send a notification to this channel.
    async fn send(&self, notification: &Notification) -> Result<(), ChannelError>;
}
