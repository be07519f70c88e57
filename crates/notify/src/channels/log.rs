//! Log-only channel, used when no webhook is configured.

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::error::ChannelError;
use crate::events::{Notification, Severity};
use crate::NotifyChannel;

/// Writes notifications to the tracing log instead of an external service.
#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl NotifyChannel for LogChannel {
    fn name(&self) -> &'static str {
        "log"
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
        let recipients = notification.recipients.join(",");
        match notification.severity {
            Severity::Info => info!(
                subject = %notification.subject,
                recipients = %recipients,
                "{}",
                notification.body
            ),
            Severity::Warning => warn!(
                subject = %notification.subject,
                recipients = %recipients,
                "{}",
                notification.body
            ),
            Severity::Critical => error!(
                subject = %notification.subject,
                recipients = %recipients,
                "{}",
                notification.body
            ),
        }
        Ok(())
    }
}
