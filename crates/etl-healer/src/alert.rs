//! Operator notifications and cooldown-limited alerting.

use chrono::{DateTime, Duration, Utc};
use etl_config::MAX_ALERT_COOLDOWN_MINUTES;
use notify::{NotificationSink, Severity};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::StateStore;

/// Best-effort operator messages through a [`NotificationSink`].
#[derive(Clone)]
pub struct OperatorNotifier {
    sink: Arc<dyn NotificationSink>,
    recipients: Vec<String>,
    subject_prefix: String,
}

impl OperatorNotifier {
    #[must_use]
    pub fn new(sink: Arc<dyn NotificationSink>, recipients: Vec<String>, subject_prefix: impl Into<String>) -> Self {
        Self {
            sink,
            recipients,
            subject_prefix: subject_prefix.into(),
        }
    }

    /// Subject line carrying the severity tag the sink uses for routing.
    #[must_use]
    pub fn subject(&self, severity: Severity, title: &str) -> String {
        if self.subject_prefix.is_empty() {
            format!("{} {title}", severity.tag())
        } else {
            format!("{} {} {title}", self.subject_prefix, severity.tag())
        }
    }

    /// Deliver a message. Never fails; returns whether any channel accepted it.
    pub async fn notify(&self, severity: Severity, title: &str, body: &str) -> bool {
        let subject = self.subject(severity, title);
        let delivered = self.sink.deliver(&subject, body, &self.recipients).await;
        if delivered {
            debug!(%subject, "Notification delivered");
        } else {
            warn!(%subject, "Notification delivery failed");
        }
        delivered
    }
}

/// What happened to an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertOutcome {
    /// An alert of the same type and level fired within the cooldown
    Suppressed,
    Delivered,
    /// Dispatched but no channel accepted it
    Failed,
}

/// At most one alert per `(type, level)` per cooldown window, judged by the
/// newest stored alert record of that pair.
#[derive(Clone)]
pub struct AlertGate {
    store: StateStore,
    notifier: OperatorNotifier,
    cooldown: Duration,
}

impl AlertGate {
    #[must_use]
    pub fn new(store: StateStore, notifier: OperatorNotifier, cooldown_minutes: u64) -> Self {
        Self {
            store,
            notifier,
            cooldown: Duration::minutes(
                i64::try_from(cooldown_minutes.min(MAX_ALERT_COOLDOWN_MINUTES)).unwrap_or(i64::MAX),
            ),
        }
    }

    /// Whether an alert of this type and level may fire at `now`.
    pub fn is_open(&self, alert_type: &str, level: Severity, now: DateTime<Utc>) -> Result<bool> {
        let level = level_key(level);
        Ok(match self.store.last_alert(alert_type, &level)? {
            Some(last) => now - last.created_at >= self.cooldown,
            None => true,
        })
    }

    /// Dispatch unless suppressed. Every dispatch is recorded, delivered or not.
    pub async fn raise(
        &self,
        alert_type: &str,
        level: Severity,
        title: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<AlertOutcome> {
        if !self.is_open(alert_type, level, now)? {
            info!(alert_type, level = level.as_str(), "Alert suppressed by cooldown");
            return Ok(AlertOutcome::Suppressed);
        }

        let delivered = self.notifier.notify(level, title, body).await;
        let message = format!("{title}\n{body}");
        self.store
            .insert_alert(alert_type, &level_key(level), &message, delivered, now)?;
        Ok(if delivered {
            AlertOutcome::Delivered
        } else {
            AlertOutcome::Failed
        })
    }
}

fn level_key(level: Severity) -> String {
    level.as_str().to_ascii_lowercase()
}

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use notify::NotificationSink;
    use std::sync::Mutex;

    /// Sink that records every subject and returns a fixed result.
    pub struct RecordingSink {
        pub accept: bool,
        pub subjects: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        pub fn accepting() -> Self {
            Self {
                accept: true,
                subjects: Mutex::new(vec![]),
            }
        }

        pub fn rejecting() -> Self {
            Self {
                accept: false,
                subjects: Mutex::new(vec![]),
            }
        }

        pub fn count(&self) -> usize {
            self.subjects.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(&self, subject: &str, _body: &str, _recipients: &[String]) -> bool {
            self.subjects.lock().unwrap().push(subject.to_string());
            self.accept
        }
    }
}
