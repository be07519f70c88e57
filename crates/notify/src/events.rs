//! Notification payload types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity levels for alerts and notifications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - normal operations
    Info,
    /// Warning - something needs attention
    #[default]
    Warning,
    /// Critical - immediate action required
    Critical,
}

impl Severity {
    /// Get the Discord embed color for this severity.
    #[must_use]
    pub const fn color(&self) -> u32 {
        match self {
            Self::Info => 0x0034_98db,     // Blue
            Self::Warning => 0x00f3_9c12,  // Orange
            Self::Critical => 0x00e7_4c3c, // Red
        }
    }

    /// Get display name for this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
            Self::Critical => "Critical",
        }
    }

    /// Subject tag used by [`Severity::from_subject`].
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Info => "[INFO]",
            Self::Warning => "[WARNING]",
            Self::Critical => "[CRITICAL]",
        }
    }

    /// Infer severity from a subject line carrying a `[CRITICAL]`-style tag.
    ///
    /// Subjects without a tag are treated as warnings.
    #[must_use]
    pub fn from_subject(subject: &str) -> Self {
        let upper = subject.to_ascii_uppercase();
        if upper.contains("[CRITICAL]") {
            Self::Critical
        } else if upper.contains("[INFO]") {
            Self::Info
        } else {
            Self::Warning
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "critical" | "error" => Ok(Self::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// A single operator notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub recipients: Vec<String>,
    pub severity: Severity,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    /// Build a notification, inferring severity from the subject tag.
    #[must_use]
    pub fn new(subject: &str, body: &str, recipients: &[String]) -> Self {
        Self {
            subject: subject.to_string(),
            body: body.to_string(),
            recipients: recipients.to_vec(),
            severity: Severity::from_subject(subject),
            timestamp: Utc::now(),
        }
    }
}
