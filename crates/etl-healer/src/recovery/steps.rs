//! Typed recovery step actions parsed from stored step definitions.

use notify::Severity;
use serde::Deserialize;
use std::fmt;

use crate::error::{HealerError, Result};
use crate::types::RecoveryStep;

/// One executable remediation action.
#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    /// Pure delay
    Wait { seconds: u64 },
    /// Best-effort operator notification
    SendNotification { message: String, severity: Severity },
    /// Force-release the execution lock
    ClearLocks,
    /// Queue a restart request; never runs the pipeline inline
    RestartEtl { delay_minutes: u32 },
    /// Empty the temp directory and purge expired fallback entries
    CleanupTempData,
    /// Close open retry attempts of the affected run
    ResetRetryCounters,
}

#[derive(Deserialize)]
struct WaitParams {
    seconds: u64,
}

#[derive(Deserialize)]
struct NotificationParams {
    message: String,
    #[serde(default)]
    severity: Option<String>,
}

#[derive(Deserialize)]
struct RestartParams {
    #[serde(default = "default_restart_delay")]
    delay_minutes: u32,
}

const fn default_restart_delay() -> u32 {
    5
}

fn params<T: serde::de::DeserializeOwned>(step: &RecoveryStep) -> Result<T> {
    let value = if step.params.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        step.params.clone()
    };
    serde_json::from_value(value)
        .map_err(|e| HealerError::InvalidStep(format!("{}: bad params: {e}", step.step_type)))
}

impl StepAction {
    /// Interpret a stored step. Unknown types and malformed params are errors.
    pub fn parse(step: &RecoveryStep) -> Result<Self> {
        match step.step_type.as_str() {
            "wait" => {
                let p: WaitParams = params(step)?;
                Ok(Self::Wait { seconds: p.seconds })
            }
            "send_notification" => {
                let p: NotificationParams = params(step)?;
                let severity = match p.severity {
                    Some(raw) => raw
                        .parse()
                        .map_err(|e: String| HealerError::InvalidStep(format!("send_notification: {e}")))?,
                    None => Severity::Warning,
                };
                Ok(Self::SendNotification {
                    message: p.message,
                    severity,
                })
            }
            "clear_locks" => Ok(Self::ClearLocks),
            "restart_etl" => {
                let p: RestartParams = params(step)?;
                Ok(Self::RestartEtl {
                    delay_minutes: p.delay_minutes,
                })
            }
            "cleanup_temp_data" => Ok(Self::CleanupTempData),
            "reset_retry_counters" => Ok(Self::ResetRetryCounters),
            other => Err(HealerError::InvalidStep(format!("unknown step type {other:?}"))),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Wait { .. } => "wait",
            Self::SendNotification { .. } => "send_notification",
            Self::ClearLocks => "clear_locks",
            Self::RestartEtl { .. } => "restart_etl",
            Self::CleanupTempData => "cleanup_temp_data",
            Self::ResetRetryCounters => "reset_retry_counters",
        }
    }
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wait { seconds } => write!(f, "wait {seconds}s"),
            Self::SendNotification { severity, .. } => write!(f, "send {} notification", severity.as_str()),
            Self::RestartEtl { delay_minutes } => write!(f, "restart in {delay_minutes}m"),
            other => f.write_str(other.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored(step_type: &str, params: serde_json::Value) -> RecoveryStep {
        RecoveryStep::new(step_type, params, false, "")
    }

    #[test]
    fn test_parse_each_kind() {
        assert_eq!(
            StepAction::parse(&stored("wait", json!({"seconds": 30}))).unwrap(),
            StepAction::Wait { seconds: 30 }
        );
        assert_eq!(
            StepAction::parse(&stored("send_notification", json!({"message": "hi", "severity": "critical"})))
                .unwrap(),
            StepAction::SendNotification {
                message: "hi".to_string(),
                severity: Severity::Critical
            }
        );
        assert_eq!(
            StepAction::parse(&stored("restart_etl", serde_json::Value::Null)).unwrap(),
            StepAction::RestartEtl { delay_minutes: 5 }
        );
        assert_eq!(
            StepAction::parse(&stored("clear_locks", json!({}))).unwrap(),
            StepAction::ClearLocks
        );
    }

    #[test]
    fn test_unknown_type_and_bad_params_are_rejected() {
        assert!(matches!(
            StepAction::parse(&stored("reboot_host", json!({}))),
            Err(HealerError::InvalidStep(_))
        ));
        assert!(StepAction::parse(&stored("wait", json!({"seconds": "soon"}))).is_err());
        assert!(StepAction::parse(&stored("send_notification", json!({"message": "x", "severity": "loud"}))).is_err());
    }

    #[test]
    fn test_stored_step_json_shape() {
        let step: RecoveryStep = serde_json::from_value(json!({
            "type": "wait",
            "params": {"seconds": 5},
            "critical": true,
            "description": "pause"
        }))
        .unwrap();
        assert!(step.critical);
        assert_eq!(StepAction::parse(&step).unwrap(), StepAction::Wait { seconds: 5 });
    }
}
