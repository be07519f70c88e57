//! Built-in recovery procedures, seeded into the store on bootstrap.

use serde_json::json;

use crate::types::{ErrorType, RecoveryStep};

/// A procedure definition before it is stored.
#[derive(Debug, Clone)]
pub struct ProcedureSeed {
    pub name: &'static str,
    pub trigger: ErrorType,
    pub steps: Vec<RecoveryStep>,
}

fn step(step_type: &str, params: serde_json::Value, critical: bool, description: &str) -> RecoveryStep {
    RecoveryStep::new(step_type, params, critical, description)
}

fn notify(message: &str, severity: &str) -> RecoveryStep {
    step(
        "send_notification",
        json!({ "message": message, "severity": severity }),
        false,
        "Tell the operator",
    )
}

fn wait(seconds: u64, description: &str) -> RecoveryStep {
    step("wait", json!({ "seconds": seconds }), false, description)
}

fn restart(delay_minutes: u32) -> RecoveryStep {
    step(
        "restart_etl",
        json!({ "delay_minutes": delay_minutes }),
        false,
        "Queue a restart of the pipeline",
    )
}

/// One procedure per error type, named after it.
#[must_use]
pub fn default_procedures() -> Vec<ProcedureSeed> {
    vec![
        ProcedureSeed {
            name: "network_timeout",
            trigger: ErrorType::NetworkTimeout,
            steps: vec![
                wait(120, "Let the network settle"),
                step("reset_retry_counters", json!({}), false, "Give the next run a fresh budget"),
                restart(10),
            ],
        },
        ProcedureSeed {
            name: "api_rate_limit",
            trigger: ErrorType::ApiRateLimit,
            steps: vec![
                notify("Marketplace API rate limit hit, backing off before restart", "warning"),
                wait(300, "Wait for the rate limit window"),
                restart(15),
            ],
        },
        ProcedureSeed {
            name: "authentication_failed",
            trigger: ErrorType::AuthenticationFailed,
            steps: vec![
                notify(
                    "Marketplace credentials were rejected; update them before the next run",
                    "critical",
                ),
                step("clear_locks", json!({}), false, "Free the lock for the operator"),
            ],
        },
        ProcedureSeed {
            name: "database_connection_lost",
            trigger: ErrorType::DatabaseConnectionLost,
            steps: vec![
                wait(30, "Give the database time to come back"),
                step("clear_locks", json!({}), true, "Release locks left by the failed run"),
                step("reset_retry_counters", json!({}), false, "Give the next run a fresh budget"),
                restart(5),
                notify("Database connection lost; restart queued", "warning"),
            ],
        },
        ProcedureSeed {
            name: "file_download_failed",
            trigger: ErrorType::FileDownloadFailed,
            steps: vec![
                step("cleanup_temp_data", json!({}), false, "Drop partial downloads"),
                wait(60, "Pause before retrying downloads"),
                restart(10),
            ],
        },
        ProcedureSeed {
            name: "report_generation_timeout",
            trigger: ErrorType::ReportGenerationTimeout,
            steps: vec![
                wait(600, "Give the report time to finish"),
                restart(30),
                notify("Report generation timed out; restart queued", "info"),
            ],
        },
        ProcedureSeed {
            name: "memory_exhausted",
            trigger: ErrorType::MemoryExhausted,
            steps: vec![
                step("clear_locks", json!({}), false, "Release locks left by the killed run"),
                step("cleanup_temp_data", json!({}), false, "Drop intermediate files"),
                notify("Pipeline ran out of memory; restart queued", "critical"),
                restart(15),
            ],
        },
        ProcedureSeed {
            name: "disk_space_full",
            trigger: ErrorType::DiskSpaceFull,
            steps: vec![
                step("cleanup_temp_data", json!({}), true, "Free disk space"),
                notify("Disk full; temporary data was removed", "critical"),
            ],
        },
        ProcedureSeed {
            name: "any_error",
            trigger: ErrorType::AnyError,
            steps: vec![
                notify("Unclassified pipeline failure, running generic recovery", "warning"),
                step("clear_locks", json!({}), false, "Release locks"),
                step("reset_retry_counters", json!({}), false, "Reset retry counters"),
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::steps::StepAction;

    #[test]
    fn test_every_seeded_step_parses() {
        for seed in default_procedures() {
            for step in &seed.steps {
                StepAction::parse(step)
                    .unwrap_or_else(|e| panic!("{} step {} invalid: {e}", seed.name, step.step_type));
            }
        }
    }

    #[test]
    fn test_one_procedure_per_error_type() {
        let seeds = default_procedures();
        for error_type in ErrorType::ALL {
            let matching: Vec<_> = seeds.iter().filter(|s| s.trigger == error_type).collect();
            assert_eq!(matching.len(), 1, "{error_type}");
            assert_eq!(matching[0].name, error_type.as_str());
        }
    }
}
