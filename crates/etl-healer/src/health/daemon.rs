//! Long-running monitor loop.
//!
//! Each cycle assesses health, persists the result, updates the daemon
//! statistics and raises at most one consolidated alert. Nothing that happens
//! inside a cycle terminates the loop; only the cancellation token does.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{HealthChecker, HealthReport, HealthStatus};
use crate::alert::{AlertGate, AlertOutcome};
use crate::error::{HealerError, Result};
use crate::process;
use crate::store::StateStore;

/// Alert type used for consolidated health alerts.
pub const HEALTH_ALERT_TYPE: &str = "health_check";

/// Upper bound on a single sleep so cancellation is noticed promptly.
const TICK: Duration = Duration::from_secs(1);

/// What one monitoring cycle did.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub report: HealthReport,
    pub alert: Option<AlertOutcome>,
}

/// Periodic health monitor.
pub struct MonitorDaemon {
    checker: HealthChecker,
    store: StateStore,
    alerts: AlertGate,
    interval: Duration,
}

impl MonitorDaemon {
    #[must_use]
    pub fn new(checker: HealthChecker, store: StateStore, alerts: AlertGate, interval: Duration) -> Self {
        Self {
            checker,
            store,
            alerts,
            interval,
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Loop until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) -> Result<u64> {
        let pid = process::current_pid();
        self.store.daemon_started(pid, Utc::now())?;
        info!(pid, interval_secs = self.interval.as_secs(), "Health monitor started");

        let mut cycles = 0_u64;
        loop {
            if token.is_cancelled() {
                break;
            }
            match self.run_cycle(Utc::now()).await {
                Ok(outcome) => {
                    cycles += 1;
                    debug!(cycle = cycles, status = %outcome.report.overall, "Monitoring cycle finished");
                }
                Err(e) => error!(error = %e, "Monitoring cycle failed"),
            }
            if !self.wait_next(&token).await {
                break;
            }
        }

        if let Err(e) = self.store.daemon_stopped(Utc::now()) {
            warn!(error = %e, "Failed to record daemon stop");
        }
        info!(cycles, "Health monitor stopped");
        Ok(cycles)
    }

    /// One assess → persist → alert → stats pass.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleOutcome> {
        let checker = self.checker.clone();
        let report = tokio::task::spawn_blocking(move || checker.assess_at(now))
            .await
            .map_err(|e| HealerError::Process(format!("health assessment task failed: {e}")))?;

        for check in report.problems() {
            warn!(check = %check.name, status = %check.status, message = %check.message, "Health check problem");
        }

        if let Err(e) =
            self.store
                .insert_health_result(report.checked_at, report.overall, &report.checks, &report.recommendations)
        {
            error!(error = %e, "Failed to persist health result");
        }

        let alert = if report.overall == HealthStatus::Healthy {
            None
        } else {
            let title = format!("Health check {}", report.overall.as_str().to_uppercase());
            match self
                .alerts
                .raise(HEALTH_ALERT_TYPE, report.overall.severity(), &title, &report.summary(), now)
                .await
            {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    error!(error = %e, "Failed to raise health alert");
                    None
                }
            }
        };

        let delivered = alert == Some(AlertOutcome::Delivered);
        if let Err(e) = self.store.record_check(report.overall, delivered, now) {
            error!(error = %e, "Failed to update daemon statistics");
        }

        Ok(CycleOutcome { report, alert })
    }

    /// Sleep for one interval in short ticks. Returns false when cancelled.
    async fn wait_next(&self, token: &CancellationToken) -> bool {
        let deadline = Instant::now() + self.interval;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let tick = (deadline - now).min(TICK);
            tokio::select! {
                () = token.cancelled() => return false,
                () = tokio::time::sleep(tick) => {}
            }
        }
    }
}
