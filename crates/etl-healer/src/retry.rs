//! Per-operation retry bookkeeping with capped exponential backoff.
//!
//! The manager only records failures and answers "retry when?"; it never
//! remediates. Exhausted or non-retryable failures are handed back to the
//! caller as an escalation.

use chrono::{DateTime, Utc};
use etl_config::RetryConfig;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::{days_ago, StateStore};
use crate::types::{ErrorType, RetryAttempt, RunId};

/// Backoff policy for one error type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay_secs: u64, multiplier: f64, max_delay_secs: u64) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_secs(base_delay_secs),
            multiplier,
            max_delay: Duration::from_secs(max_delay_secs),
        }
    }

    /// Built-in policy, `None` for terminal error types.
    #[must_use]
    pub const fn default_for(error_type: ErrorType) -> Option<Self> {
        match error_type {
            ErrorType::NetworkTimeout => Some(Self::new(3, 60, 2.0, 15 * 60)),
            ErrorType::ApiRateLimit => Some(Self::new(5, 300, 2.0, 60 * 60)),
            ErrorType::FileDownloadFailed => Some(Self::new(3, 120, 2.0, 30 * 60)),
            ErrorType::ReportGenerationTimeout => Some(Self::new(3, 600, 1.5, 60 * 60)),
            ErrorType::DatabaseConnectionLost => Some(Self::new(3, 30, 2.0, 10 * 60)),
            ErrorType::AnyError => Some(Self::new(2, 60, 2.0, 10 * 60)),
            ErrorType::AuthenticationFailed | ErrorType::MemoryExhausted | ErrorType::DiskSpaceFull => None,
        }
    }

    /// Delay before retrying after failure number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let factor = self.multiplier.powi(exponent as i32);
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Why a failure must be escalated instead of retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationReason {
    /// Terminal error type, no attempt was recorded
    NonRetryable,
    /// The attempt budget was already used up
    Exhausted,
}

/// Outcome of recording a failure.
#[derive(Debug, Clone)]
pub enum RetryDecision {
    /// Retry once `next_retry_at` has passed.
    RetryAt {
        attempt: RetryAttempt,
        next_retry_at: DateTime<Utc>,
    },
    /// This failure used the last attempt; the caller must escalate.
    Exhausted { attempt: RetryAttempt },
    /// Escalate without touching the attempt.
    Escalate(EscalationReason),
}

impl RetryDecision {
    /// Whether the caller must hand the failure to recovery.
    #[must_use]
    pub fn should_escalate(&self) -> bool {
        !matches!(self, Self::RetryAt { .. })
    }
}

/// Records operation failures and decides retry eligibility.
#[derive(Debug, Clone)]
pub struct RetryManager {
    store: StateStore,
    policies: HashMap<ErrorType, RetryPolicy>,
}

impl RetryManager {
    /// Build from the defaults with `config` overrides applied.
    #[must_use]
    pub fn new(store: StateStore, config: &RetryConfig) -> Self {
        let mut policies: HashMap<ErrorType, RetryPolicy> = ErrorType::ALL
            .iter()
            .filter_map(|t| RetryPolicy::default_for(*t).map(|p| (*t, p)))
            .collect();

        for o in &config.overrides {
            let Ok(error_type) = o.error_type.parse::<ErrorType>() else {
                warn!(error_type = %o.error_type, "Ignoring retry override for unknown error type");
                continue;
            };
            let Some(policy) = policies.get_mut(&error_type) else {
                warn!(error_type = %error_type, "Ignoring retry override for non-retryable error type");
                continue;
            };
            if let Some(max) = o.max_attempts {
                policy.max_attempts = max.max(1);
            }
            if let Some(secs) = o.base_delay_secs {
                policy.base_delay = Duration::from_secs(secs);
            }
            if let Some(multiplier) = o.multiplier {
                policy.multiplier = multiplier;
            }
            if let Some(secs) = o.max_delay_secs {
                policy.max_delay = Duration::from_secs(secs);
            }
        }

        Self { store, policies }
    }

    #[must_use]
    pub fn policy(&self, error_type: ErrorType) -> Option<&RetryPolicy> {
        self.policies.get(&error_type)
    }

    /// Record a failure of `operation_type` within `run_id`.
    pub fn record_failure(
        &self,
        run_id: RunId,
        operation_type: &str,
        error_type: ErrorType,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision> {
        let Some(policy) = self.policy(error_type).copied() else {
            info!(run_id, operation = operation_type, error_type = %error_type, "Non-retryable failure");
            return Ok(RetryDecision::Escalate(EscalationReason::NonRetryable));
        };

        let attempt = match self.store.open_attempt(run_id, operation_type)? {
            Some(open) if open.attempt_number >= open.max_attempts => {
                warn!(
                    run_id,
                    operation = operation_type,
                    attempts = open.attempt_number,
                    "Retry budget already exhausted"
                );
                return Ok(RetryDecision::Escalate(EscalationReason::Exhausted));
            }
            Some(open) => {
                let number = open.attempt_number + 1;
                let exhausted = number >= open.max_attempts;
                let next = (!exhausted).then(|| next_at(&policy, number, now));
                self.store
                    .advance_attempt(open.id, number, error_type, next, message, exhausted, now)?
            }
            None => {
                let exhausted = policy.max_attempts <= 1;
                let next = (!exhausted).then(|| next_at(&policy, 1, now));
                self.store.insert_attempt(
                    run_id,
                    operation_type,
                    error_type,
                    policy.max_attempts,
                    next,
                    message,
                    exhausted,
                    now,
                )?
            }
        };

        match attempt.next_retry_at {
            Some(next_retry_at) if !attempt.is_exhausted => {
                debug!(
                    run_id,
                    operation = operation_type,
                    attempt = attempt.attempt_number,
                    max_attempts = attempt.max_attempts,
                    %next_retry_at,
                    "Retry scheduled"
                );
                Ok(RetryDecision::RetryAt { attempt, next_retry_at })
            }
            _ => {
                warn!(
                    run_id,
                    operation = operation_type,
                    attempts = attempt.attempt_number,
                    "Retry attempts exhausted"
                );
                Ok(RetryDecision::Exhausted { attempt })
            }
        }
    }

    /// Close the open attempt after the operation succeeded.
    pub fn mark_succeeded(&self, run_id: RunId, operation_type: &str, now: DateTime<Utc>) -> Result<bool> {
        match self.store.open_attempt(run_id, operation_type)? {
            Some(open) => self.store.close_attempt(open.id, false, now),
            None => Ok(false),
        }
    }

    /// Close the open attempt as exhausted after escalation.
    pub fn mark_exhausted(&self, run_id: RunId, operation_type: &str, now: DateTime<Utc>) -> Result<bool> {
        match self.store.open_attempt(run_id, operation_type)? {
            Some(open) => self.store.close_attempt(open.id, true, now),
            None => Ok(false),
        }
    }

    /// Whether the operation may be tried now.
    pub fn is_eligible(&self, run_id: RunId, operation_type: &str, now: DateTime<Utc>) -> Result<bool> {
        Ok(match self.store.open_attempt(run_id, operation_type)? {
            None => true,
            Some(open) if open.is_exhausted => false,
            Some(open) => open.next_retry_at.is_none_or(|at| at <= now),
        })
    }

    /// Close every open attempt of one run.
    pub fn reset_run(&self, run_id: RunId, now: DateTime<Utc>) -> Result<usize> {
        let closed = self.store.close_open_attempts(Some(run_id), now)?;
        info!(run_id, closed, "Retry counters reset for run");
        Ok(closed)
    }

    pub fn reset_all(&self, now: DateTime<Utc>) -> Result<usize> {
        let closed = self.store.close_open_attempts(None, now)?;
        info!(closed, "All retry counters reset");
        Ok(closed)
    }

    pub fn active_attempts(&self) -> Result<Vec<RetryAttempt>> {
        self.store.open_attempts(None)
    }

    /// Purge closed attempts older than `retention_days`.
    pub fn cleanup(&self, retention_days: u32, now: DateTime<Utc>) -> Result<usize> {
        let purged = self.store.purge_closed_attempts(days_ago(now, retention_days))?;
        debug!(purged, retention_days, "Purged closed retry attempts");
        Ok(purged)
    }
}

fn next_at(policy: &RetryPolicy, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(policy.delay_for(attempt)).unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use etl_config::RetryOverride;

    fn manager(store: &StateStore) -> RetryManager {
        RetryManager::new(store.clone(), &RetryConfig::default())
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::default_for(ErrorType::NetworkTimeout).unwrap();
        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for(3), Duration::from_secs(240));
        assert_eq!(policy.delay_for(20), Duration::from_secs(15 * 60));
    }

    #[test]
    fn test_negative_multiplier_never_yields_negative_delay() {
        let policy = RetryPolicy::new(3, 60, -2.0, 600);
        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(2), Duration::ZERO);
        assert_eq!(policy.delay_for(3), Duration::from_secs(240));
    }

    #[test]
    fn test_three_failures_exhaust_and_fourth_escalates() {
        let store = StateStore::in_memory().unwrap();
        let retry = manager(&store);
        let now = Utc::now();
        let op = "extract:amazon";

        for n in 1..=2 {
            match retry.record_failure(1, op, ErrorType::NetworkTimeout, "timed out", now).unwrap() {
                RetryDecision::RetryAt { attempt, .. } => assert_eq!(attempt.attempt_number, n),
                other => panic!("expected RetryAt, got {other:?}"),
            }
        }

        match retry.record_failure(1, op, ErrorType::NetworkTimeout, "timed out", now).unwrap() {
            RetryDecision::Exhausted { attempt } => {
                assert_eq!(attempt.attempt_number, 3);
                assert!(attempt.is_exhausted);
                assert!(!attempt.is_completed);
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert!(!retry.is_eligible(1, op, now).unwrap());

        let fourth = retry.record_failure(1, op, ErrorType::NetworkTimeout, "timed out", now).unwrap();
        assert!(matches!(fourth, RetryDecision::Escalate(EscalationReason::Exhausted)));
        let open = store.open_attempt(1, op).unwrap().unwrap();
        assert_eq!(open.attempt_number, 3);
    }

    #[test]
    fn test_non_retryable_escalates_without_attempt() {
        let store = StateStore::in_memory().unwrap();
        let retry = manager(&store);
        let decision = retry
            .record_failure(1, "extract", ErrorType::AuthenticationFailed, "401", Utc::now())
            .unwrap();
        assert!(matches!(decision, RetryDecision::Escalate(EscalationReason::NonRetryable)));
        assert!(retry.active_attempts().unwrap().is_empty());
    }

    #[test]
    fn test_eligibility_follows_next_retry_at() {
        let store = StateStore::in_memory().unwrap();
        let retry = manager(&store);
        let now = Utc::now();
        let RetryDecision::RetryAt { next_retry_at, .. } = retry
            .record_failure(1, "load", ErrorType::DatabaseConnectionLost, "database is locked", now)
            .unwrap()
        else {
            panic!("expected RetryAt");
        };
        assert_eq!((next_retry_at - now).num_seconds(), 30);
        assert!(!retry.is_eligible(1, "load", now).unwrap());
        assert!(retry.is_eligible(1, "load", next_retry_at).unwrap());
    }

    #[test]
    fn test_success_closes_attempt() {
        let store = StateStore::in_memory().unwrap();
        let retry = manager(&store);
        let now = Utc::now();
        retry.record_failure(1, "extract", ErrorType::AnyError, "boom", now).unwrap();
        assert!(retry.mark_succeeded(1, "extract", now).unwrap());
        assert!(!retry.mark_succeeded(1, "extract", now).unwrap());
        assert!(retry.is_eligible(1, "extract", now).unwrap());
        assert!(retry.active_attempts().unwrap().is_empty());
    }

    #[test]
    fn test_reset_run_is_scoped() {
        let store = StateStore::in_memory().unwrap();
        let retry = manager(&store);
        let now = Utc::now();
        retry.record_failure(1, "a", ErrorType::AnyError, "x", now).unwrap();
        retry.record_failure(2, "a", ErrorType::AnyError, "x", now).unwrap();

        assert_eq!(retry.reset_run(1, now).unwrap(), 1);
        let active = retry.active_attempts().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].run_id, 2);
        assert_eq!(retry.reset_all(now).unwrap(), 1);
    }

    #[test]
    fn test_cleanup_purges_only_old_closed_attempts() {
        let store = StateStore::in_memory().unwrap();
        let retry = manager(&store);
        let old = Utc::now() - chrono::Duration::days(45);
        retry.record_failure(1, "a", ErrorType::AnyError, "x", old).unwrap();
        retry.mark_succeeded(1, "a", old).unwrap();
        retry.record_failure(2, "a", ErrorType::AnyError, "x", old).unwrap();

        assert_eq!(retry.cleanup(30, Utc::now()).unwrap(), 1);
        assert_eq!(retry.active_attempts().unwrap().len(), 1);
    }

    #[test]
    fn test_config_override_applies() {
        let store = StateStore::in_memory().unwrap();
        let config = RetryConfig {
            overrides: vec![
                RetryOverride {
                    error_type: "network_timeout".to_string(),
                    max_attempts: Some(1),
                    base_delay_secs: Some(5),
                    multiplier: None,
                    max_delay_secs: None,
                },
                RetryOverride {
                    error_type: "disk_space_full".to_string(),
                    max_attempts: Some(9),
                    base_delay_secs: None,
                    multiplier: None,
                    max_delay_secs: None,
                },
            ],
            ..RetryConfig::default()
        };
        let retry = RetryManager::new(store, &config);
        let policy = retry.policy(ErrorType::NetworkTimeout).unwrap();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.base_delay, Duration::from_secs(5));
        assert!(retry.policy(ErrorType::DiskSpaceFull).is_none());

        let decision = retry
            .record_failure(1, "a", ErrorType::NetworkTimeout, "t", Utc::now())
            .unwrap();
        assert!(matches!(decision, RetryDecision::Exhausted { .. }));
    }
}
