//! Decides whether a scheduled invocation should start a run.

use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone, Timelike, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::store::StateStore;
use crate::types::RestartRequest;

/// Why the gate opened or stayed shut.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum GateReason {
    ManualOverride,
    RestartRequested { request_id: i64 },
    InWindow,
    OutsideWindow,
    AlreadySucceededToday,
}

/// Result of a gate evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct GateDecision {
    pub should_run: bool,
    pub reason: GateReason,
    /// The due restart request that opened the gate
    pub restart_request: Option<RestartRequest>,
}

impl GateDecision {
    fn open(reason: GateReason) -> Self {
        Self {
            should_run: true,
            reason,
            restart_request: None,
        }
    }

    fn closed(reason: GateReason) -> Self {
        Self {
            should_run: false,
            reason,
            restart_request: None,
        }
    }
}

impl std::fmt::Display for GateDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            GateReason::ManualOverride => write!(f, "manual override"),
            GateReason::RestartRequested { request_id } => {
                write!(f, "restart request {request_id} is due")
            }
            GateReason::InWindow => write!(f, "inside the schedule window"),
            GateReason::OutsideWindow => write!(f, "outside the schedule window"),
            GateReason::AlreadySucceededToday => write!(f, "a run already succeeded today"),
        }
    }
}

/// Daily run window with a once-per-day success guard.
#[derive(Debug, Clone)]
pub struct ScheduleGate {
    store: StateStore,
    target: NaiveTime,
    window: Duration,
}

impl ScheduleGate {
    #[must_use]
    pub fn new(store: StateStore, target: NaiveTime, window_minutes: u32) -> Self {
        Self {
            store,
            target,
            window: Duration::minutes(i64::from(window_minutes)),
        }
    }

    /// Evaluate against the local clock.
    pub fn should_run(&self, manual_override: bool) -> Result<GateDecision> {
        self.evaluate_at(manual_override, Local::now())
    }

    /// Evaluate at an explicit instant. "Today" and the window are judged in
    /// `now`'s time zone.
    pub fn evaluate_at<Tz: TimeZone>(&self, manual_override: bool, now: DateTime<Tz>) -> Result<GateDecision> {
        if manual_override {
            return Ok(GateDecision::open(GateReason::ManualOverride));
        }

        let now_utc = now.with_timezone(&Utc);
        if let Some(request) = self.store.due_restart_request(now_utc)? {
            debug!(request_id = request.id, reason = %request.reason, "Restart request is due");
            let mut decision = GateDecision::open(GateReason::RestartRequested { request_id: request.id });
            decision.restart_request = Some(request);
            return Ok(decision);
        }

        if !self.in_window(now.time()) {
            return Ok(GateDecision::closed(GateReason::OutsideWindow));
        }

        let midnight = start_of_day(&now);
        if self.store.has_success_since(midnight)? {
            return Ok(GateDecision::closed(GateReason::AlreadySucceededToday));
        }
        Ok(GateDecision::open(GateReason::InWindow))
    }

    fn in_window(&self, time: NaiveTime) -> bool {
        const DAY: i64 = 24 * 60 * 60;
        let now = i64::from(time.num_seconds_from_midnight());
        let target = i64::from(self.target.num_seconds_from_midnight());
        // Signed distance on the 24h circle so 23:50 is near a 00:10 target.
        let diff = (now - target).rem_euclid(DAY);
        let diff = if diff > DAY / 2 { DAY - diff } else { diff };
        diff <= self.window.num_seconds()
    }
}

fn start_of_day<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Utc> {
    let midnight = now.date_naive().and_time(NaiveTime::MIN);
    now.timezone()
        .from_local_datetime(&midnight)
        .earliest()
        .map_or_else(|| now.with_timezone(&Utc) - Duration::hours(24), |d| d.with_timezone(&Utc))
}
