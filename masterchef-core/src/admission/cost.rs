use std::collections::VecDeque;

use chrono::{DateTime, Duration, Timelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{AdmissionContext, AdmissionGate, AdmissionRequest, GateDecision};
use crate::error::{ControlError, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CostPolicy {
    /// Spend allowed per rolling hour.
    pub hourly_budget: f64,
    /// Percentage of the budget at which requests start being denied.
    #[serde(default = "default_threshold")]
    pub threshold_percent: f64,
    /// UTC hour the off-peak window starts (inclusive).
    #[serde(default)]
    pub off_peak_start_hour: Option<u32>,
    /// UTC hour the off-peak window ends (exclusive); may wrap midnight.
    #[serde(default)]
    pub off_peak_end_hour: Option<u32>,
    /// Budget multiplier applied inside the off-peak window.
    #[serde(default = "default_multiplier")]
    pub off_peak_multiplier: f64,
}

fn default_threshold() -> f64 {
    100.0
}

fn default_multiplier() -> f64 {
    1.0
}

impl CostPolicy {
    fn is_off_peak(&self, now: DateTime<Utc>) -> bool {
        let (Some(start), Some(end)) = (self.off_peak_start_hour, self.off_peak_end_hour) else {
            return false;
        };
        let hour = now.hour();
        if start <= end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }

    fn limit_at(&self, now: DateTime<Utc>) -> f64 {
        let mut limit = self.hourly_budget * self.threshold_percent / 100.0;
        if self.is_off_peak(now) {
            limit *= self.off_peak_multiplier;
        }
        limit
    }
}

#[derive(Debug, Default)]
struct CostState {
    policy: Option<CostPolicy>,
    spend: VecDeque<(DateTime<Utc>, f64)>,
}

/// Rolling-hour spend budget keyed on each request's estimated cost.
#[derive(Debug, Default)]
pub struct CostSchedulingGate {
    state: Mutex<CostState>,
}

impl CostSchedulingGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_policy(&self, policy: CostPolicy) -> Result<CostPolicy> {
        if policy.hourly_budget < 0.0 || policy.threshold_percent <= 0.0 || policy.off_peak_multiplier <= 0.0 {
            return Err(ControlError::InvalidRequest(
                "cost policy values must be positive".into(),
            ));
        }
        let valid_hour = |h: Option<u32>| h.is_none_or(|h| h < 24);
        if !valid_hour(policy.off_peak_start_hour) || !valid_hour(policy.off_peak_end_hour) {
            return Err(ControlError::InvalidRequest("off-peak hours must be 0..=23".into()));
        }
        self.state.lock().policy = Some(policy.clone());
        Ok(policy)
    }

    pub fn policy(&self) -> Option<CostPolicy> {
        self.state.lock().policy.clone()
    }

    /// Spend admitted within the hour before `now`.
    pub fn spent_since(&self, now: DateTime<Utc>) -> f64 {
        let mut state = self.state.lock();
        prune(&mut state.spend, now);
        state.spend.iter().map(|(_, cost)| cost).sum()
    }
}

fn prune(spend: &mut VecDeque<(DateTime<Utc>, f64)>, now: DateTime<Utc>) {
    let horizon = now - Duration::hours(1);
    while spend.front().is_some_and(|(at, _)| *at <= horizon) {
        spend.pop_front();
    }
}

impl AdmissionGate for CostSchedulingGate {
    fn name(&self) -> &'static str {
        "cost_scheduling"
    }

    fn evaluate(&self, request: &AdmissionRequest, ctx: &AdmissionContext) -> GateDecision {
        let mut state = self.state.lock();
        let (Some(policy), Some(cost)) = (state.policy.clone(), request.estimated_cost) else {
            return GateDecision::Allow;
        };
        prune(&mut state.spend, ctx.now);
        let spent: f64 = state.spend.iter().map(|(_, c)| c).sum();
        let limit = policy.limit_at(ctx.now);
        if spent + cost > limit {
            return GateDecision::Deny(format!(
                "estimated cost {cost:.2} would push hourly spend to {:.2} over limit {limit:.2}",
                spent + cost
            ));
        }
        GateDecision::Allow
    }

    fn on_admitted(&self, request: &AdmissionRequest, ctx: &AdmissionContext) {
        if let Some(cost) = request.estimated_cost {
            let mut state = self.state.lock();
            if state.policy.is_some() {
                state.spend.push_back((ctx.now, cost));
            }
        }
    }
}
