use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use super::{AdmissionContext, AdmissionGate, AdmissionRequest, GateDecision};
use crate::clock::Clock;
use crate::error::{ControlError, Result};
use crate::events::{EventDraft, EventStore};

#[derive(Clone, Debug)]
struct FreezeWindow {
    reason: Option<String>,
    started_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FreezeStatus {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub allow_force: bool,
}

/// Time-bounded change freeze.
#[derive(Debug)]
pub struct FreezeGate {
    window: Mutex<Option<FreezeWindow>>,
    allow_force: bool,
    clock: Arc<dyn Clock>,
    events: Arc<EventStore>,
}

impl FreezeGate {
    pub fn new(allow_force: bool, clock: Arc<dyn Clock>, events: Arc<EventStore>) -> Self {
        Self {
            window: Mutex::new(None),
            allow_force,
            clock,
            events,
        }
    }

    pub fn freeze(&self, duration: Duration, reason: Option<String>) -> Result<FreezeStatus> {
        if duration <= Duration::zero() {
            return Err(ControlError::InvalidRequest(
                "freeze duration_seconds must be positive".into(),
            ));
        }
        let now = self.clock.now();
        let window = FreezeWindow {
            reason: reason.filter(|r| !r.trim().is_empty()),
            started_at: now,
            expires_at: now + duration,
        };
        *self.window.lock() = Some(window.clone());

        info!(expires_at = %window.expires_at, "change freeze enabled");
        self.events.record(
            EventDraft::new("control.freeze.enabled", "change freeze enabled")
                .field("expires_at", window.expires_at.to_rfc3339())
                .field_opt("reason", window.reason.clone()),
        );
        Ok(self.status_at(now))
    }

    pub fn unfreeze(&self) -> FreezeStatus {
        let previous = self.window.lock().take();
        if previous.is_some() {
            info!("change freeze disabled");
            self.events
                .record(EventDraft::new("control.freeze.disabled", "change freeze disabled"));
        }
        self.status()
    }

    pub fn status(&self) -> FreezeStatus {
        self.status_at(self.clock.now())
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> FreezeStatus {
        match self.active_window(now) {
            Some(window) => FreezeStatus {
                enabled: true,
                reason: window.reason,
                started_at: Some(window.started_at),
                expires_at: Some(window.expires_at),
                allow_force: self.allow_force,
            },
            None => FreezeStatus {
                enabled: false,
                reason: None,
                started_at: None,
                expires_at: None,
                allow_force: self.allow_force,
            },
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.active_window(now).is_some()
    }

    fn active_window(&self, now: DateTime<Utc>) -> Option<FreezeWindow> {
        self.window
            .lock()
            .as_ref()
            .filter(|w| now < w.expires_at)
            .cloned()
    }
}

impl AdmissionGate for FreezeGate {
    fn name(&self) -> &'static str {
        "freeze"
    }

    fn evaluate(&self, request: &AdmissionRequest, ctx: &AdmissionContext) -> GateDecision {
        let Some(window) = self.active_window(ctx.now) else {
            return GateDecision::Allow;
        };
        if request.force && self.allow_force {
            return GateDecision::Allow;
        }
        let mut reason = format!("change freeze active until {}", window.expires_at.to_rfc3339());
        if let Some(why) = window.reason {
            reason.push_str(&format!(": {why}"));
        }
        GateDecision::Deny(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::clock::SystemClock;

    #[test]
    fn freeze_blocks_until_expiry_and_force_bypasses() {
        let gate = FreezeGate::new(true, Arc::new(SystemClock::new()), events());
        gate.freeze(Duration::seconds(120), Some("release week".into())).unwrap();

        let mut ctx = ctx();
        assert!(matches!(gate.evaluate(&request(), &ctx), GateDecision::Deny(r) if r.contains("release week")));

        let mut forced = request();
        forced.force = true;
        assert_eq!(gate.evaluate(&forced, &ctx), GateDecision::Allow);

        ctx.now += Duration::seconds(121);
        assert_eq!(gate.evaluate(&request(), &ctx), GateDecision::Allow);
    }

    #[test]
    fn zero_duration_is_rejected() {
        let gate = FreezeGate::new(true, Arc::new(SystemClock::new()), events());
        assert!(gate.freeze(Duration::zero(), None).is_err());
        assert!(!gate.status().enabled);
    }

    #[test]
    fn unfreeze_lifts_the_window() {
        let gate = FreezeGate::new(false, Arc::new(SystemClock::new()), events());
        gate.freeze(Duration::seconds(60), None).unwrap();
        assert!(gate.status().enabled);
        assert!(!gate.unfreeze().enabled);
        assert_eq!(gate.evaluate(&request(), &ctx()), GateDecision::Allow);
    }
}
