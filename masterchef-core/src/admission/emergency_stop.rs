use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use super::{AdmissionContext, AdmissionGate, AdmissionRequest, GateDecision};
use crate::clock::Clock;
use crate::events::{EventDraft, EventStore};

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EmergencyStopStatus {
    pub enabled: bool,
    pub reason: Option<String>,
    pub changed_at: Option<DateTime<Utc>>,
    pub allow_force: bool,
}

/// Process-wide stop switch for new work.
#[derive(Debug)]
pub struct EmergencyStopGate {
    status: Mutex<EmergencyStopStatus>,
    clock: Arc<dyn Clock>,
    events: Arc<EventStore>,
}

impl EmergencyStopGate {
    pub fn new(allow_force: bool, clock: Arc<dyn Clock>, events: Arc<EventStore>) -> Self {
        Self {
            status: Mutex::new(EmergencyStopStatus {
                allow_force,
                ..Default::default()
            }),
            clock,
            events,
        }
    }

    pub fn status(&self) -> EmergencyStopStatus {
        self.status.lock().clone()
    }

    pub fn set(&self, enabled: bool, reason: Option<String>) -> EmergencyStopStatus {
        let status = {
            let mut status = self.status.lock();
            status.enabled = enabled;
            status.reason = reason.filter(|r| !r.trim().is_empty());
            status.changed_at = Some(self.clock.now());
            status.clone()
        };

        let (event_type, verb) = if enabled {
            ("control.emergency_stop.enabled", "enabled")
        } else {
            ("control.emergency_stop.disabled", "disabled")
        };
        info!(enabled, reason = ?status.reason, "emergency stop {verb}");
        self.events.record(
            EventDraft::new(event_type, format!("emergency stop {verb}"))
                .field_opt("reason", status.reason.clone()),
        );
        status
    }
}

impl AdmissionGate for EmergencyStopGate {
    fn name(&self) -> &'static str {
        "emergency_stop"
    }

    fn evaluate(&self, request: &AdmissionRequest, _ctx: &AdmissionContext) -> GateDecision {
        let status = self.status.lock();
        if !status.enabled || (request.force && status.allow_force) {
            return GateDecision::Allow;
        }
        match &status.reason {
            Some(reason) => GateDecision::Deny(format!("emergency stop is active: {reason}")),
            None => GateDecision::Deny("emergency stop is active".into()),
        }
    }
}
