//! Admission gates consulted before a job enters the queue.
//!
//! Each gate is an independent veto. [`AdmissionSet`] walks them in order and
//! stops at the first denial, recording it as an `admission.denied` event.

mod cost;
mod emergency_stop;
mod freeze;
mod maintenance;
mod tenant;
mod topology;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use cost::{CostPolicy, CostSchedulingGate};
pub use emergency_stop::{EmergencyStopGate, EmergencyStopStatus};
pub use freeze::{FreezeGate, FreezeStatus};
pub use maintenance::{MaintenanceGate, MaintenanceTarget, MaintenanceWindow};
pub use tenant::{TenantLimitsGate, TenantPolicy};
pub use topology::{Placement, TopologyGate, TopologyPolicy};

use crate::error::{ControlError, Result};
use crate::events::{EventDraft, EventStore};
use crate::queue::JobPriority;

/// What a gate gets to look at.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AdmissionRequest {
    pub config_path: String,
    pub priority: JobPriority,
    pub force: bool,
    pub source: String,
    pub target: Option<MaintenanceTarget>,
    pub tenant: Option<String>,
    pub estimated_cost: Option<f64>,
    pub placement: Option<Placement>,
}

/// Per-tenant queue occupancy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TenantLoad {
    pub queued: usize,
    pub running: usize,
}

/// Snapshot of queue occupancy taken just before evaluation.
#[derive(Clone, Debug, Default, Serialize)]
pub struct QueueLoad {
    pub queued: usize,
    pub running: usize,
    pub max_backlog: usize,
    pub tenants: HashMap<String, TenantLoad>,
    /// Placements of every queued or running job.
    pub active_placements: Vec<Placement>,
}

#[derive(Clone, Debug)]
pub struct AdmissionContext {
    pub now: DateTime<Utc>,
    pub load: QueueLoad,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Deny(String),
}

pub trait AdmissionGate: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn evaluate(&self, request: &AdmissionRequest, ctx: &AdmissionContext) -> GateDecision;

    /// Called once the request has been admitted by every gate.
    fn on_admitted(&self, _request: &AdmissionRequest, _ctx: &AdmissionContext) {}
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AdmissionDecision {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            gate: None,
            reason: None,
        }
    }

    pub fn into_result(self) -> Result<()> {
        if self.allowed {
            return Ok(());
        }
        Err(ControlError::denied(
            self.gate.unwrap_or_else(|| "admission".into()),
            self.reason.unwrap_or_else(|| "denied".into()),
        ))
    }
}

/// Ordered list of gates.
pub struct AdmissionSet {
    gates: Vec<Arc<dyn AdmissionGate>>,
    events: Arc<EventStore>,
}

impl fmt::Debug for AdmissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionSet")
            .field("gates", &self.gate_names())
            .finish_non_exhaustive()
    }
}

impl AdmissionSet {
    pub fn new(events: Arc<EventStore>) -> Self {
        Self {
            gates: Vec::new(),
            events,
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn AdmissionGate>) -> Self {
        self.gates.push(gate);
        self
    }

    pub fn gate_names(&self) -> Vec<&'static str> {
        self.gates.iter().map(|g| g.name()).collect()
    }

    pub fn evaluate(&self, request: &AdmissionRequest, ctx: &AdmissionContext) -> AdmissionDecision {
        self.evaluate_gates(self.gates.iter(), request, ctx)
    }

    /// Evaluates only the named gates, in set order.
    pub fn evaluate_only(
        &self,
        names: &[&str],
        request: &AdmissionRequest,
        ctx: &AdmissionContext,
    ) -> AdmissionDecision {
        self.evaluate_gates(
            self.gates.iter().filter(|g| names.contains(&g.name())),
            request,
            ctx,
        )
    }

    fn evaluate_gates<'a>(
        &self,
        gates: impl Iterator<Item = &'a Arc<dyn AdmissionGate>>,
        request: &AdmissionRequest,
        ctx: &AdmissionContext,
    ) -> AdmissionDecision {
        for gate in gates {
            if let GateDecision::Deny(reason) = gate.evaluate(request, ctx) {
                warn!(
                    gate = gate.name(),
                    config_path = %request.config_path,
                    source = %request.source,
                    %reason,
                    "admission denied"
                );
                self.events.record(
                    EventDraft::new(
                        "admission.denied",
                        format!("{} denied {}: {reason}", gate.name(), request.config_path),
                    )
                    .field("gate", gate.name())
                    .field("reason", reason.clone())
                    .field("config_path", request.config_path.clone())
                    .field("priority", request.priority.as_str())
                    .field("source", request.source.clone())
                    .field("force", request.force),
                );
                return AdmissionDecision {
                    allowed: false,
                    gate: Some(gate.name().to_string()),
                    reason: Some(reason),
                };
            }
        }
        AdmissionDecision::allowed()
    }

    pub fn admitted(&self, request: &AdmissionRequest, ctx: &AdmissionContext) {
        for gate in &self.gates {
            gate.on_admitted(request, ctx);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[derive(Debug)]
    struct Always(&'static str, bool);

    impl AdmissionGate for Always {
        fn name(&self) -> &'static str {
            self.0
        }

        fn evaluate(&self, _: &AdmissionRequest, _: &AdmissionContext) -> GateDecision {
            if self.1 {
                GateDecision::Allow
            } else {
                GateDecision::Deny(format!("{} says no", self.0))
            }
        }
    }

    #[test]
    fn first_denial_wins_and_is_recorded() {
        let events = events();
        let set = AdmissionSet::new(events.clone())
            .with_gate(Arc::new(Always("open", true)))
            .with_gate(Arc::new(Always("first", false)))
            .with_gate(Arc::new(Always("second", false)));

        let decision = set.evaluate(&request(), &ctx());
        assert!(!decision.allowed);
        assert_eq!(decision.gate.as_deref(), Some("first"));

        let denied = events.list(10);
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].event_type, "admission.denied");
        assert_eq!(denied[0].fields["gate"], "first");
    }

    #[test]
    fn evaluate_only_skips_other_gates() {
        let set = AdmissionSet::new(events())
            .with_gate(Arc::new(Always("freeze", true)))
            .with_gate(Arc::new(Always("tenant_limits", false)));
        assert!(set.evaluate_only(&["freeze"], &request(), &ctx()).allowed);
        assert!(!set.evaluate(&request(), &ctx()).allowed);
    }

    #[test]
    fn denial_converts_to_conflict() {
        let decision = AdmissionDecision {
            allowed: false,
            gate: Some("freeze".into()),
            reason: Some("frozen".into()),
        };
        assert!(matches!(
            decision.into_result(),
            Err(ControlError::Conflict { gate: Some(_), .. })
        ));
    }
}
