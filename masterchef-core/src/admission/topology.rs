use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{AdmissionContext, AdmissionGate, AdmissionRequest, GateDecision};
use crate::error::{ControlError, Result};

/// Where a job runs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Placement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,
}

/// Caps parallel jobs in every placement the selector matches.
///
/// Unset selector fields match anything.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopologyPolicy {
    pub name: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub failure_domain: Option<String>,
    pub max_parallel: usize,
}

impl TopologyPolicy {
    pub fn selects(&self, placement: &Placement) -> bool {
        fn field(selector: &Option<String>, value: &Option<String>) -> bool {
            match selector {
                Some(wanted) => value.as_deref() == Some(wanted.as_str()),
                None => true,
            }
        }
        field(&self.region, &placement.region)
            && field(&self.zone, &placement.zone)
            && field(&self.cluster, &placement.cluster)
            && field(&self.failure_domain, &placement.failure_domain)
    }
}

#[derive(Debug, Default)]
pub struct TopologyGate {
    policies: RwLock<BTreeMap<String, TopologyPolicy>>,
}

impl TopologyGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_policy(&self, policy: TopologyPolicy) -> Result<TopologyPolicy> {
        if policy.name.trim().is_empty() {
            return Err(ControlError::InvalidRequest("topology policy requires a name".into()));
        }
        if policy.max_parallel == 0 {
            return Err(ControlError::InvalidRequest("max_parallel must be at least 1".into()));
        }
        self.policies.write().insert(policy.name.clone(), policy.clone());
        Ok(policy)
    }

    pub fn policies(&self) -> Vec<TopologyPolicy> {
        self.policies.read().values().cloned().collect()
    }
}

impl AdmissionGate for TopologyGate {
    fn name(&self) -> &'static str {
        "topology_placement"
    }

    fn evaluate(&self, request: &AdmissionRequest, ctx: &AdmissionContext) -> GateDecision {
        let Some(placement) = &request.placement else {
            return GateDecision::Allow;
        };
        for policy in self.policies.read().values() {
            if !policy.selects(placement) {
                continue;
            }
            let active = ctx
                .load
                .active_placements
                .iter()
                .filter(|p| policy.selects(p))
                .count();
            if active >= policy.max_parallel {
                return GateDecision::Deny(format!(
                    "topology policy {} allows {} parallel jobs and {active} are active",
                    policy.name, policy.max_parallel
                ));
            }
        }
        GateDecision::Allow
    }
}
