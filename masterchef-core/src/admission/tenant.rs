use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{AdmissionContext, AdmissionGate, AdmissionRequest, GateDecision};
use crate::error::{ControlError, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TenantPolicy {
    pub tenant: String,
    /// Ceiling on the tenant's queued + running jobs.
    #[serde(default)]
    pub max_concurrent_runs: Option<usize>,
    /// Share of `max_backlog` the tenant's queued jobs may occupy.
    #[serde(default)]
    pub max_queue_share_percent: Option<f64>,
}

/// Per-tenant concurrency and queue-share caps.
#[derive(Debug, Default)]
pub struct TenantLimitsGate {
    policies: RwLock<BTreeMap<String, TenantPolicy>>,
}

impl TenantLimitsGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_policy(&self, policy: TenantPolicy) -> Result<TenantPolicy> {
        if policy.tenant.trim().is_empty() {
            return Err(ControlError::InvalidRequest("tenant policy requires a tenant".into()));
        }
        if let Some(share) = policy.max_queue_share_percent
            && !(share > 0.0 && share <= 100.0)
        {
            return Err(ControlError::InvalidRequest(
                "max_queue_share_percent must be in (0, 100]".into(),
            ));
        }
        self.policies
            .write()
            .insert(policy.tenant.clone(), policy.clone());
        Ok(policy)
    }

    pub fn policies(&self) -> Vec<TenantPolicy> {
        self.policies.read().values().cloned().collect()
    }
}

impl AdmissionGate for TenantLimitsGate {
    fn name(&self) -> &'static str {
        "tenant_limits"
    }

    fn evaluate(&self, request: &AdmissionRequest, ctx: &AdmissionContext) -> GateDecision {
        let Some(tenant) = request.tenant.as_deref() else {
            return GateDecision::Allow;
        };
        let policies = self.policies.read();
        let Some(policy) = policies.get(tenant) else {
            return GateDecision::Allow;
        };
        let load = ctx.load.tenants.get(tenant).copied().unwrap_or_default();

        if let Some(max) = policy.max_concurrent_runs {
            let in_flight = load.queued + load.running;
            if in_flight >= max {
                return GateDecision::Deny(format!(
                    "tenant {tenant} at concurrent run limit ({in_flight}/{max})"
                ));
            }
        }
        if let Some(share) = policy.max_queue_share_percent {
            let allowed = (ctx.load.max_backlog as f64 * share / 100.0).floor().max(1.0);
            if (load.queued + 1) as f64 > allowed {
                return GateDecision::Deny(format!(
                    "tenant {tenant} would exceed {share}% queue share ({} of {allowed} slots)",
                    load.queued + 1
                ));
            }
        }
        GateDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::super::TenantLoad;
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn concurrent_cap_counts_queued_and_running() {
        let gate = TenantLimitsGate::new();
        gate.set_policy(TenantPolicy {
            tenant: "acme".into(),
            max_concurrent_runs: Some(2),
            max_queue_share_percent: None,
        })
        .unwrap();

        let mut req = request();
        req.tenant = Some("acme".into());
        let mut ctx = ctx();
        ctx.load.tenants.insert("acme".into(), TenantLoad { queued: 1, running: 0 });
        assert_eq!(gate.evaluate(&req, &ctx), GateDecision::Allow);

        ctx.load.tenants.insert("acme".into(), TenantLoad { queued: 1, running: 1 });
        assert!(matches!(gate.evaluate(&req, &ctx), GateDecision::Deny(_)));

        req.tenant = Some("other".into());
        assert_eq!(gate.evaluate(&req, &ctx), GateDecision::Allow);
    }

    #[test]
    fn queue_share_is_relative_to_backlog() {
        let gate = TenantLimitsGate::new();
        gate.set_policy(TenantPolicy {
            tenant: "acme".into(),
            max_concurrent_runs: None,
            max_queue_share_percent: Some(10.0),
        })
        .unwrap();

        let mut req = request();
        req.tenant = Some("acme".into());
        let mut ctx = ctx();
        ctx.load.tenants.insert("acme".into(), TenantLoad { queued: 9, running: 0 });
        assert_eq!(gate.evaluate(&req, &ctx), GateDecision::Allow);
        ctx.load.tenants.insert("acme".into(), TenantLoad { queued: 10, running: 0 });
        assert!(matches!(gate.evaluate(&req, &ctx), GateDecision::Deny(_)));
    }

    #[test]
    fn share_out_of_range_is_rejected() {
        let gate = TenantLimitsGate::new();
        assert!(gate
            .set_policy(TenantPolicy {
                tenant: "acme".into(),
                max_concurrent_runs: None,
                max_queue_share_percent: Some(150.0),
            })
            .is_err());
    }
}
