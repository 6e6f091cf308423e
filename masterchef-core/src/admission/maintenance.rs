use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{AdmissionContext, AdmissionGate, AdmissionRequest, GateDecision};
use crate::clock::Clock;
use crate::error::{ControlError, Result};
use crate::events::{EventDraft, EventStore};
use crate::store::KeyedStore;

/// What a request is about to touch, e.g. `host/web-01`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MaintenanceTarget {
    pub kind: String,
    pub name: String,
}

impl MaintenanceTarget {
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind.to_ascii_lowercase(), self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub reason: Option<String>,
    /// Open-ended when absent.
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl MaintenanceWindow {
    pub fn target(&self) -> MaintenanceTarget {
        MaintenanceTarget {
            kind: self.kind.clone(),
            name: self.name.clone(),
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && self.starts_at.is_none_or(|start| now >= start)
            && self.ends_at.is_none_or(|end| now < end)
    }
}

/// Denies requests whose target sits inside an active maintenance window.
#[derive(Debug)]
pub struct MaintenanceGate {
    windows: Arc<KeyedStore<MaintenanceWindow>>,
    clock: Arc<dyn Clock>,
    events: Arc<EventStore>,
}

impl MaintenanceGate {
    pub fn new(
        windows: Arc<KeyedStore<MaintenanceWindow>>,
        clock: Arc<dyn Clock>,
        events: Arc<EventStore>,
    ) -> Self {
        Self {
            windows,
            clock,
            events,
        }
    }

    pub fn store(&self) -> Arc<KeyedStore<MaintenanceWindow>> {
        Arc::clone(&self.windows)
    }

    /// Creates or replaces the window for `(kind, name)`.
    pub fn set_window(&self, mut window: MaintenanceWindow) -> Result<MaintenanceWindow> {
        if window.kind.trim().is_empty() || window.name.trim().is_empty() {
            return Err(ControlError::InvalidRequest(
                "maintenance window requires kind and name".into(),
            ));
        }
        if let (Some(start), Some(end)) = (window.starts_at, window.ends_at)
            && end <= start
        {
            return Err(ControlError::InvalidRequest(
                "maintenance window ends_at must be after starts_at".into(),
            ));
        }
        window.updated_at = self.clock.now();
        let key = window.target().key();
        self.windows.insert(key.clone(), window.clone())?;

        info!(target = %key, enabled = window.enabled, "maintenance window updated");
        self.events.record(
            EventDraft::new("control.maintenance.updated", format!("maintenance window {key} updated"))
                .field("kind", window.kind.clone())
                .field("name", window.name.clone())
                .field("enabled", window.enabled)
                .field_opt("reason", window.reason.clone()),
        );
        Ok(window)
    }

    pub fn list(&self) -> Vec<MaintenanceWindow> {
        self.windows.values()
    }

    pub fn active_for(&self, target: &MaintenanceTarget, now: DateTime<Utc>) -> Option<MaintenanceWindow> {
        self.windows
            .get(&target.key())
            .filter(|window| window.is_active(now))
    }
}

impl AdmissionGate for MaintenanceGate {
    fn name(&self) -> &'static str {
        "maintenance"
    }

    fn evaluate(&self, request: &AdmissionRequest, ctx: &AdmissionContext) -> GateDecision {
        let Some(target) = &request.target else {
            return GateDecision::Allow;
        };
        match self.active_for(target, ctx.now) {
            Some(window) => {
                let mut reason = format!("{} {} is in maintenance", target.kind, target.name);
                if let Some(why) = window.reason {
                    reason.push_str(&format!(": {why}"));
                }
                GateDecision::Deny(reason)
            }
            None => GateDecision::Allow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::clock::SystemClock;
    use chrono::Duration;

    fn gate() -> MaintenanceGate {
        MaintenanceGate::new(
            Arc::new(KeyedStore::in_memory("maintenance")),
            Arc::new(SystemClock::new()),
            events(),
        )
    }

    fn window(kind: &str, name: &str) -> MaintenanceWindow {
        MaintenanceWindow {
            kind: kind.into(),
            name: name.into(),
            reason: Some("disk swap".into()),
            starts_at: None,
            ends_at: None,
            enabled: true,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn matching_target_is_denied() {
        let gate = gate();
        gate.set_window(window("host", "web-01")).unwrap();

        let mut req = request();
        req.target = Some(MaintenanceTarget { kind: "host".into(), name: "web-01".into() });
        assert!(matches!(gate.evaluate(&req, &ctx()), GateDecision::Deny(r) if r.contains("disk swap")));

        req.target = Some(MaintenanceTarget { kind: "host".into(), name: "web-02".into() });
        assert_eq!(gate.evaluate(&req, &ctx()), GateDecision::Allow);
        assert_eq!(gate.evaluate(&request(), &ctx()), GateDecision::Allow);
    }

    #[test]
    fn expired_or_disabled_windows_allow() {
        let gate = gate();
        let mut expired = window("service", "api");
        expired.starts_at = Some(Utc::now() - Duration::hours(2));
        expired.ends_at = Some(Utc::now() - Duration::hours(1));
        gate.set_window(expired).unwrap();

        let mut disabled = window("host", "db-01");
        disabled.enabled = false;
        gate.set_window(disabled).unwrap();

        for (kind, name) in [("service", "api"), ("host", "db-01")] {
            let mut req = request();
            req.target = Some(MaintenanceTarget { kind: kind.into(), name: name.into() });
            assert_eq!(gate.evaluate(&req, &ctx()), GateDecision::Allow);
        }
    }

    #[test]
    fn inverted_window_is_invalid() {
        let gate = gate();
        let mut bad = window("host", "web-01");
        bad.starts_at = Some(Utc::now());
        bad.ends_at = Some(Utc::now() - Duration::minutes(1));
        assert!(matches!(gate.set_window(bad), Err(ControlError::InvalidRequest(_))));
    }
}
