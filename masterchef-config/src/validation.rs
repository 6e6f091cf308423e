use thiserror::Error;

use crate::constants::{MIN_EVENT_CAPACITY, WORKER_WARNING_THRESHOLD};
use crate::models::Config;

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("control.queue.workers must be at least 1")]
    NoWorkers,
    #[error("control.queue.max_backlog must be at least 1")]
    NoBacklog,
    #[error(
        "control.events.capacity {capacity} is below the minimum of {min}",
        min = MIN_EVENT_CAPACITY
    )]
    EventCapacityTooSmall { capacity: usize },
    #[error("control.queue.saturation_threshold {value} must be in (0, 1]")]
    InvalidSaturationThreshold { value: f64 },
    #[error("control.leases.lease_ttl_secs {secs} must be at least 1 second")]
    LeaseTtlTooShort { secs: i64 },
    #[error("control.queue.max_execution_cost must be positive, got {value}")]
    InvalidCostCeiling { value: f64 },
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

pub fn apply_guard_rails(
    config: &Config,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();
    let control = &config.control;

    if control.queue.workers == 0 {
        return Err(ConfigGuardRailError::NoWorkers);
    }
    if control.queue.max_backlog == 0 {
        return Err(ConfigGuardRailError::NoBacklog);
    }
    if control.events.capacity < MIN_EVENT_CAPACITY {
        return Err(ConfigGuardRailError::EventCapacityTooSmall {
            capacity: control.events.capacity,
        });
    }
    let threshold = control.queue.saturation_threshold;
    if !(threshold > 0.0 && threshold <= 1.0) {
        return Err(ConfigGuardRailError::InvalidSaturationThreshold {
            value: threshold,
        });
    }
    if control.leases.lease_ttl_secs < 1 {
        return Err(ConfigGuardRailError::LeaseTtlTooShort {
            secs: control.leases.lease_ttl_secs,
        });
    }
    if let Some(cost) = control.queue.max_execution_cost
        && !(cost > 0.0)
    {
        return Err(ConfigGuardRailError::InvalidCostCeiling { value: cost });
    }

    if control.queue.workers > WORKER_WARNING_THRESHOLD {
        warnings.push_with_hint(
            format!(
                "{} queue workers configured; applies contend for the same hosts",
                control.queue.workers
            ),
            "Lower control.queue.workers unless hosts are partitioned by lock key",
        );
    }
    if control.events.subscriber_buffer == 0 {
        warnings.push(
            "control.events.subscriber_buffer is 0; every subscriber is dropped on its first event",
        );
    }
    let housekeeping_secs = control.leases.housekeeper_interval_ms / 1_000;
    if housekeeping_secs as i64 > control.leases.lease_ttl_secs * 2 {
        warnings.push_with_hint(
            "Lease housekeeping runs less often than twice per lease TTL",
            "Expired run leases stay active until the next housekeeping pass",
        );
    }
    if control.admission.allow_force_during_stop {
        warnings.push(
            "allow_force_during_stop is enabled; forced applies bypass the emergency stop",
        );
    }
    if config.shutdown_grace.is_zero() {
        warnings.push_with_hint(
            "shutdown_grace is 0; running jobs are aborted immediately on shutdown",
            "Set shutdown_grace (e.g. \"10s\") to let jobs finish",
        );
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConfigMetadata, ServerConfig, StateConfig};
    use masterchef_core::config::ControlPlaneConfig;
    use std::{path::PathBuf, time::Duration};

    fn config() -> Config {
        Config {
            metadata: ConfigMetadata::default(),
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 8080,
            },
            state: StateConfig {
                dir: PathBuf::from("state"),
                workdir: PathBuf::from("."),
            },
            control: ControlPlaneConfig::default(),
            shutdown_grace: Duration::from_secs(10),
        }
    }

    #[test]
    fn defaults_pass_without_warnings() {
        let warnings = apply_guard_rails(&config()).unwrap();
        assert!(warnings.is_empty(), "{warnings:?}");
    }

    #[test]
    fn hard_limits_are_errors() {
        let mut cfg = config();
        cfg.control.queue.workers = 0;
        assert!(matches!(
            apply_guard_rails(&cfg),
            Err(ConfigGuardRailError::NoWorkers)
        ));

        let mut cfg = config();
        cfg.control.events.capacity = 8;
        assert!(matches!(
            apply_guard_rails(&cfg),
            Err(ConfigGuardRailError::EventCapacityTooSmall { capacity: 8 })
        ));

        let mut cfg = config();
        cfg.control.queue.saturation_threshold = 1.5;
        assert!(matches!(
            apply_guard_rails(&cfg),
            Err(ConfigGuardRailError::InvalidSaturationThreshold { .. })
        ));

        let mut cfg = config();
        cfg.control.leases.lease_ttl_secs = 0;
        assert!(matches!(
            apply_guard_rails(&cfg),
            Err(ConfigGuardRailError::LeaseTtlTooShort { secs: 0 })
        ));
    }

    #[test]
    fn soft_issues_are_collected_as_warnings() {
        let mut cfg = config();
        cfg.control.queue.workers = 128;
        cfg.shutdown_grace = Duration::ZERO;
        let warnings = apply_guard_rails(&cfg).unwrap();
        assert_eq!(warnings.items.len(), 2);
        assert!(warnings.items.iter().all(|w| w.hint.is_some()));
    }
}
