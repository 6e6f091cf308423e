use serde::{Deserialize, Serialize};

/// Global knobs that tune control-plane behaviour.
///
/// Every section carries defaults so a configuration file only needs to name
/// the values it wants to change.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Worker pool sizing, backlog limits and host-health backoff.
    pub queue: QueueConfig,
    /// Event log capacity and subscriber channel sizes.
    pub events: EventStoreConfig,
    /// Force-bypass policy for the emergency-stop and freeze gates.
    pub admission: AdmissionConfig,
    /// Scheduler loop cadence.
    pub scheduler: SchedulerConfig,
    /// Rule engine subscription sizing.
    pub rules: RuleEngineConfig,
    /// Execution lock defaults.
    pub locks: LockConfig,
    /// Run lease defaults (TTL, heartbeat cadence, housekeeping).
    pub leases: LeaseConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of worker tasks pulling jobs.
    pub workers: usize,
    /// `queued + running` ceiling; enqueue fails with BACKLOG_FULL beyond it.
    pub max_backlog: usize,
    /// Fraction of `max_backlog` at which a `queue.saturation` event fires.
    pub saturation_threshold: f64,
    /// Optional ceiling on a single job's estimated cost.
    pub max_execution_cost: Option<f64>,
    /// Skips on an unhealthy host tolerated before the job is failed.
    pub host_unhealthy_max_skips: u32,
    /// Delay before a skipped job becomes eligible again (ms).
    pub host_backoff_ms: u64,
    /// How long `cancel` waits for a running job to stop (ms).
    pub cancel_grace_ms: u64,
    /// Subscriber callbacks slower than this are dropped (ms).
    pub subscriber_timeout_ms: u64,
    /// Idle poll interval for workers waiting on deferred jobs (ms).
    pub idle_poll_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_backlog: 1_000,
            saturation_threshold: 0.8,
            max_execution_cost: None,
            host_unhealthy_max_skips: 5,
            host_backoff_ms: 500,
            cancel_grace_ms: 5_000,
            subscriber_timeout_ms: 100,
            idle_poll_ms: 250,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EventStoreConfig {
    /// Ring buffer capacity; the oldest event is dropped past it.
    pub capacity: usize,
    /// Default per-subscriber channel depth.
    pub subscriber_buffer: usize,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            capacity: 20_000,
            subscriber_buffer: 256,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Let `force=true` requests through an active emergency stop.
    pub allow_force_during_stop: bool,
    /// Let `force=true` requests through an active change freeze.
    pub allow_force_during_freeze: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            allow_force_during_stop: false,
            allow_force_during_freeze: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on how long the loop sleeps with nothing due (ms).
    pub max_idle_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_idle_ms: 60_000 }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleEngineConfig {
    /// Channel depth of the rule engine's event subscription.
    pub subscriber_buffer: usize,
}

impl Default for RuleEngineConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 4_096,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// TTL applied to locks taken on behalf of enqueued jobs (seconds).
    pub job_lock_ttl_secs: i64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            job_lock_ttl_secs: 3_600,
        }
    }
}

/// Lease/heartbeat tuning for worker tasks.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// TTL for leases taken by queue workers (seconds).
    pub lease_ttl_secs: i64,
    /// Housekeeping cadence for recovering expired leases and reaping locks (ms).
    pub housekeeper_interval_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 30,
            housekeeper_interval_ms: 15_000,
        }
    }
}
