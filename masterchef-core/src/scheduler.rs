//! Periodic re-enqueue of configuration applies.
//!
//! Enabled schedules sit in a min-heap keyed by `next_fire_at`. Heap entries
//! are never removed eagerly; an entry whose time no longer matches the
//! stored schedule (or whose schedule was disabled) is discarded when popped.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, IdGenerator};
use crate::config::SchedulerConfig;
use crate::error::{ControlError, Result};
use crate::events::{EventDraft, EventStore};
use crate::queue::{EnqueueRequest, JobPriority, JobQueue};
use crate::store::KeyedStore;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub config_path: String,
    pub interval_seconds: u64,
    #[serde(default)]
    pub jitter_seconds: u64,
    pub enabled: bool,
    #[serde(default)]
    pub priority: JobPriority,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
    pub next_fire_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreateSchedule {
    pub config_path: String,
    pub interval_seconds: u64,
    #[serde(default)]
    pub jitter_seconds: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: JobPriority,
}

/// `now + interval ± jitter`, never earlier than one second from `now`.
pub fn compute_next(now: DateTime<Utc>, interval_seconds: u64, jitter_seconds: u64) -> DateTime<Utc> {
    let base_ms = (interval_seconds as i64).saturating_mul(1_000);
    let jitter_ms = (jitter_seconds as i64).saturating_mul(1_000);
    let offset = if jitter_ms > 0 {
        rand::rng().random_range(-jitter_ms..=jitter_ms)
    } else {
        0
    };
    let candidate = now + Duration::milliseconds(base_ms.saturating_add(offset));
    candidate.max(now + Duration::seconds(1))
}

type Due = Reverse<(DateTime<Utc>, String)>;

pub struct Scheduler {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<IdGenerator>,
    events: Arc<EventStore>,
    queue: Arc<JobQueue>,
    schedules: Arc<KeyedStore<Schedule>>,
    heap: Mutex<BinaryHeap<Due>>,
    wake: Notify,
    shutdown: CancellationToken,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Scheduler");
        debug.field("schedules", &self.schedules.len());
        if let Some(heap) = self.heap.try_lock() {
            debug.field("pending", &heap.len());
        }
        debug.finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Arms every enabled schedule found in `schedules`.
    pub fn new(
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<IdGenerator>,
        events: Arc<EventStore>,
        queue: Arc<JobQueue>,
        schedules: Arc<KeyedStore<Schedule>>,
        shutdown: CancellationToken,
    ) -> Self {
        let heap = schedules
            .values()
            .into_iter()
            .filter(|s| s.enabled)
            .map(|s| Reverse((s.next_fire_at, s.id)))
            .collect();
        Self {
            config,
            clock,
            ids,
            events,
            queue,
            schedules,
            heap: Mutex::new(heap),
            wake: Notify::new(),
            shutdown,
        }
    }

    pub fn store(&self) -> Arc<KeyedStore<Schedule>> {
        Arc::clone(&self.schedules)
    }

    pub fn list(&self) -> Vec<Schedule> {
        self.schedules.values()
    }

    pub fn get(&self, id: &str) -> Result<Schedule> {
        self.schedules
            .get(id)
            .ok_or_else(|| ControlError::NotFound(format!("schedule {id}")))
    }

    pub fn create(&self, request: CreateSchedule) -> Result<Schedule> {
        if request.interval_seconds == 0 {
            return Err(ControlError::InvalidRequest("interval_seconds must be at least 1".into()));
        }
        self.queue.resolve_config_path(&request.config_path)?;

        let now = self.clock.now();
        let schedule = Schedule {
            id: self.ids.next_id("sched"),
            config_path: request.config_path.trim().to_string(),
            interval_seconds: request.interval_seconds,
            jitter_seconds: request.jitter_seconds,
            enabled: request.enabled,
            priority: request.priority,
            created_at: now,
            last_fired_at: None,
            next_fire_at: compute_next(now, request.interval_seconds, request.jitter_seconds),
            last_job_id: None,
            last_error: None,
        };
        self.schedules.insert(schedule.id.clone(), schedule.clone())?;
        info!(schedule_id = %schedule.id, interval = schedule.interval_seconds, "schedule created");
        self.events.record(
            EventDraft::new("schedule.created", format!("schedule {} created", schedule.id))
                .field("schedule_id", schedule.id.clone())
                .field("config_path", schedule.config_path.clone())
                .field("interval_seconds", schedule.interval_seconds),
        );
        if schedule.enabled {
            self.arm(&schedule);
        }
        Ok(schedule)
    }

    /// Enables the schedule and re-arms it from now.
    pub fn enable(&self, id: &str) -> Result<Schedule> {
        let now = self.clock.now();
        let schedule = self
            .schedules
            .update(id, |s| {
                s.enabled = true;
                s.next_fire_at = compute_next(now, s.interval_seconds, s.jitter_seconds);
                s.clone()
            })?
            .ok_or_else(|| ControlError::NotFound(format!("schedule {id}")))?;
        self.arm(&schedule);
        self.events.record(
            EventDraft::new("schedule.enabled", format!("schedule {id} enabled"))
                .field("schedule_id", id),
        );
        Ok(schedule)
    }

    pub fn disable(&self, id: &str) -> Result<Schedule> {
        let schedule = self
            .schedules
            .update(id, |s| {
                s.enabled = false;
                s.clone()
            })?
            .ok_or_else(|| ControlError::NotFound(format!("schedule {id}")))?;
        self.events.record(
            EventDraft::new("schedule.disabled", format!("schedule {id} disabled"))
                .field("schedule_id", id),
        );
        Ok(schedule)
    }

    fn arm(&self, schedule: &Schedule) {
        self.heap
            .lock()
            .push(Reverse((schedule.next_fire_at, schedule.id.clone())));
        self.wake.notify_one();
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.heap.lock().peek().map(|Reverse((at, _))| *at)
    }

    /// Fires every schedule due at `now`; returns the schedules as updated.
    pub fn fire_due(&self, now: DateTime<Utc>) -> Vec<Schedule> {
        let due: Vec<(DateTime<Utc>, String)> = {
            let mut heap = self.heap.lock();
            let mut due = Vec::new();
            while heap.peek().is_some_and(|Reverse((at, _))| *at <= now) {
                if let Some(Reverse(entry)) = heap.pop() {
                    due.push(entry);
                }
            }
            due
        };

        let mut fired = Vec::new();
        for (at, id) in due {
            let Some(schedule) = self.schedules.get(&id) else {
                continue;
            };
            if !schedule.enabled || schedule.next_fire_at != at {
                debug!(schedule_id = %id, "discarding stale schedule entry");
                continue;
            }
            if let Some(updated) = self.fire(schedule, now) {
                fired.push(updated);
            }
        }
        fired
    }

    fn fire(&self, schedule: Schedule, now: DateTime<Utc>) -> Option<Schedule> {
        let request = EnqueueRequest::new(schedule.config_path.clone())
            .with_priority(schedule.priority)
            .with_idempotency_key(format!(
                "schedule:{}:{}",
                schedule.id,
                schedule.next_fire_at.timestamp_millis()
            ))
            .with_source(format!("schedule:{}", schedule.id));
        let outcome = self.queue.enqueue(request);
        let next = compute_next(now, schedule.interval_seconds, schedule.jitter_seconds);

        let updated = match self.schedules.update(&schedule.id, |s| {
            s.last_fired_at = Some(now);
            s.next_fire_at = next;
            match &outcome {
                Ok(job) => {
                    s.last_job_id = Some(job.id.clone());
                    s.last_error = None;
                }
                Err(err) => s.last_error = Some(err.to_string()),
            }
            s.clone()
        }) {
            Ok(Some(updated)) => updated,
            Ok(None) => return None,
            Err(err) => {
                warn!(schedule_id = %schedule.id, error = %err, "failed to persist schedule");
                return None;
            }
        };

        match &outcome {
            Ok(job) => {
                info!(schedule_id = %schedule.id, job_id = %job.id, "schedule fired");
                self.events.record(
                    EventDraft::new("schedule.fired", format!("schedule {} fired", schedule.id))
                        .field("schedule_id", schedule.id.clone())
                        .field("job_id", job.id.clone())
                        .field("next_fire_at", next.to_rfc3339()),
                );
            }
            Err(err) => {
                warn!(schedule_id = %schedule.id, error = %err, "schedule fire rejected");
                self.events.record(
                    EventDraft::new("schedule.fire_failed", format!("schedule {} could not enqueue", schedule.id))
                        .field("schedule_id", schedule.id.clone())
                        .field("error", err.to_string()),
                );
            }
        }
        if updated.enabled {
            self.heap.lock().push(Reverse((updated.next_fire_at, updated.id.clone())));
        }
        Some(updated)
    }

    /// Scheduler loop: fires due schedules, then sleeps until the next deadline.
    pub async fn run(self: Arc<Self>) {
        info!("Scheduler started");
        let max_idle = StdDuration::from_millis(self.config.max_idle_ms.max(10));
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.fire_due(self.clock.now());

            let sleep_for = self
                .next_deadline()
                .map(|at| (at - self.clock.now()).to_std().unwrap_or(StdDuration::ZERO))
                .unwrap_or(max_idle)
                .min(max_idle);
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = &mut notified => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionSet;
    use crate::clock::ManualClock;
    use crate::queue::JobFilter;
    use crate::queue::test_support::{QueueHarness, harness};

    fn scheduler(clock: Arc<ManualClock>) -> (QueueHarness, Scheduler) {
        let h = harness(clock.clone(), AdmissionSet::new);
        let store = Arc::new(
            KeyedStore::persistent("schedules", h.dir.path().join("schedules.json")).unwrap(),
        );
        let scheduler = Scheduler::new(
            SchedulerConfig::default(),
            clock,
            h.ids.clone(),
            h.events.clone(),
            h.queue.clone(),
            store,
            CancellationToken::new(),
        );
        (h, scheduler)
    }

    fn every(seconds: u64) -> CreateSchedule {
        CreateSchedule {
            config_path: "c.yaml".into(),
            interval_seconds: seconds,
            jitter_seconds: 0,
            enabled: true,
            priority: JobPriority::Low,
        }
    }

    #[test]
    fn next_fire_respects_jitter_bounds_and_minimum() {
        let now = Utc::now();
        for _ in 0..200 {
            let next = compute_next(now, 60, 10);
            assert!(next >= now + Duration::seconds(50));
            assert!(next <= now + Duration::seconds(70));
        }
        for _ in 0..50 {
            assert!(compute_next(now, 1, 5) >= now + Duration::seconds(1));
        }
        assert!(compute_next(now, 0, 0) >= now + Duration::seconds(1));
    }

    #[test]
    fn create_rejects_bad_input() {
        let (_h, s) = scheduler(Arc::new(ManualClock::new(Utc::now())));
        assert!(s.create(every(0)).is_err());
        let mut missing = every(30);
        missing.config_path = "missing.yaml".into();
        assert!(s.create(missing).is_err());
    }

    #[test]
    fn due_schedule_enqueues_once_and_rearms() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (h, s) = scheduler(clock.clone());
        let created = s.create(every(60)).unwrap();

        assert!(s.fire_due(clock.now()).is_empty());
        clock.advance(Duration::seconds(61));
        let fired = s.fire_due(clock.now());
        assert_eq!(fired.len(), 1);
        assert!(fired[0].next_fire_at > created.next_fire_at);
        assert_eq!(fired[0].last_fired_at, Some(clock.now()));

        let jobs = h.queue.list(&JobFilter::default());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].priority, JobPriority::Low);
        assert_eq!(jobs[0].source, format!("schedule:{}", created.id));
        assert!(s.fire_due(clock.now()).is_empty());
    }

    #[test]
    fn disabled_schedule_does_not_fire_until_enabled() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (h, s) = scheduler(clock.clone());
        let created = s.create(every(10)).unwrap();
        s.disable(&created.id).unwrap();

        clock.advance(Duration::seconds(30));
        assert!(s.fire_due(clock.now()).is_empty());

        let enabled = s.enable(&created.id).unwrap();
        assert!(enabled.next_fire_at > clock.now());
        clock.advance(Duration::seconds(11));
        assert_eq!(s.fire_due(clock.now()).len(), 1);
        assert_eq!(h.queue.list(&JobFilter::default()).len(), 1);
        assert!(s.enable("sched-missing").is_err());
    }

    #[test]
    fn rejected_fire_records_the_error_and_keeps_schedule_armed() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (h, s) = scheduler(clock.clone());
        let created = s.create(every(5)).unwrap();
        std::fs::remove_file(h.dir.path().join("c.yaml")).unwrap();

        clock.advance(Duration::seconds(6));
        let fired = s.fire_due(clock.now());
        assert!(fired[0].last_error.is_some());
        assert_eq!(s.next_deadline(), Some(fired[0].next_fire_at));
        assert_eq!(s.get(&created.id).unwrap().last_job_id, None);
    }

    #[test]
    fn schedules_survive_reload() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (h, s) = scheduler(clock.clone());
        let created = s.create(every(60)).unwrap();

        let reloaded: KeyedStore<Schedule> =
            KeyedStore::persistent("schedules", h.dir.path().join("schedules.json")).unwrap();
        assert_eq!(reloaded.get(&created.id), Some(created));
    }
}
