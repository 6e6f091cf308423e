//! Three-priority job queue with a fixed worker pool.
//!
//! Jobs move `queued -> running -> {succeeded, failed, canceled}` and never
//! return to `queued`. Every transition appends a `job.*` event and fires the
//! registered subscriber callbacks.

mod job;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub use job::{EnqueueRequest, Job, JobFilter, JobPriority, JobStatus};

use crate::admission::{AdmissionContext, AdmissionSet, QueueLoad, TenantLoad};
use crate::clock::{Clock, IdGenerator};
use crate::config::QueueConfig;
use crate::error::{ControlError, Result};
use crate::events::{EventDraft, EventStore};
use crate::leases::RunLeases;
use crate::locks::ExecutionLocks;
use crate::runner::{RunRecord, RunStatus, Runner};
use crate::state::StateStore;
use crate::store::RecordSource;

/// Callback fired synchronously on every job transition.
pub type JobCallback = Arc<dyn Fn(&Job) + Send + Sync>;

/// Collaborators the queue drives.
#[derive(Clone)]
pub struct QueueDependencies {
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<IdGenerator>,
    pub events: Arc<EventStore>,
    pub admission: Arc<AdmissionSet>,
    pub locks: Arc<ExecutionLocks>,
    pub leases: Arc<RunLeases>,
    pub runner: Arc<dyn Runner>,
    pub state: Arc<StateStore>,
}

impl fmt::Debug for QueueDependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueDependencies")
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct QueuedCounts {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct QueueStatus {
    pub paused: bool,
    pub accepting: bool,
    pub queued: QueuedCounts,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub canceled: usize,
    pub max_backlog: usize,
    pub max_execution_cost: Option<f64>,
    pub saturated: bool,
    pub workers: usize,
    pub unhealthy_hosts: Vec<String>,
}

struct QueueState {
    jobs: BTreeMap<String, Job>,
    pending: [VecDeque<String>; 3],
    idempotency: HashMap<String, String>,
    not_before: HashMap<String, DateTime<Utc>>,
    skips: HashMap<String, u32>,
    running: HashMap<String, CancellationToken>,
    unhealthy_hosts: HashSet<String>,
    paused: bool,
    accepting: bool,
    saturated: bool,
    max_backlog: usize,
    max_execution_cost: Option<f64>,
}

impl QueueState {
    fn queued_len(&self) -> usize {
        self.pending.iter().map(VecDeque::len).sum()
    }

    fn backlog(&self) -> usize {
        self.queued_len() + self.running.len()
    }

    fn live_by_key(&self, key: &str) -> Option<Job> {
        self.idempotency
            .get(key)
            .and_then(|id| self.jobs.get(id))
            .filter(|job| !job.status.is_terminal())
            .cloned()
    }

    fn remove_pending(&mut self, id: &str) {
        for lane in self.pending.iter_mut() {
            lane.retain(|queued| queued != id);
        }
        self.not_before.remove(id);
        self.skips.remove(id);
    }

    fn active_jobs(&self) -> impl Iterator<Item = &Job> {
        self.pending
            .iter()
            .flatten()
            .chain(self.running.keys())
            .filter_map(|id| self.jobs.get(id))
    }

    fn load(&self) -> QueueLoad {
        let mut tenants: HashMap<String, TenantLoad> = HashMap::new();
        let mut active_placements = Vec::new();
        for job in self.active_jobs() {
            if let Some(tenant) = &job.tenant {
                let load = tenants.entry(tenant.clone()).or_default();
                match job.status {
                    JobStatus::Running => load.running += 1,
                    _ => load.queued += 1,
                }
            }
            if let Some(placement) = &job.placement {
                active_placements.push(placement.clone());
            }
        }
        QueueLoad {
            queued: self.queued_len(),
            running: self.running.len(),
            max_backlog: self.max_backlog,
            tenants,
            active_placements,
        }
    }

    /// Returns the backlog when it has just crossed the saturation mark.
    fn check_saturation(&mut self, threshold: f64) -> Option<usize> {
        let backlog = self.backlog();
        let mark = ((self.max_backlog as f64) * threshold).ceil().max(1.0) as usize;
        if backlog >= mark {
            if !self.saturated {
                self.saturated = true;
                return Some(backlog);
            }
        } else {
            self.saturated = false;
        }
        None
    }
}

pub struct JobQueue {
    config: QueueConfig,
    lock_ttl: Duration,
    lease_ttl: Duration,
    workdir: PathBuf,
    deps: QueueDependencies,
    state: Mutex<QueueState>,
    /// Held from the capacity checks through insertion so load-dependent
    /// gates see every earlier enqueue.
    admitting: Mutex<()>,
    wake: Notify,
    settled: Notify,
    subscribers: Mutex<Vec<(u64, JobCallback)>>,
    next_subscriber: AtomicU64,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("JobQueue");
        debug
            .field("workers", &self.config.workers)
            .field("workdir", &self.workdir);
        if let Some(state) = self.state.try_lock() {
            debug
                .field("queued", &state.queued_len())
                .field("running", &state.running.len())
                .field("paused", &state.paused);
        }
        debug
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

enum CancelAction {
    Done(Job),
    Wait(CancellationToken),
}

impl JobQueue {
    pub fn new(
        config: QueueConfig,
        lock_ttl: Duration,
        lease_ttl: Duration,
        workdir: impl Into<PathBuf>,
        deps: QueueDependencies,
        shutdown: CancellationToken,
    ) -> Self {
        let state = QueueState {
            jobs: BTreeMap::new(),
            pending: Default::default(),
            idempotency: HashMap::new(),
            not_before: HashMap::new(),
            skips: HashMap::new(),
            running: HashMap::new(),
            unhealthy_hosts: HashSet::new(),
            paused: false,
            accepting: true,
            saturated: false,
            max_backlog: config.max_backlog.max(1),
            max_execution_cost: config.max_execution_cost,
        };
        Self {
            config,
            lock_ttl,
            lease_ttl,
            workdir: workdir.into(),
            deps,
            state: Mutex::new(state),
            admitting: Mutex::new(()),
            wake: Notify::new(),
            settled: Notify::new(),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
            shutdown,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Resolves `config_path` against the working directory; the file must exist.
    pub fn resolve_config_path(&self, config_path: &str) -> Result<PathBuf> {
        let trimmed = config_path.trim();
        if trimmed.is_empty() {
            return Err(ControlError::InvalidRequest("config_path is required".into()));
        }
        let candidate = Path::new(trimmed);
        let resolved = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.workdir.join(candidate)
        };
        if resolved.is_file() {
            Ok(resolved)
        } else {
            Err(ControlError::InvalidRequest(format!("config_path not found: {trimmed}")))
        }
    }

    /// Snapshot used by admission gates.
    pub fn admission_context(&self) -> AdmissionContext {
        let load = self.state.lock().load();
        AdmissionContext {
            now: self.deps.clock.now(),
            load,
        }
    }

    #[instrument(skip(self, request), fields(config_path = %request.config_path, priority = %request.priority, source = %request.source))]
    pub fn enqueue(&self, request: EnqueueRequest) -> Result<Job> {
        self.resolve_config_path(&request.config_path)?;
        let key = request.idempotency().map(str::to_owned);
        let admitting = self.admitting.lock();
        let now = self.deps.clock.now();

        let load = {
            let state = self.state.lock();
            if !state.accepting {
                return Err(ControlError::ShuttingDown);
            }
            if let Some(existing) = key.as_deref().and_then(|k| state.live_by_key(k)) {
                debug!(job_id = %existing.id, "idempotency key matched live job");
                return Ok(existing);
            }
            if !request.force {
                let backlog = state.backlog();
                if backlog >= state.max_backlog {
                    return Err(ControlError::backlog_full(backlog, state.max_backlog));
                }
                if let (Some(max), Some(cost)) = (state.max_execution_cost, request.estimated_cost)
                    && cost > max
                {
                    return Err(ControlError::Exhausted(format!(
                        "estimated cost {cost} exceeds max_execution_cost {max}"
                    )));
                }
            }
            state.load()
        };

        let admission_request = request.admission_request();
        let ctx = AdmissionContext { now, load };
        self.deps
            .admission
            .evaluate(&admission_request, &ctx)
            .into_result()?;

        let id = self.deps.ids.next_id("job");
        let lock_key = request
            .lock_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_owned);
        if let Some(lock_key) = &lock_key {
            self.deps.locks.acquire(lock_key, &id, self.lock_ttl)?;
            if let Err(err) = self.deps.locks.bind_job(lock_key, &id) {
                self.deps.locks.release_if_held(lock_key, &id);
                return Err(err);
            }
        }

        let job = Job {
            id: id.clone(),
            config_path: request.config_path.trim().to_string(),
            priority: request.priority,
            status: JobStatus::Queued,
            created_at: now,
            started_at: None,
            ended_at: None,
            idempotency_key: key.clone(),
            attempt: 0,
            last_error: None,
            lock_key: lock_key.clone(),
            host: request.host.clone(),
            tenant: request.tenant.clone(),
            placement: request.placement.clone(),
            estimated_cost: request.estimated_cost,
            force: request.force,
            source: if request.source.is_empty() { "api".into() } else { request.source.clone() },
            run_id: None,
        };

        let inserted = {
            let mut state = self.state.lock();
            if !state.accepting {
                Err(ControlError::ShuttingDown)
            } else if let Some(existing) = key.as_deref().and_then(|k| state.live_by_key(k)) {
                Ok((existing, None, false))
            } else {
                if let Some(key) = &key {
                    state.idempotency.insert(key.clone(), id.clone());
                }
                state.pending[job.priority.index()].push_back(id.clone());
                state.jobs.insert(id.clone(), job.clone());
                let crossed = state.check_saturation(self.config.saturation_threshold);
                Ok((job, crossed, true))
            }
        };
        let (job, crossed, fresh) = match inserted {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Some(lock_key) = &lock_key {
                    self.deps.locks.release_if_held(lock_key, &id);
                }
                return Err(err);
            }
        };
        if !fresh {
            if let Some(lock_key) = &lock_key {
                self.deps.locks.release_if_held(lock_key, &id);
            }
            return Ok(job);
        }

        self.deps.admission.admitted(&admission_request, &ctx);
        drop(admitting);
        debug!(job_id = %job.id, "job queued");
        self.record_transition(&job, format!("job {} queued", job.id));
        if let Some(backlog) = crossed {
            warn!(backlog, max_backlog = self.max_backlog(), "queue saturated");
            self.deps.events.record(
                EventDraft::new("queue.saturation", format!("queue backlog reached {backlog}"))
                    .field("backlog", backlog as u64)
                    .field("max_backlog", self.max_backlog() as u64)
                    .field("threshold", self.config.saturation_threshold),
            );
        }
        self.notify_subscribers(&job);
        self.wake.notify_one();
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.state.lock().jobs.get(id).cloned()
    }

    /// Jobs in creation order; `limit` keeps the most recent.
    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let state = self.state.lock();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| filter.status.is_none_or(|s| job.status == s))
            .filter(|job| filter.priority.is_none_or(|p| job.priority == p))
            .cloned()
            .collect();
        drop(state);
        if let Some(limit) = filter.limit
            && jobs.len() > limit
        {
            jobs.drain(..jobs.len() - limit);
        }
        jobs
    }

    /// Cancels a queued job at once; a running job is signalled and given
    /// `cancel_grace_ms` to stop before it is marked canceled anyway.
    pub async fn cancel(&self, id: &str) -> Result<Job> {
        let action = {
            let mut state = self.state.lock();
            let Some(status) = state.jobs.get(id).map(|job| job.status) else {
                return Err(ControlError::NotFound(format!("job {id}")));
            };
            match status {
                JobStatus::Queued => {
                    state.remove_pending(id);
                    let now = self.deps.clock.now();
                    let Some(job) = state.jobs.get_mut(id) else {
                        return Err(ControlError::NotFound(format!("job {id}")));
                    };
                    job.status = JobStatus::Canceled;
                    job.ended_at = Some(now);
                    job.last_error = Some("canceled".into());
                    CancelAction::Done(job.clone())
                }
                JobStatus::Running => match state.running.get(id) {
                    Some(token) => CancelAction::Wait(token.clone()),
                    None => {
                        return Err(ControlError::Internal(format!("running job {id} has no cancel token")));
                    }
                },
                terminal => {
                    return Err(ControlError::InvalidRequest(format!(
                        "job {id} is already {terminal}"
                    )));
                }
            }
        };

        match action {
            CancelAction::Done(job) => {
                info!(job_id = %id, "queued job canceled");
                self.finish(&job);
                Ok(job)
            }
            CancelAction::Wait(token) => {
                info!(job_id = %id, "canceling running job");
                token.cancel();
                let grace = StdDuration::from_millis(self.config.cancel_grace_ms);
                if let Some(job) = self.wait_terminal(id, grace).await {
                    return Ok(job);
                }
                warn!(job_id = %id, "job did not stop within grace period");
                self.force_terminal(id, JobStatus::Canceled, "canceled (grace period expired)")
                    .or_else(|| self.get(id))
                    .ok_or_else(|| ControlError::NotFound(format!("job {id}")))
            }
        }
    }

    async fn wait_terminal(&self, id: &str, grace: StdDuration) -> Option<Job> {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(job) = self.get(id)
                && job.status.is_terminal()
            {
                return Some(job);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Moves a non-terminal job straight to `status`, cancelling its runner
    /// if it is running. Returns `None` when the job was already terminal.
    fn force_terminal(&self, id: &str, status: JobStatus, reason: &str) -> Option<Job> {
        let job = {
            let mut state = self.state.lock();
            let current = state.jobs.get(id)?.status;
            if current.is_terminal() {
                return None;
            }
            if current == JobStatus::Queued {
                state.remove_pending(id);
            }
            if let Some(token) = state.running.remove(id) {
                token.cancel();
            }
            let now = self.deps.clock.now();
            let job = state.jobs.get_mut(id)?;
            job.status = status;
            job.ended_at = Some(now);
            job.last_error = Some(reason.to_string());
            job.clone()
        };
        self.finish(&job);
        Some(job)
    }

    /// Fails a queued or running job with `reason`; terminal jobs are returned
    /// unchanged.
    pub fn fail_job(&self, id: &str, reason: &str) -> Result<Job> {
        if let Some(job) = self.force_terminal(id, JobStatus::Failed, reason) {
            warn!(job_id = %id, %reason, "job failed");
            return Ok(job);
        }
        self.get(id)
            .ok_or_else(|| ControlError::NotFound(format!("job {id}")))
    }

    /// Fails running jobs older than `max_age` whose lease has no fresh heartbeat.
    pub fn recover_stuck(&self, max_age: Duration) -> Vec<Job> {
        let now = self.deps.clock.now();
        let candidates: Vec<String> = {
            let state = self.state.lock();
            state
                .running
                .keys()
                .filter_map(|id| state.jobs.get(id))
                .filter(|job| job.started_at.is_some_and(|started| started < now - max_age))
                .map(|job| job.id.clone())
                .collect()
        };
        let recovered: Vec<Job> = candidates
            .into_iter()
            .filter(|id| !self.deps.leases.has_fresh_heartbeat(id, now))
            .filter_map(|id| self.force_terminal(&id, JobStatus::Failed, "stuck job recovered"))
            .collect();
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "recovered stuck jobs");
        }
        recovered
    }

    pub fn pause(&self) -> QueueStatus {
        self.state.lock().paused = true;
        info!("queue paused");
        self.deps
            .events
            .record(EventDraft::new("queue.paused", "queue paused"));
        self.status()
    }

    pub fn resume(&self) -> QueueStatus {
        self.state.lock().paused = false;
        info!("queue resumed");
        self.deps
            .events
            .record(EventDraft::new("queue.resumed", "queue resumed"));
        self.wake.notify_waiters();
        for _ in 0..self.config.workers {
            self.wake.notify_one();
        }
        self.status()
    }

    pub fn set_capacity(&self, max_backlog: usize, max_execution_cost: Option<f64>) -> Result<QueueStatus> {
        if max_backlog == 0 {
            return Err(ControlError::InvalidRequest("max_backlog must be at least 1".into()));
        }
        if max_execution_cost.is_some_and(|c| c <= 0.0) {
            return Err(ControlError::InvalidRequest("max_execution_cost must be positive".into()));
        }
        {
            let mut state = self.state.lock();
            state.max_backlog = max_backlog;
            state.max_execution_cost = max_execution_cost;
            state.check_saturation(self.config.saturation_threshold);
        }
        info!(max_backlog, ?max_execution_cost, "queue capacity updated");
        self.deps.events.record(
            EventDraft::new("queue.capacity_changed", format!("max_backlog set to {max_backlog}"))
                .field("max_backlog", max_backlog as u64)
                .field_opt("max_execution_cost", max_execution_cost),
        );
        Ok(self.status())
    }

    pub fn set_host_health(&self, host: &str, healthy: bool) -> Result<QueueStatus> {
        let host = host.trim();
        if host.is_empty() {
            return Err(ControlError::InvalidRequest("host is required".into()));
        }
        {
            let mut state = self.state.lock();
            if healthy {
                state.unhealthy_hosts.remove(host);
            } else {
                state.unhealthy_hosts.insert(host.to_string());
            }
        }
        info!(host, healthy, "host health updated");
        self.deps.events.record(
            EventDraft::new("queue.host_health", format!("host {host} marked {}", if healthy { "healthy" } else { "unhealthy" }))
                .field("host", host)
                .field("healthy", healthy),
        );
        self.wake.notify_one();
        Ok(self.status())
    }

    pub fn max_backlog(&self) -> usize {
        self.state.lock().max_backlog
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.state.lock();
        let mut status = QueueStatus {
            paused: state.paused,
            accepting: state.accepting,
            queued: QueuedCounts {
                high: state.pending[0].len(),
                normal: state.pending[1].len(),
                low: state.pending[2].len(),
            },
            running: state.running.len(),
            succeeded: 0,
            failed: 0,
            canceled: 0,
            max_backlog: state.max_backlog,
            max_execution_cost: state.max_execution_cost,
            saturated: state.saturated,
            workers: self.config.workers,
            unhealthy_hosts: state.unhealthy_hosts.iter().cloned().collect(),
        };
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Succeeded => status.succeeded += 1,
                JobStatus::Failed => status.failed += 1,
                JobStatus::Canceled => status.canceled += 1,
                _ => {}
            }
        }
        status.unhealthy_hosts.sort();
        status
    }

    pub fn subscribe(&self, callback: JobCallback) -> u64 {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().push((id, callback));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|(sid, _)| *sid != id);
    }

    fn notify_subscribers(&self, job: &Job) {
        let subscribers = self.subscribers.lock().clone();
        if subscribers.is_empty() {
            return;
        }
        let budget = StdDuration::from_millis(self.config.subscriber_timeout_ms);
        let mut dropped = Vec::new();
        for (id, callback) in subscribers {
            let started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(job)));
            let elapsed = started.elapsed();
            if outcome.is_err() {
                dropped.push((id, "panicked".to_string()));
            } else if elapsed > budget {
                dropped.push((id, format!("blocked for {}ms", elapsed.as_millis())));
            }
        }
        for (id, reason) in dropped {
            self.unsubscribe(id);
            warn!(subscriber_id = id, %reason, "dropping queue subscriber");
            self.deps.events.record(
                EventDraft::new("queue.subscriber_dropped", format!("queue subscriber {id} {reason}"))
                    .field("subscriber_id", id)
                    .field("reason", reason)
                    .field("job_id", job.id.clone()),
            );
        }
    }

    fn record_transition(&self, job: &Job, message: String) {
        self.deps.events.record(
            EventDraft::new(format!("job.{}", job.status), message)
                .field("job_id", job.id.clone())
                .field("config_path", job.config_path.clone())
                .field("priority", job.priority.as_str())
                .field("status", job.status.as_str())
                .field("source", job.source.clone())
                .field("attempt", job.attempt)
                .field_opt("run_id", job.run_id.clone())
                .field_opt("error", job.last_error.clone()),
        );
    }

    /// Side effects of entering a terminal status.
    fn finish(&self, job: &Job) {
        if let Some(lock_key) = &job.lock_key {
            self.deps.locks.release_if_held(lock_key, &job.id);
        }
        {
            let mut state = self.state.lock();
            state.check_saturation(self.config.saturation_threshold);
        }
        self.record_transition(job, format!("job {} {}", job.id, job.status));
        self.notify_subscribers(job);
        self.settled.notify_waiters();
    }

    /// Picks the next eligible job: strict priority, FIFO within a band.
    fn take_next(&self) -> Option<(Job, CancellationToken)> {
        let now = self.deps.clock.now();
        let mut failed = Vec::new();
        let picked = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.paused || !state.accepting {
                return None;
            }
            let mut picked = None;
            'lanes: for priority in JobPriority::ALL {
                let lane = priority.index();
                let visits = state.pending[lane].len();
                for _ in 0..visits {
                    let Some(id) = state.pending[lane].pop_front() else {
                        break;
                    };
                    let Some(job) = state.jobs.get_mut(&id) else {
                        continue;
                    };
                    if job.status != JobStatus::Queued {
                        continue;
                    }
                    if state.not_before.get(&id).is_some_and(|at| *at > now) {
                        state.pending[lane].push_back(id);
                        continue;
                    }
                    if let Some(host) = &job.host
                        && state.unhealthy_hosts.contains(host)
                    {
                        let skips = state.skips.entry(id.clone()).or_insert(0);
                        *skips += 1;
                        if *skips > self.config.host_unhealthy_max_skips {
                            job.status = JobStatus::Failed;
                            job.ended_at = Some(now);
                            job.last_error = Some("host unhealthy".into());
                            failed.push(job.clone());
                            state.skips.remove(&id);
                            state.not_before.remove(&id);
                        } else {
                            debug!(job_id = %id, host = %host, skips = *skips, "deferring job on unhealthy host");
                            state.not_before.insert(
                                id.clone(),
                                now + Duration::milliseconds(self.config.host_backoff_ms as i64),
                            );
                            state.pending[lane].push_back(id);
                        }
                        continue;
                    }

                    job.status = JobStatus::Running;
                    job.started_at = Some(now);
                    job.attempt += 1;
                    let token = self.shutdown.child_token();
                    let job = job.clone();
                    state.not_before.remove(&id);
                    state.skips.remove(&id);
                    state.running.insert(id, token.clone());
                    picked = Some((job, token));
                    break 'lanes;
                }
            }
            picked
        };

        for job in &failed {
            warn!(job_id = %job.id, "job failed after repeated unhealthy-host skips");
            self.finish(job);
        }
        if let Some((job, _)) = &picked {
            debug!(job_id = %job.id, priority = %job.priority, "job started");
            self.record_transition(job, format!("job {} started", job.id));
            self.notify_subscribers(job);
        }
        picked
    }

    /// Records the runner's outcome unless the job already went terminal
    /// through cancellation or recovery.
    fn complete(&self, id: &str, record: &RunRecord) {
        let finished = {
            let mut state = self.state.lock();
            state.running.remove(id);
            let now = self.deps.clock.now();
            match state.jobs.get_mut(id) {
                Some(job) if !job.status.is_terminal() => {
                    job.status = match record.status {
                        RunStatus::Succeeded => JobStatus::Succeeded,
                        RunStatus::Failed => JobStatus::Failed,
                        RunStatus::Canceled => JobStatus::Canceled,
                    };
                    job.ended_at = Some(now);
                    job.run_id = Some(record.id.clone());
                    job.last_error = record.error.clone();
                    Some(job.clone())
                }
                Some(job) => {
                    job.run_id = Some(record.id.clone());
                    None
                }
                None => None,
            }
        };
        if let Some(job) = finished {
            self.finish(&job);
        }
    }

    fn spawn_heartbeat(&self, lease_id: String, holder: String, stop: CancellationToken) -> JoinHandle<()> {
        let leases = Arc::clone(&self.deps.leases);
        let interval = (self.lease_ttl.to_std().unwrap_or(StdDuration::from_secs(30)) / 2)
            .max(StdDuration::from_millis(500));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = leases.heartbeat(&lease_id, &holder) {
                            tracing::trace!(lease_id = %lease_id, error = %err, "lease heartbeat stopped");
                            break;
                        }
                    }
                }
            }
        })
    }

    #[instrument(skip(self, job, token), fields(job_id = %job.id, worker = %worker_id))]
    async fn execute(&self, worker_id: &str, job: Job, token: CancellationToken) {
        let lease = match self.deps.leases.acquire(&job.id, worker_id, self.lease_ttl) {
            Ok(lease) => Some(lease),
            Err(err) => {
                warn!(error = %err, "running job without a run lease");
                None
            }
        };
        let heartbeat_stop = CancellationToken::new();
        let heartbeat = lease
            .as_ref()
            .map(|l| self.spawn_heartbeat(l.lease_id.clone(), worker_id.to_string(), heartbeat_stop.clone()));

        let record = self.deps.runner.run(token.clone(), &job).await;

        heartbeat_stop.cancel();
        if let Some(handle) = heartbeat {
            let _ = handle.await;
        }
        if let Some(lease) = &lease
            && let Err(err) = self.deps.leases.release(&lease.lease_id, worker_id)
        {
            debug!(error = %err, "run lease already settled");
        }

        let state = Arc::clone(&self.deps.state);
        let persisted = record.clone();
        match tokio::task::spawn_blocking(move || state.save_run(&persisted)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(run_id = %record.id, error = %err, "failed to persist run record"),
            Err(err) => error!(run_id = %record.id, error = %err, "run persistence task failed"),
        }

        self.complete(&job.id, &record);
    }

    async fn worker_loop(self: Arc<Self>, worker_id: String) {
        info!("Worker {} started", worker_id);
        let idle = StdDuration::from_millis(self.config.idle_poll_ms.max(10));
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shutdown.is_cancelled() {
                break;
            }
            match self.take_next() {
                Some((job, token)) => self.execute(&worker_id, job, token).await,
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(idle) => {}
                    }
                }
            }
        }
        info!("Worker {} shutting down", worker_id);
    }

    /// Spawns the worker pool; calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        for n in 0..self.config.workers.max(1) {
            let queue = Arc::clone(self);
            workers.push(tokio::spawn(queue.worker_loop(format!("worker-{n}"))));
        }
        info!(workers = workers.len(), "queue worker pool started");
    }

    /// Stops intake, cancels running jobs and waits up to `grace` for the
    /// workers. Jobs still non-terminal afterwards are marked canceled.
    /// Returns `false` when a worker had to be aborted.
    pub async fn shutdown(&self, grace: StdDuration) -> bool {
        info!("Initiating graceful shutdown of job queue");
        self.state.lock().accepting = false;
        self.shutdown.cancel();
        self.wake.notify_waiters();

        let handles = std::mem::take(&mut *self.workers.lock());
        let deadline = tokio::time::Instant::now() + grace;
        let mut clean = true;
        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("Worker task failed: {:?}", err),
                Err(_) => {
                    warn!("Worker task timed out during shutdown");
                    handle.abort();
                    clean = false;
                }
            }
        }

        let leftovers: Vec<String> = {
            let state = self.state.lock();
            state
                .jobs
                .values()
                .filter(|job| !job.status.is_terminal())
                .map(|job| job.id.clone())
                .collect()
        };
        for id in leftovers {
            self.force_terminal(&id, JobStatus::Canceled, "control plane shutdown");
        }
        info!(clean, "Job queue shutdown complete");
        clean
    }
}

impl RecordSource for JobQueue {
    fn list_records(&self) -> Vec<Map<String, Value>> {
        self.list(&JobFilter::default())
            .into_iter()
            .filter_map(|job| match serde_json::to_value(job) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
mod tests;
