//! Root object owning every control-plane component.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::{
    AdmissionSet, CostSchedulingGate, EmergencyStopGate, FreezeGate, MaintenanceGate,
    TenantLimitsGate, TopologyGate,
};
use crate::clock::{Clock, IdGenerator, SystemClock};
use crate::config::ControlPlaneConfig;
use crate::error::Result;
use crate::events::EventStore;
use crate::leases::{RunLease, RunLeases};
use crate::locks::ExecutionLocks;
use crate::query::QueryFacade;
use crate::queue::{Job, JobQueue, QueueDependencies};
use crate::rules::{Rule, RuleEngine};
use crate::runner::{ConfigRunner, Runner};
use crate::scheduler::{Schedule, Scheduler};
use crate::state::StateStore;
use crate::store::{KeyedStore, RecordSource};
use crate::triggers::{TriggerIngress, TriggerRecord};

/// Failure reason given to jobs whose run lease went stale.
pub const STALE_LEASE_REASON: &str = "stale run lease recovered";

pub struct ControlPlaneBuilder {
    config: ControlPlaneConfig,
    state_dir: PathBuf,
    workdir: PathBuf,
    clock: Option<Arc<dyn Clock>>,
    runner: Option<Arc<dyn Runner>>,
}

impl fmt::Debug for ControlPlaneBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlPlaneBuilder")
            .field("state_dir", &self.state_dir)
            .field("workdir", &self.workdir)
            .field("custom_runner", &self.runner.is_some())
            .finish_non_exhaustive()
    }
}

impl ControlPlaneBuilder {
    pub fn new(config: ControlPlaneConfig, state_dir: impl Into<PathBuf>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            state_dir: state_dir.into(),
            workdir: workdir.into(),
            clock: None,
            runner: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replaces the default [`ConfigRunner`].
    pub fn with_runner(mut self, runner: Arc<dyn Runner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Wires every component and loads persisted snapshots. Nothing is
    /// spawned until [`ControlPlane::start`].
    pub fn build(self) -> Result<Arc<ControlPlane>> {
        let config = self.config;
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let state = Arc::new(StateStore::open(&self.state_dir)?);
        std::fs::create_dir_all(&self.workdir)?;
        let schedule_store = Arc::new(KeyedStore::<Schedule>::persistent(
            "schedules",
            state.snapshot_path("schedules.json"),
        )?);
        let rule_store = Arc::new(KeyedStore::<Rule>::persistent(
            "rules",
            state.snapshot_path("rules.json"),
        )?);
        let trigger_store = Arc::new(KeyedStore::<TriggerRecord>::persistent(
            "triggers",
            state.snapshot_path("triggers.json"),
        )?);

        let ids = Arc::new(IdGenerator::new());
        for id in schedule_store
            .keys()
            .into_iter()
            .chain(rule_store.keys())
            .chain(trigger_store.keys())
        {
            ids.observe(&id);
        }
        let events = Arc::new(EventStore::new(config.events, clock.clone(), ids.clone()));

        let emergency_stop = Arc::new(EmergencyStopGate::new(
            config.admission.allow_force_during_stop,
            clock.clone(),
            events.clone(),
        ));
        let freeze = Arc::new(FreezeGate::new(
            config.admission.allow_force_during_freeze,
            clock.clone(),
            events.clone(),
        ));
        let maintenance = Arc::new(MaintenanceGate::new(
            Arc::new(KeyedStore::persistent("maintenance", state.snapshot_path("maintenance.json"))?),
            clock.clone(),
            events.clone(),
        ));
        let tenant_limits = Arc::new(TenantLimitsGate::new());
        let cost = Arc::new(CostSchedulingGate::new());
        let topology = Arc::new(TopologyGate::new());
        let admission = Arc::new(
            AdmissionSet::new(events.clone())
                .with_gate(emergency_stop.clone())
                .with_gate(freeze.clone())
                .with_gate(maintenance.clone())
                .with_gate(tenant_limits.clone())
                .with_gate(cost.clone())
                .with_gate(topology.clone()),
        );

        let locks = Arc::new(ExecutionLocks::new(clock.clone(), events.clone()));
        let leases = Arc::new(RunLeases::new(clock.clone(), ids.clone(), events.clone()));
        let runner = self.runner.unwrap_or_else(|| {
            Arc::new(ConfigRunner::new(
                self.workdir.clone(),
                clock.clone(),
                ids.clone(),
                events.clone(),
            ))
        });

        let shutdown = CancellationToken::new();
        let queue = Arc::new(JobQueue::new(
            config.queue.clone(),
            Duration::seconds(config.locks.job_lock_ttl_secs.max(1)),
            Duration::seconds(config.leases.lease_ttl_secs.max(1)),
            self.workdir.clone(),
            QueueDependencies {
                clock: clock.clone(),
                ids: ids.clone(),
                events: events.clone(),
                admission: admission.clone(),
                locks: locks.clone(),
                leases: leases.clone(),
                runner,
                state: state.clone(),
            },
            shutdown.child_token(),
        ));

        let scheduler = Arc::new(Scheduler::new(
            config.scheduler,
            clock.clone(),
            ids.clone(),
            events.clone(),
            queue.clone(),
            schedule_store,
            shutdown.child_token(),
        ));
        let rules = Arc::new(RuleEngine::new(
            config.rules,
            clock.clone(),
            ids.clone(),
            events.clone(),
            queue.clone(),
            rule_store,
            shutdown.child_token(),
        ));
        let triggers = Arc::new(TriggerIngress::new(
            clock.clone(),
            ids.clone(),
            events.clone(),
            admission.clone(),
            queue.clone(),
            trigger_store,
        ));

        let query = Arc::new(QueryFacade::new());
        let sources: [(&str, Arc<dyn RecordSource>); 9] = [
            ("jobs", queue.clone()),
            ("events", events.clone()),
            ("schedules", scheduler.store()),
            ("rules", rules.store()),
            ("triggers", triggers.store()),
            ("maintenance", maintenance.store()),
            ("locks", locks.clone()),
            ("leases", leases.clone()),
            ("runs", state.clone()),
        ];
        for (entity, source) in sources {
            query.register(entity, source);
        }

        info!(
            state_dir = %self.state_dir.display(),
            workdir = %self.workdir.display(),
            workers = config.queue.workers,
            gates = ?admission.gate_names(),
            "control plane assembled"
        );

        Ok(Arc::new(ControlPlane {
            config,
            workdir: self.workdir,
            clock,
            ids,
            events,
            state,
            emergency_stop,
            freeze,
            maintenance,
            tenant_limits,
            cost,
            topology,
            admission,
            locks,
            leases,
            queue,
            scheduler,
            rules,
            triggers,
            query,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

pub struct ControlPlane {
    config: ControlPlaneConfig,
    workdir: PathBuf,
    clock: Arc<dyn Clock>,
    ids: Arc<IdGenerator>,
    events: Arc<EventStore>,
    state: Arc<StateStore>,
    emergency_stop: Arc<EmergencyStopGate>,
    freeze: Arc<FreezeGate>,
    maintenance: Arc<MaintenanceGate>,
    tenant_limits: Arc<TenantLimitsGate>,
    cost: Arc<CostSchedulingGate>,
    topology: Arc<TopologyGate>,
    admission: Arc<AdmissionSet>,
    locks: Arc<ExecutionLocks>,
    leases: Arc<RunLeases>,
    queue: Arc<JobQueue>,
    scheduler: Arc<Scheduler>,
    rules: Arc<RuleEngine>,
    triggers: Arc<TriggerIngress>,
    query: Arc<QueryFacade>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ControlPlane");
        debug
            .field("workdir", &self.workdir)
            .field("queue", &self.queue)
            .field("events", &self.events);
        if let Some(tasks) = self.tasks.try_lock() {
            debug.field("background_tasks", &tasks.len());
        }
        debug
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ControlPlane {
    pub fn builder(
        config: ControlPlaneConfig,
        state_dir: impl Into<PathBuf>,
        workdir: impl Into<PathBuf>,
    ) -> ControlPlaneBuilder {
        ControlPlaneBuilder::new(config, state_dir, workdir)
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn ids(&self) -> &Arc<IdGenerator> {
        &self.ids
    }

    pub fn events(&self) -> &Arc<EventStore> {
        &self.events
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn emergency_stop(&self) -> &Arc<EmergencyStopGate> {
        &self.emergency_stop
    }

    pub fn freeze(&self) -> &Arc<FreezeGate> {
        &self.freeze
    }

    pub fn maintenance(&self) -> &Arc<MaintenanceGate> {
        &self.maintenance
    }

    pub fn tenant_limits(&self) -> &Arc<TenantLimitsGate> {
        &self.tenant_limits
    }

    pub fn cost(&self) -> &Arc<CostSchedulingGate> {
        &self.cost
    }

    pub fn topology(&self) -> &Arc<TopologyGate> {
        &self.topology
    }

    pub fn admission(&self) -> &Arc<AdmissionSet> {
        &self.admission
    }

    pub fn locks(&self) -> &Arc<ExecutionLocks> {
        &self.locks
    }

    pub fn leases(&self) -> &Arc<RunLeases> {
        &self.leases
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn rules(&self) -> &Arc<RuleEngine> {
        &self.rules
    }

    pub fn triggers(&self) -> &Arc<TriggerIngress> {
        &self.triggers
    }

    pub fn query(&self) -> &Arc<QueryFacade> {
        &self.query
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Recovers expired run leases and fails the jobs they were guarding.
    pub fn recover_run_leases(&self, now: DateTime<Utc>) -> Vec<RunLease> {
        let recovered = self.leases.recover_expired(now);
        for lease in &recovered {
            match self.queue.fail_job(&lease.job_id, STALE_LEASE_REASON) {
                Ok(job) => debug!(job_id = %job.id, status = %job.status, "lease recovery settled job"),
                Err(err) => debug!(job_id = %lease.job_id, error = %err, "recovered lease has no queued job"),
            }
        }
        recovered
    }

    /// Fails running jobs older than `max_age` that stopped heartbeating.
    pub fn recover_stuck(&self, max_age: Duration) -> Vec<Job> {
        self.queue.recover_stuck(max_age)
    }

    /// Spawns the worker pool, scheduler, rule engine and housekeeper.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        self.queue.start();
        tasks.push(tokio::spawn(Arc::clone(&self.scheduler).run()));
        tasks.push(tokio::spawn(Arc::clone(&self.rules).run()));
        tasks.push(tokio::spawn(Arc::clone(self).housekeeper()));
        info!("control plane started");
    }

    async fn housekeeper(self: Arc<Self>) {
        let interval = StdDuration::from_millis(self.config.leases.housekeeper_interval_ms.max(100));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    let recovered = self.recover_run_leases(self.clock.now());
                    let reaped = self.locks.cleanup();
                    if !recovered.is_empty() || reaped > 0 {
                        info!(recovered = recovered.len(), reaped, "housekeeping pass");
                    }
                }
            }
        }
        debug!("housekeeper stopped");
    }

    /// Drains the queue, stops background tasks and closes the event log.
    /// The queue drain and the background tasks each get their own `grace`
    /// window. Returns `false` if anything had to be aborted.
    pub async fn shutdown(&self, grace: StdDuration) -> bool {
        info!("Initiating graceful shutdown of control plane");
        let drained = self.queue.shutdown(grace).await;
        self.shutdown.cancel();

        let handles = std::mem::take(&mut *self.tasks.lock());
        let stopped = join_within(handles, grace).await;

        self.events.close();
        let clean = drained && stopped;
        info!(clean, "Control plane shutdown complete");
        clean
    }
}

/// Awaits every handle until `timeout` elapses, aborting the stragglers.
async fn join_within(handles: Vec<JoinHandle<()>>, timeout: StdDuration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut clean = true;
    for mut handle in handles {
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("Background task failed: {:?}", err),
            Err(_) => {
                warn!("Background task timed out during shutdown");
                handle.abort();
                clean = false;
            }
        }
    }
    clean
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{EnqueueRequest, JobFilter, JobStatus};
    use tempfile::TempDir;

    fn plane(dir: &TempDir) -> Arc<ControlPlane> {
        std::fs::create_dir_all(dir.path().join("work")).unwrap();
        std::fs::write(
            dir.path().join("work/c.yaml"),
            "resources:\n  - id: motd\n    type: file\n    path: motd\n    content: hello\n",
        )
        .unwrap();
        ControlPlane::builder(
            ControlPlaneConfig::default(),
            dir.path().join("state"),
            dir.path().join("work"),
        )
        .build()
        .unwrap()
    }

    #[test]
    fn every_store_is_queryable() {
        let dir = TempDir::new().unwrap();
        let plane = plane(&dir);
        assert_eq!(
            plane.query().entities(),
            ["events", "jobs", "leases", "locks", "maintenance", "rules", "runs", "schedules", "triggers"]
        );
        assert_eq!(
            plane.admission().gate_names(),
            ["emergency_stop", "freeze", "maintenance", "tenant_limits", "cost_scheduling", "topology_placement"]
        );
    }

    #[test]
    fn reopened_plane_lists_new_triggers_after_old_ones() {
        use crate::triggers::TriggerRequest;

        let dir = TempDir::new().unwrap();
        let ingest = |plane: &ControlPlane, event_id: &str| {
            plane
                .triggers()
                .ingest(TriggerRequest {
                    source: "git".into(),
                    event_type: "push".into(),
                    event_id: Some(event_id.into()),
                    ..Default::default()
                })
                .unwrap();
        };
        {
            let first = plane(&dir);
            for n in 0..3 {
                ingest(&*first, &format!("old-{n}"));
            }
        }
        let reopened = plane(&dir);
        ingest(&*reopened, "new-0");

        let order: Vec<String> = reopened
            .triggers()
            .list(0, 10)
            .items
            .into_iter()
            .filter_map(|record| record.event_id)
            .collect();
        assert_eq!(order, ["old-0", "old-1", "old-2", "new-0"]);
    }

    #[tokio::test]
    async fn background_tasks_get_their_own_stop_window() {
        let prompt = tokio::spawn(tokio::time::sleep(StdDuration::from_millis(20)));
        assert!(join_within(vec![prompt], StdDuration::from_millis(500)).await);

        let stuck = tokio::spawn(std::future::pending::<()>());
        assert!(!join_within(vec![stuck], StdDuration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn slow_drain_does_not_cut_background_tasks_short() {
        #[derive(Debug)]
        struct SlowRunner;

        #[async_trait::async_trait]
        impl Runner for SlowRunner {
            async fn run(&self, _ctx: CancellationToken, job: &Job) -> crate::runner::RunRecord {
                tokio::time::sleep(StdDuration::from_millis(250)).await;
                crate::runner::RunRecord {
                    id: format!("run-{}", job.id),
                    job_id: Some(job.id.clone()),
                    config_path: job.config_path.clone(),
                    started_at: Utc::now(),
                    ended_at: Utc::now(),
                    status: crate::runner::RunStatus::Canceled,
                    results: Vec::new(),
                    error: None,
                }
            }
        }

        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("c.yaml"), "resources: []\n").unwrap();
        let plane = ControlPlane::builder(
            ControlPlaneConfig::default(),
            dir.path().join("state"),
            dir.path(),
        )
        .with_runner(Arc::new(SlowRunner))
        .build()
        .unwrap();
        plane.start();
        let job = plane.queue().enqueue(EnqueueRequest::new("c.yaml")).unwrap();
        for _ in 0..100 {
            if plane.queue().get(&job.id).unwrap().status == JobStatus::Running {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }

        assert!(plane.shutdown(StdDuration::from_secs(1)).await);
    }

    #[test]
    fn stale_lease_recovery_fails_the_bound_job() {
        let dir = TempDir::new().unwrap();
        let plane = plane(&dir);
        let job = plane.queue().enqueue(EnqueueRequest::new("c.yaml")).unwrap();
        plane
            .leases()
            .acquire(&job.id, "worker-x", Duration::seconds(1))
            .unwrap();

        let later = plane.clock().now() + Duration::seconds(5);
        assert_eq!(plane.recover_run_leases(later).len(), 1);
        assert!(plane.recover_run_leases(later).is_empty());

        let failed = plane.queue().get(&job.id).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some(STALE_LEASE_REASON));
    }

    #[tokio::test]
    async fn start_runs_jobs_and_shutdown_is_clean() {
        let dir = TempDir::new().unwrap();
        let plane = plane(&dir);
        plane.start();
        let job = plane.queue().enqueue(EnqueueRequest::new("c.yaml")).unwrap();

        let mut status = JobStatus::Queued;
        for _ in 0..200 {
            status = plane.queue().get(&job.id).unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(25)).await;
        }
        assert_eq!(status, JobStatus::Succeeded);
        assert_eq!(std::fs::read_to_string(dir.path().join("work/motd")).unwrap(), "hello");
        assert_eq!(plane.state().list_runs(10).unwrap().len(), 1);

        assert!(plane.shutdown(StdDuration::from_secs(5)).await);
        assert!(plane.events().is_closed());
        assert!(plane
            .queue()
            .list(&JobFilter::default())
            .iter()
            .all(|j| j.status.is_terminal()));
    }

    #[test]
    fn snapshots_reload_on_rebuild() {
        let dir = TempDir::new().unwrap();
        let schedule_id = {
            let plane = plane(&dir);
            plane
                .scheduler()
                .create(serde_json::from_value(serde_json::json!({
                    "config_path": "c.yaml",
                    "interval_seconds": 300
                })).unwrap())
                .unwrap()
                .id
        };
        let plane = plane(&dir);
        assert!(plane.scheduler().get(&schedule_id).is_ok());
    }
}
