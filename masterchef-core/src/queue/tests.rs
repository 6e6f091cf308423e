use std::time::Duration as StdDuration;

use async_trait::async_trait;
use tempfile::TempDir;

use super::*;
use crate::clock::{ManualClock, SystemClock};
use crate::config::EventStoreConfig;
use crate::error::ErrorKind;
use crate::events::EventQuery;

#[derive(Debug, Default)]
struct ScriptedRunner {
    block_until_canceled: bool,
    runs: Mutex<Vec<String>>,
}

#[async_trait]
impl Runner for ScriptedRunner {
    async fn run(&self, ctx: CancellationToken, job: &Job) -> RunRecord {
        self.runs.lock().push(job.id.clone());
        let started_at = Utc::now();
        let status = if self.block_until_canceled {
            ctx.cancelled().await;
            RunStatus::Canceled
        } else {
            RunStatus::Succeeded
        };
        RunRecord {
            id: format!("run-{}", job.id),
            job_id: Some(job.id.clone()),
            config_path: job.config_path.clone(),
            started_at,
            ended_at: Utc::now(),
            status,
            results: Vec::new(),
            error: None,
        }
    }
}

struct Fixture {
    _dir: TempDir,
    queue: Arc<JobQueue>,
    events: Arc<EventStore>,
    leases: Arc<RunLeases>,
    locks: Arc<ExecutionLocks>,
    state: Arc<StateStore>,
    runner: Arc<ScriptedRunner>,
}

fn fixture_with(config: QueueConfig, runner: ScriptedRunner, clock: Arc<dyn Clock>) -> Fixture {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("c.yaml"), "resources: []\n").unwrap();
    let ids = Arc::new(IdGenerator::new());
    let events = Arc::new(EventStore::new(EventStoreConfig::default(), clock.clone(), ids.clone()));
    let locks = Arc::new(ExecutionLocks::new(clock.clone(), events.clone()));
    let leases = Arc::new(RunLeases::new(clock.clone(), ids.clone(), events.clone()));
    let state = Arc::new(StateStore::open(dir.path().join("state")).unwrap());
    let runner = Arc::new(runner);
    let deps = QueueDependencies {
        clock,
        ids,
        events: events.clone(),
        admission: Arc::new(AdmissionSet::new(events.clone())),
        locks: locks.clone(),
        leases: leases.clone(),
        runner: runner.clone(),
        state: state.clone(),
    };
    let queue = Arc::new(JobQueue::new(
        config,
        Duration::hours(1),
        Duration::seconds(30),
        dir.path(),
        deps,
        CancellationToken::new(),
    ));
    Fixture {
        _dir: dir,
        queue,
        events,
        leases,
        locks,
        state,
        runner,
    }
}

fn fixture() -> Fixture {
    fixture_with(
        QueueConfig::default(),
        ScriptedRunner::default(),
        Arc::new(SystemClock::new()),
    )
}

fn request(priority: JobPriority) -> EnqueueRequest {
    EnqueueRequest::new("c.yaml").with_priority(priority)
}

async fn wait_for_status(queue: &JobQueue, id: &str, status: JobStatus) -> Job {
    for _ in 0..200 {
        if let Some(job) = queue.get(id)
            && job.status == status
        {
            return job;
        }
        tokio::time::sleep(StdDuration::from_millis(25)).await;
    }
    panic!("job {id} never reached {status}: {:?}", queue.get(id));
}

fn event_count(events: &EventStore, prefix: &str) -> usize {
    events
        .query(&EventQuery {
            type_prefix: Some(prefix.into()),
            ..Default::default()
        })
        .len()
}

#[test]
fn pickup_is_strict_priority_then_fifo() {
    let f = fixture();
    let low = f.queue.enqueue(request(JobPriority::Low)).unwrap();
    let normal = f.queue.enqueue(request(JobPriority::Normal)).unwrap();
    let high_a = f.queue.enqueue(request(JobPriority::High)).unwrap();
    let high_b = f.queue.enqueue(request(JobPriority::High)).unwrap();

    let order: Vec<String> = std::iter::from_fn(|| f.queue.take_next().map(|(job, _)| job.id)).collect();
    assert_eq!(order, [high_a.id, high_b.id, normal.id, low.id]);
    assert_eq!(f.queue.status().running, 4);
}

#[test]
fn paused_queue_hands_out_nothing() {
    let f = fixture();
    f.queue.enqueue(request(JobPriority::High)).unwrap();
    f.queue.pause();
    assert!(f.queue.take_next().is_none());
    f.queue.resume();
    assert!(f.queue.take_next().is_some());
    assert_eq!(event_count(&f.events, "queue.paused"), 1);
    assert_eq!(event_count(&f.events, "queue.resumed"), 1);
}

#[test]
fn same_idempotency_key_returns_the_live_job() {
    let f = fixture();
    let first = f
        .queue
        .enqueue(EnqueueRequest::new("c.yaml").with_idempotency_key("deploy-42"))
        .unwrap();
    let second = f
        .queue
        .enqueue(EnqueueRequest::new("c.yaml").with_idempotency_key("deploy-42"))
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(f.queue.list(&JobFilter::default()).len(), 1);
}

#[tokio::test]
async fn idempotency_key_is_reusable_once_the_job_is_terminal() {
    let f = fixture();
    let first = f
        .queue
        .enqueue(EnqueueRequest::new("c.yaml").with_idempotency_key("k"))
        .unwrap();
    f.queue.cancel(&first.id).await.unwrap();
    let second = f
        .queue
        .enqueue(EnqueueRequest::new("c.yaml").with_idempotency_key("k"))
        .unwrap();
    assert_ne!(first.id, second.id);
}

#[test]
fn missing_config_path_is_invalid() {
    let f = fixture();
    let err = f.queue.enqueue(EnqueueRequest::new("absent.yaml")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    let err = f.queue.enqueue(EnqueueRequest::new("  ")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[test]
fn backlog_limit_applies_unless_forced() {
    let f = fixture_with(
        QueueConfig {
            max_backlog: 2,
            ..Default::default()
        },
        ScriptedRunner::default(),
        Arc::new(SystemClock::new()),
    );
    f.queue.enqueue(request(JobPriority::Normal)).unwrap();
    f.queue.enqueue(request(JobPriority::Normal)).unwrap();
    let err = f.queue.enqueue(request(JobPriority::Normal)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Exhausted);
    assert!(err.to_string().contains("BACKLOG_FULL"));

    f.queue
        .enqueue(request(JobPriority::Normal).with_force(true))
        .unwrap();
    assert_eq!(f.queue.status().queued.normal, 3);
}

#[test]
fn saturation_is_reported_once_per_crossing() {
    let f = fixture_with(
        QueueConfig {
            max_backlog: 4,
            saturation_threshold: 0.5,
            ..Default::default()
        },
        ScriptedRunner::default(),
        Arc::new(SystemClock::new()),
    );
    for _ in 0..3 {
        f.queue.enqueue(request(JobPriority::Low)).unwrap();
    }
    assert_eq!(event_count(&f.events, "queue.saturation"), 1);
    assert!(f.queue.status().saturated);
}

#[test]
fn execution_cost_ceiling_is_enforced() {
    let f = fixture();
    f.queue.set_capacity(10, Some(5.0)).unwrap();
    let mut expensive = request(JobPriority::Normal);
    expensive.estimated_cost = Some(8.0);
    assert_eq!(
        f.queue.enqueue(expensive).unwrap_err().kind(),
        ErrorKind::Exhausted
    );
    assert!(f.queue.set_capacity(0, None).is_err());
}

#[tokio::test]
async fn cancel_queued_job_and_reject_terminal_cancel() {
    let f = fixture();
    let job = f.queue.enqueue(request(JobPriority::Normal)).unwrap();
    let canceled = f.queue.cancel(&job.id).await.unwrap();
    assert_eq!(canceled.status, JobStatus::Canceled);
    assert!(canceled.ended_at.is_some());
    assert_eq!(f.queue.status().queued, QueuedCounts::default());

    let err = f.queue.cancel(&job.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    let err = f.queue.cancel("job-missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(event_count(&f.events, "job.canceled"), 1);
}

#[tokio::test]
async fn workers_run_jobs_and_persist_run_records() {
    let f = fixture();
    f.queue.start();
    let job = f.queue.enqueue(request(JobPriority::Normal)).unwrap();
    let done = wait_for_status(&f.queue, &job.id, JobStatus::Succeeded).await;

    assert_eq!(done.attempt, 1);
    let run_id = done.run_id.clone().unwrap();
    let record = f.state.load_run(&run_id).unwrap();
    assert_eq!(record.job_id.as_deref(), Some(job.id.as_str()));
    assert_eq!(f.runner.runs.lock().as_slice(), [job.id.clone()]);

    let leases = f.leases.list();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].status, crate::leases::LeaseStatus::Released);
    assert_eq!(event_count(&f.events, "job.succeeded"), 1);

    assert!(f.queue.shutdown(StdDuration::from_secs(2)).await);
}

#[tokio::test]
async fn cancel_running_job_signals_the_runner() {
    let f = fixture_with(
        QueueConfig {
            workers: 1,
            ..Default::default()
        },
        ScriptedRunner {
            block_until_canceled: true,
            ..Default::default()
        },
        Arc::new(SystemClock::new()),
    );
    f.queue.start();
    let job = f.queue.enqueue(request(JobPriority::High)).unwrap();
    wait_for_status(&f.queue, &job.id, JobStatus::Running).await;

    let canceled = f.queue.cancel(&job.id).await.unwrap();
    assert_eq!(canceled.status, JobStatus::Canceled);
    assert!(f.queue.shutdown(StdDuration::from_secs(2)).await);
}

#[tokio::test]
async fn lock_key_serialises_conflicting_jobs() {
    let f = fixture();
    let first = f
        .queue
        .enqueue(request(JobPriority::Normal).with_lock_key("site"))
        .unwrap();
    assert_eq!(
        f.locks.get("site").and_then(|l| l.bound_job_id),
        Some(first.id.clone())
    );
    let err = f
        .queue
        .enqueue(request(JobPriority::Normal).with_lock_key("site"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    f.queue.cancel(&first.id).await.unwrap();
    assert!(f.locks.get("site").is_none());
    f.queue
        .enqueue(request(JobPriority::Normal).with_lock_key("site"))
        .unwrap();
}

#[test]
fn jobs_on_unhealthy_hosts_fail_after_repeated_skips() {
    let f = fixture_with(
        QueueConfig {
            host_unhealthy_max_skips: 2,
            host_backoff_ms: 0,
            ..Default::default()
        },
        ScriptedRunner::default(),
        Arc::new(SystemClock::new()),
    );
    f.queue.set_host_health("web-01", false).unwrap();
    let job = f
        .queue
        .enqueue(request(JobPriority::High).with_host("web-01"))
        .unwrap();

    assert!(f.queue.take_next().is_none());
    assert!(f.queue.take_next().is_none());
    assert_eq!(f.queue.get(&job.id).unwrap().status, JobStatus::Queued);
    assert!(f.queue.take_next().is_none());

    let failed = f.queue.get(&job.id).unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("host unhealthy"));
}

#[test]
fn healthy_jobs_are_picked_past_a_deferred_one() {
    let f = fixture();
    f.queue.set_host_health("db-01", false).unwrap();
    f.queue
        .enqueue(request(JobPriority::High).with_host("db-01"))
        .unwrap();
    let healthy = f.queue.enqueue(request(JobPriority::Low)).unwrap();
    let (picked, _) = f.queue.take_next().unwrap();
    assert_eq!(picked.id, healthy.id);
    assert_eq!(f.queue.status().unhealthy_hosts, ["db-01"]);
}

#[test]
fn stuck_jobs_without_heartbeats_are_failed() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let f = fixture_with(QueueConfig::default(), ScriptedRunner::default(), clock.clone());
    let job = f.queue.enqueue(request(JobPriority::Normal)).unwrap();
    f.queue.take_next().unwrap();

    assert!(f.queue.recover_stuck(Duration::minutes(5)).is_empty());
    clock.advance(Duration::minutes(10));
    let recovered = f.queue.recover_stuck(Duration::minutes(5));
    assert_eq!(recovered.len(), 1);
    let failed = f.queue.get(&job.id).unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("stuck job recovered"));
}

#[test]
fn panicking_subscriber_is_dropped() {
    let f = fixture();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    f.queue.subscribe(Arc::new(move |job: &Job| sink.lock().push(job.status)));
    f.queue.subscribe(Arc::new(|_: &Job| panic!("subscriber bug")));

    f.queue.enqueue(request(JobPriority::Normal)).unwrap();
    f.queue.enqueue(request(JobPriority::Normal)).unwrap();

    assert_eq!(seen.lock().as_slice(), [JobStatus::Queued, JobStatus::Queued]);
    assert_eq!(event_count(&f.events, "queue.subscriber_dropped"), 1);
    assert_eq!(f.queue.subscribers.lock().len(), 1);
}

#[tokio::test]
async fn shutdown_cancels_leftovers_and_rejects_new_work() {
    let f = fixture();
    let job = f.queue.enqueue(request(JobPriority::Normal)).unwrap();
    assert!(f.queue.shutdown(StdDuration::from_millis(200)).await);

    assert_eq!(f.queue.get(&job.id).unwrap().status, JobStatus::Canceled);
    let err = f.queue.enqueue(request(JobPriority::Normal)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ShuttingDown);
}

#[test]
fn fail_job_marks_non_terminal_jobs_failed() {
    let f = fixture();
    let job = f.queue.enqueue(request(JobPriority::Normal)).unwrap();
    let failed = f.queue.fail_job(&job.id, "stale run lease recovered").unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    let again = f.queue.fail_job(&job.id, "other").unwrap();
    assert_eq!(again.last_error.as_deref(), Some("stale run lease recovered"));
    assert!(f.queue.fail_job("job-nope", "x").is_err());
}

/// Releases `threads` enqueues at once and returns how many were accepted.
fn enqueue_in_parallel(
    queue: &JobQueue,
    threads: usize,
    make: impl Fn() -> EnqueueRequest + Sync,
) -> usize {
    let barrier = std::sync::Barrier::new(threads);
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    queue.enqueue(make()).is_ok()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|accepted| *accepted)
            .count()
    })
}

#[test]
fn concurrent_enqueues_never_overshoot_the_backlog() {
    for _ in 0..50 {
        let f = fixture();
        f.queue.set_capacity(1, None).unwrap();
        let accepted = enqueue_in_parallel(&f.queue, 8, || request(JobPriority::Normal));
        assert_eq!(accepted, 1);
        assert_eq!(f.queue.status().queued.normal, 1);
    }
}

#[test]
fn concurrent_enqueues_respect_tenant_limits() {
    use crate::admission::{TenantLimitsGate, TenantPolicy};

    for _ in 0..50 {
        let gate = Arc::new(TenantLimitsGate::new());
        gate.set_policy(TenantPolicy {
            tenant: "acme".into(),
            max_concurrent_runs: Some(2),
            max_queue_share_percent: None,
        })
        .unwrap();
        let h = super::test_support::harness(Arc::new(SystemClock::new()), |events| {
            AdmissionSet::new(events).with_gate(gate.clone())
        });
        let accepted = enqueue_in_parallel(&h.queue, 8, || EnqueueRequest {
            tenant: Some("acme".into()),
            ..request(JobPriority::Normal)
        });
        assert_eq!(accepted, 2);
        assert_eq!(h.queue.status().queued.normal, 2);
    }
}
