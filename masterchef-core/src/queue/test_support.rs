//! Queue wiring shared by tests of components that enqueue.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::{Job, JobQueue, QueueDependencies};
use crate::admission::AdmissionSet;
use crate::clock::{Clock, IdGenerator};
use crate::config::{EventStoreConfig, QueueConfig};
use crate::events::EventStore;
use crate::leases::RunLeases;
use crate::locks::ExecutionLocks;
use crate::runner::{RunRecord, RunStatus, Runner};
use crate::state::StateStore;

#[derive(Debug, Default)]
pub struct InstantRunner;

#[async_trait]
impl Runner for InstantRunner {
    async fn run(&self, _ctx: CancellationToken, job: &Job) -> RunRecord {
        RunRecord {
            id: format!("run-{}", job.id),
            job_id: Some(job.id.clone()),
            config_path: job.config_path.clone(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
            status: RunStatus::Succeeded,
            results: Vec::new(),
            error: None,
        }
    }
}

pub struct QueueHarness {
    pub dir: TempDir,
    pub queue: Arc<JobQueue>,
    pub events: Arc<EventStore>,
    pub leases: Arc<RunLeases>,
    pub ids: Arc<IdGenerator>,
}

/// Unstarted queue over a temp workdir containing `c.yaml`.
pub fn harness(clock: Arc<dyn Clock>, admission: impl FnOnce(Arc<EventStore>) -> AdmissionSet) -> QueueHarness {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("c.yaml"), "resources: []\n").unwrap();
    let ids = Arc::new(IdGenerator::new());
    let events = Arc::new(EventStore::new(EventStoreConfig::default(), clock.clone(), ids.clone()));
    let leases = Arc::new(RunLeases::new(clock.clone(), ids.clone(), events.clone()));
    let deps = QueueDependencies {
        clock: clock.clone(),
        ids: ids.clone(),
        events: events.clone(),
        admission: Arc::new(admission(events.clone())),
        locks: Arc::new(ExecutionLocks::new(clock, events.clone())),
        leases: leases.clone(),
        runner: Arc::new(InstantRunner),
        state: Arc::new(StateStore::open(dir.path().join("state")).unwrap()),
    };
    let queue = Arc::new(JobQueue::new(
        QueueConfig::default(),
        Duration::hours(1),
        Duration::seconds(30),
        dir.path(),
        deps,
        CancellationToken::new(),
    ));
    QueueHarness {
        dir,
        queue,
        events,
        leases,
        ids,
    }
}
