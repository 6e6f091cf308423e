//! Heartbeated run leases proving ownership of an in-flight job.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::clock::{Clock, IdGenerator};
use crate::error::{ControlError, Result};
use crate::events::{EventDraft, EventStore};
use crate::store::RecordSource;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    Active,
    Released,
    Recovered,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunLease {
    pub lease_id: String,
    pub job_id: String,
    pub holder: String,
    pub ttl_seconds: i64,
    pub acquired_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: LeaseStatus,
    pub renewals: u32,
}

impl RunLease {
    /// `expires_at` carries the exact TTL; `ttl_seconds` is whole seconds.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

#[derive(Default)]
struct LeaseBook {
    leases: BTreeMap<String, RunLease>,
    active_by_job: HashMap<String, String>,
}

pub struct RunLeases {
    book: Mutex<LeaseBook>,
    clock: Arc<dyn Clock>,
    ids: Arc<IdGenerator>,
    events: Arc<EventStore>,
}

impl fmt::Debug for RunLeases {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("RunLeases");
        if let Some(book) = self.book.try_lock() {
            debug
                .field("leases", &book.leases.len())
                .field("active", &book.active_by_job.len());
        }
        debug.finish_non_exhaustive()
    }
}

impl RunLeases {
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<IdGenerator>, events: Arc<EventStore>) -> Self {
        Self {
            book: Mutex::new(LeaseBook::default()),
            clock,
            ids,
            events,
        }
    }

    /// Grants a lease on `job_id`; the current holder re-acquiring refreshes it.
    pub fn acquire(&self, job_id: &str, holder: &str, ttl: Duration) -> Result<RunLease> {
        if job_id.trim().is_empty() || holder.trim().is_empty() {
            return Err(ControlError::InvalidRequest("lease job_id and holder are required".into()));
        }
        if ttl < Duration::seconds(1) {
            return Err(ControlError::InvalidRequest("lease ttl must be at least 1s".into()));
        }

        let now = self.clock.now();
        let (lease, reaped) = {
            let mut book = self.book.lock();
            let book = &mut *book;
            let mut reaped = None;
            if let Some(lease_id) = book.active_by_job.get(job_id).cloned()
                && let Some(existing) = book.leases.get_mut(&lease_id)
            {
                if existing.holder == holder {
                    existing.last_heartbeat = now;
                    existing.ttl_seconds = ttl.num_seconds();
                    existing.expires_at = now + ttl;
                    existing.renewals += 1;
                    return Ok(existing.clone());
                }
                if !existing.is_expired(now) {
                    return Err(ControlError::conflict(format!(
                        "job {job_id} already leased by {}",
                        existing.holder
                    )));
                }
                existing.status = LeaseStatus::Recovered;
                reaped = Some(existing.clone());
                book.active_by_job.remove(job_id);
            }
            let lease = RunLease {
                lease_id: self.ids.next_id("lease"),
                job_id: job_id.to_string(),
                holder: holder.to_string(),
                ttl_seconds: ttl.num_seconds(),
                acquired_at: now,
                last_heartbeat: now,
                expires_at: now + ttl,
                status: LeaseStatus::Active,
                renewals: 0,
            };
            book.active_by_job
                .insert(job_id.to_string(), lease.lease_id.clone());
            book.leases.insert(lease.lease_id.clone(), lease.clone());
            (lease, reaped)
        };

        if let Some(stale) = reaped {
            warn!(lease_id = %stale.lease_id, job_id, holder = %stale.holder, "reaped expired run lease");
            self.events.record(
                EventDraft::new("run_lease.recovered", format!("lease {} recovered", stale.lease_id))
                    .field("lease_id", stale.lease_id.clone())
                    .field("job_id", job_id)
                    .field("holder", stale.holder.clone()),
            );
        }
        self.events.record(
            EventDraft::new("run_lease.acquired", format!("lease on {job_id} granted to {holder}"))
                .field("lease_id", lease.lease_id.clone())
                .field("job_id", job_id)
                .field("holder", holder)
                .field("ttl_seconds", lease.ttl_seconds),
        );
        Ok(lease)
    }

    pub fn heartbeat(&self, lease_id: &str, holder: &str) -> Result<RunLease> {
        let mut book = self.book.lock();
        let lease = book
            .leases
            .get_mut(lease_id)
            .ok_or_else(|| ControlError::NotFound(format!("run lease {lease_id}")))?;
        if lease.holder != holder {
            return Err(ControlError::conflict(format!(
                "run lease {lease_id} is held by {}",
                lease.holder
            )));
        }
        if lease.status != LeaseStatus::Active {
            return Err(ControlError::Gone(format!(
                "run lease {lease_id} is {:?}",
                lease.status
            )));
        }
        let now = self.clock.now();
        let ttl = lease.expires_at - lease.last_heartbeat;
        lease.last_heartbeat = now;
        lease.expires_at = now + ttl;
        lease.renewals += 1;
        Ok(lease.clone())
    }

    /// Releasing an already-released lease returns it unchanged.
    pub fn release(&self, lease_id: &str, holder: &str) -> Result<RunLease> {
        let lease = {
            let mut book = self.book.lock();
            let book = &mut *book;
            let lease = book
                .leases
                .get_mut(lease_id)
                .ok_or_else(|| ControlError::NotFound(format!("run lease {lease_id}")))?;
            if lease.holder != holder {
                return Err(ControlError::conflict(format!(
                    "run lease {lease_id} is held by {}",
                    lease.holder
                )));
            }
            if lease.status != LeaseStatus::Active {
                return Ok(lease.clone());
            }
            lease.status = LeaseStatus::Released;
            book.active_by_job.remove(&lease.job_id);
            lease.clone()
        };

        self.events.record(
            EventDraft::new("run_lease.released", format!("lease {lease_id} released"))
                .field("lease_id", lease_id)
                .field("job_id", lease.job_id.clone())
                .field("holder", holder),
        );
        Ok(lease)
    }

    /// Moves every active lease whose heartbeat is older than its TTL to
    /// `recovered` and returns them. A second call with the same `now`
    /// finds nothing.
    pub fn recover_expired(&self, now: DateTime<Utc>) -> Vec<RunLease> {
        let recovered: Vec<RunLease> = {
            let mut book = self.book.lock();
            let book = &mut *book;
            let mut recovered = Vec::new();
            for lease in book.leases.values_mut() {
                if lease.status == LeaseStatus::Active && lease.is_expired(now) {
                    lease.status = LeaseStatus::Recovered;
                    book.active_by_job.remove(&lease.job_id);
                    recovered.push(lease.clone());
                }
            }
            recovered
        };

        for lease in &recovered {
            warn!(lease_id = %lease.lease_id, job_id = %lease.job_id, holder = %lease.holder, "recovered stale run lease");
            self.events.record(
                EventDraft::new("run_lease.recovered", format!("lease {} recovered", lease.lease_id))
                    .field("lease_id", lease.lease_id.clone())
                    .field("job_id", lease.job_id.clone())
                    .field("holder", lease.holder.clone()),
            );
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), "run lease recovery finished");
        }
        recovered
    }

    pub fn active_for_job(&self, job_id: &str) -> Option<RunLease> {
        let book = self.book.lock();
        book.active_by_job
            .get(job_id)
            .and_then(|id| book.leases.get(id))
            .cloned()
    }

    pub fn has_fresh_heartbeat(&self, job_id: &str, now: DateTime<Utc>) -> bool {
        self.active_for_job(job_id)
            .is_some_and(|lease| !lease.is_expired(now))
    }

    pub fn get(&self, lease_id: &str) -> Option<RunLease> {
        self.book.lock().leases.get(lease_id).cloned()
    }

    pub fn list(&self) -> Vec<RunLease> {
        self.book.lock().leases.values().cloned().collect()
    }
}

impl RecordSource for RunLeases {
    fn list_records(&self) -> Vec<Map<String, Value>> {
        self.list()
            .into_iter()
            .filter_map(|lease| match serde_json::to_value(lease) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EventStoreConfig;

    fn leases() -> (RunLeases, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ids = Arc::new(IdGenerator::new());
        let events = Arc::new(EventStore::new(EventStoreConfig::default(), clock.clone(), ids.clone()));
        (RunLeases::new(clock.clone(), ids, events), clock)
    }

    #[test]
    fn one_active_lease_per_job() {
        let (leases, _) = leases();
        let first = leases.acquire("J", "H", Duration::seconds(10)).unwrap();
        assert!(matches!(
            leases.acquire("J", "other", Duration::seconds(10)),
            Err(ControlError::Conflict { .. })
        ));
        let again = leases.acquire("J", "H", Duration::seconds(10)).unwrap();
        assert_eq!(first.lease_id, again.lease_id);

        leases.release(&first.lease_id, "H").unwrap();
        let next = leases.acquire("J", "other", Duration::seconds(10)).unwrap();
        assert_ne!(next.lease_id, first.lease_id);
    }

    #[test]
    fn expired_lease_is_reaped_for_a_new_holder() {
        let (leases, clock) = leases();
        let stale = leases.acquire("J", "H", Duration::seconds(2)).unwrap();
        clock.advance(Duration::milliseconds(2_500));

        let taken = leases.acquire("J", "other", Duration::seconds(2)).unwrap();
        assert_ne!(taken.lease_id, stale.lease_id);
        assert_eq!(leases.get(&stale.lease_id).unwrap().status, LeaseStatus::Recovered);
        assert_eq!(leases.active_for_job("J").unwrap().holder, "other");
        assert!(leases.recover_expired(clock.now()).is_empty());
    }

    #[test]
    fn sub_second_ttl_is_kept_across_heartbeats() {
        let (leases, clock) = leases();
        let lease = leases
            .acquire("J", "H", Duration::milliseconds(1_500))
            .unwrap();
        clock.advance(Duration::milliseconds(1_200));
        assert!(leases.has_fresh_heartbeat("J", clock.now()));
        let beat = leases.heartbeat(&lease.lease_id, "H").unwrap();
        assert_eq!(beat.expires_at, clock.now() + Duration::milliseconds(1_500));
        assert!(!leases.has_fresh_heartbeat("J", clock.now() + Duration::milliseconds(1_600)));
    }

    #[test]
    fn heartbeat_extends_expiry() {
        let (leases, clock) = leases();
        let lease = leases.acquire("J", "H", Duration::seconds(10)).unwrap();
        clock.advance(Duration::seconds(8));
        let beat = leases.heartbeat(&lease.lease_id, "H").unwrap();
        assert_eq!(beat.expires_at, clock.now() + Duration::seconds(10));
        assert!(matches!(
            leases.heartbeat(&lease.lease_id, "intruder"),
            Err(ControlError::Conflict { .. })
        ));
    }

    #[test]
    fn recovery_is_idempotent() {
        let (leases, clock) = leases();
        leases.acquire("J", "H", Duration::seconds(1)).unwrap();
        let now = clock.now() + Duration::seconds(2);

        let recovered = leases.recover_expired(now);
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].status, LeaseStatus::Recovered);
        assert!(leases.recover_expired(now).is_empty());
        assert!(leases.active_for_job("J").is_none());
    }

    #[test]
    fn heartbeat_on_recovered_lease_is_gone() {
        let (leases, clock) = leases();
        let lease = leases.acquire("J", "H", Duration::seconds(1)).unwrap();
        leases.recover_expired(clock.now() + Duration::seconds(5));
        assert!(matches!(
            leases.heartbeat(&lease.lease_id, "H"),
            Err(ControlError::Gone(_))
        ));
    }

    #[test]
    fn fresh_heartbeat_tracks_ttl() {
        let (leases, clock) = leases();
        leases.acquire("J", "H", Duration::seconds(5)).unwrap();
        assert!(leases.has_fresh_heartbeat("J", clock.now()));
        assert!(!leases.has_fresh_heartbeat("J", clock.now() + Duration::seconds(6)));
    }
}
