//! Keyed execution locks serialising conflicting applies.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::clock::Clock;
use crate::error::{ControlError, Result};
use crate::events::{EventDraft, EventStore};
use crate::store::RecordSource;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLock {
    pub key: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_seconds: i64,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound_job_id: Option<String>,
}

impl ExecutionLock {
    /// A lock stays live up to and including `expires_at`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }
}

pub struct ExecutionLocks {
    locks: Mutex<BTreeMap<String, ExecutionLock>>,
    clock: Arc<dyn Clock>,
    events: Arc<EventStore>,
}

impl fmt::Debug for ExecutionLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ExecutionLocks");
        if let Some(locks) = self.locks.try_lock() {
            debug.field("held", &locks.len());
        }
        debug.finish_non_exhaustive()
    }
}

impl ExecutionLocks {
    pub fn new(clock: Arc<dyn Clock>, events: Arc<EventStore>) -> Self {
        Self {
            locks: Mutex::new(BTreeMap::new()),
            clock,
            events,
        }
    }

    /// Takes `key` for `holder` unless a live lock already exists.
    pub fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<ExecutionLock> {
        if key.trim().is_empty() || holder.trim().is_empty() {
            return Err(ControlError::InvalidRequest("lock key and holder are required".into()));
        }
        if ttl < Duration::seconds(1) {
            return Err(ControlError::InvalidRequest("lock ttl must be at least 1s".into()));
        }

        let lock = {
            let mut locks = self.locks.lock();
            let now = self.clock.now();
            if let Some(existing) = locks.get(key) {
                if existing.is_live(now) {
                    return Err(ControlError::conflict(format!(
                        "execution lock {key} is held by {} until {}",
                        existing.holder,
                        existing.expires_at.to_rfc3339()
                    )));
                }
                debug!(key, holder = %existing.holder, "reaping expired execution lock");
            }
            let lock = ExecutionLock {
                key: key.to_string(),
                holder: holder.to_string(),
                acquired_at: now,
                ttl_seconds: ttl.num_seconds(),
                expires_at: now + ttl,
                bound_job_id: None,
            };
            locks.insert(key.to_string(), lock.clone());
            lock
        };

        self.events.record(
            EventDraft::new("execution.lock.acquired", format!("lock {key} acquired by {holder}"))
                .field("key", key)
                .field("holder", holder)
                .field("expires_at", lock.expires_at.to_rfc3339()),
        );
        Ok(lock)
    }

    /// Drops the lock under `key`; releasing a missing lock is fine.
    pub fn release(&self, key: &str) -> Option<ExecutionLock> {
        let released = self.locks.lock().remove(key);
        if let Some(lock) = &released {
            self.events.record(
                EventDraft::new("execution.lock.released", format!("lock {key} released"))
                    .field("key", key)
                    .field("holder", lock.holder.clone()),
            );
        }
        released
    }

    /// Releases only when `holder` still owns the lock.
    pub fn release_if_held(&self, key: &str, holder: &str) -> Option<ExecutionLock> {
        {
            let locks = self.locks.lock();
            match locks.get(key) {
                Some(lock) if lock.holder == holder => {}
                _ => return None,
            }
        }
        self.release(key)
    }

    pub fn bind_job(&self, key: &str, job_id: &str) -> Result<ExecutionLock> {
        let mut locks = self.locks.lock();
        let now = self.clock.now();
        match locks.get_mut(key) {
            Some(lock) if lock.is_live(now) => {
                lock.bound_job_id = Some(job_id.to_string());
                Ok(lock.clone())
            }
            _ => Err(ControlError::NotFound(format!("execution lock {key}"))),
        }
    }

    /// Removes every expired lock and returns how many went.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<ExecutionLock> = {
            let mut locks = self.locks.lock();
            let keys: Vec<String> = locks
                .values()
                .filter(|l| !l.is_live(now))
                .map(|l| l.key.clone())
                .collect();
            keys.iter().filter_map(|k| locks.remove(k)).collect()
        };
        for lock in &expired {
            self.events.record(
                EventDraft::new("execution.lock.expired", format!("lock {} expired", lock.key))
                    .field("key", lock.key.clone())
                    .field("holder", lock.holder.clone()),
            );
        }
        expired.len()
    }

    pub fn get(&self, key: &str) -> Option<ExecutionLock> {
        self.locks.lock().get(key).cloned()
    }

    pub fn list(&self) -> Vec<ExecutionLock> {
        self.locks.lock().values().cloned().collect()
    }
}

impl RecordSource for ExecutionLocks {
    fn list_records(&self) -> Vec<Map<String, Value>> {
        self.list()
            .into_iter()
            .filter_map(|lock| match serde_json::to_value(lock) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            })
            .collect()
    }
}
