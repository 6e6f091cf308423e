use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Time source shared by every component.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current UTC time; never goes backwards within a process.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock clamped so readings are non-decreasing.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let mut last = self.last.lock();
        let now = Utc::now();
        let reading = match *last {
            Some(previous) if previous > now => previous,
            _ => now,
        };
        *last = Some(reading);
        reading
    }
}

/// Clock that only moves when told to.
#[cfg(any(test, feature = "testing"))]
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

#[cfg(any(test, feature = "testing"))]
impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut now = self.now.lock();
        if at > *now {
            *now = at;
        }
    }
}

#[cfg(any(test, feature = "testing"))]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Produces `prefix-<ordinal>-<random>` identifiers.
///
/// The ordinal is zero-padded to twelve digits so lexical order of IDs with
/// the same prefix matches creation order.
#[derive(Debug, Default)]
pub struct IdGenerator {
    ordinal: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self, prefix: &str) -> String {
        let ordinal = self.ordinal.fetch_add(1, Ordering::SeqCst) + 1;
        let salt: u32 = rand::random();
        format!("{prefix}-{ordinal:012}-{salt:08x}")
    }

    /// Moves the ordinal past an id issued by an earlier process so records
    /// reloaded from disk keep sorting before new ones. Foreign keys are
    /// ignored.
    pub fn observe(&self, id: &str) {
        let mut parts = id.rsplitn(3, '-');
        let (Some(salt), Some(ordinal), Some(_prefix)) = (parts.next(), parts.next(), parts.next()) else {
            return;
        };
        if salt.len() != 8 || ordinal.len() != 12 {
            return;
        }
        if let Ok(ordinal) = ordinal.parse::<u64>() {
            self.ordinal.fetch_max(ordinal, Ordering::SeqCst);
        }
    }
}
