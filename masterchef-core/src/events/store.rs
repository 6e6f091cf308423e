use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::warn;

use super::model::{Event, EventDraft, EventQuery, GENESIS_HASH, IntegrityReport};
use crate::clock::{Clock, IdGenerator};
use crate::config::EventStoreConfig;
use crate::error::{ControlError, Result};
use crate::store::RecordSource;

pub const EVENTS_TRUNCATED: &str = "events.truncated";
pub const SUBSCRIBER_DROPPED: &str = "events.subscriber_dropped";

pub type SubscriberId = u64;

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<Event>,
    lagging: bool,
}

struct Log {
    buffer: VecDeque<Event>,
    next_seq: u64,
    last_hash: String,
    dropped_total: u64,
    drops_since_notice: u64,
    subscribers: Vec<Subscriber>,
    next_subscriber: SubscriberId,
    closed: bool,
}

/// Append-only, hash-chained event log with bounded fan-out.
///
/// Appends are serialised under one mutex. Every subscriber channel keeps one
/// slot in reserve; a subscriber whose channel fills up to that slot is marked
/// lagging, receives an `events.subscriber_dropped` notice in the reserved
/// slot and is detached. Producers never wait on consumers.
pub struct EventStore {
    clock: Arc<dyn Clock>,
    ids: Arc<IdGenerator>,
    capacity: usize,
    subscriber_buffer: usize,
    log: Mutex<Log>,
}

impl fmt::Debug for EventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("EventStore");
        debug.field("capacity", &self.capacity);
        if let Some(log) = self.log.try_lock() {
            debug
                .field("len", &log.buffer.len())
                .field("next_seq", &log.next_seq)
                .field("subscribers", &log.subscribers.len())
                .field("closed", &log.closed);
        }
        debug.finish_non_exhaustive()
    }
}

/// Live feed handed out by [`EventStore::subscribe`]; unsubscribes on drop.
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Event>,
    store: Weak<EventStore>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once the store detached this subscriber.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.unsubscribe(self.id);
        }
    }
}

impl EventStore {
    pub fn new(
        config: EventStoreConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<IdGenerator>,
    ) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            clock,
            ids,
            capacity,
            subscriber_buffer: config.subscriber_buffer.max(1),
            log: Mutex::new(Log {
                buffer: VecDeque::with_capacity(capacity.min(4_096)),
                next_seq: 1,
                last_hash: GENESIS_HASH.to_string(),
                dropped_total: 0,
                drops_since_notice: 0,
                subscribers: Vec::new(),
                next_subscriber: 1,
                closed: false,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Seals and stores the draft, fanning it out to subscribers.
    ///
    /// Synthetic notices triggered by this append (truncation, dropped
    /// subscribers) are sealed right after it under the same lock.
    pub fn append(&self, draft: EventDraft) -> Result<Event> {
        let mut log = self.log.lock();
        if log.closed {
            return Err(ControlError::ShuttingDown);
        }

        let mut pending = VecDeque::from([draft]);
        let mut first = None;
        while let Some(next) = pending.pop_front() {
            let event = self.seal(&mut log, next);
            self.retain(&mut log, event.clone(), &mut pending);
            Self::fan_out(&mut log, &event, &mut pending);
            if first.is_none() {
                first = Some(event);
            }
        }

        first.ok_or_else(|| ControlError::Internal("append produced no event".into()))
    }

    /// Appends and logs instead of returning the error; for background paths
    /// where a closed log only means shutdown is under way.
    pub fn record(&self, draft: EventDraft) -> Option<Event> {
        match self.append(draft) {
            Ok(event) => Some(event),
            Err(ControlError::ShuttingDown) => None,
            Err(err) => {
                warn!(error = %err, "failed to append event");
                None
            }
        }
    }

    fn seal(&self, log: &mut Log, draft: EventDraft) -> Event {
        let seq = log.next_seq;
        log.next_seq += 1;
        let mut event = Event {
            id: self.ids.next_id("evt"),
            seq,
            time: self.clock.now(),
            event_type: draft.event_type,
            message: draft.message,
            fields: draft.fields,
            prev_hash: log.last_hash.clone(),
            hash: String::new(),
        };
        event.hash = event.compute_hash();
        log.last_hash = event.hash.clone();
        event
    }

    fn retain(&self, log: &mut Log, event: Event, pending: &mut VecDeque<EventDraft>) {
        if log.buffer.len() >= self.capacity {
            log.buffer.pop_front();
            log.dropped_total += 1;
            if log.drops_since_notice == 0 {
                pending.push_back(
                    EventDraft::new(
                        EVENTS_TRUNCATED,
                        "event log reached capacity; oldest events dropped",
                    )
                    .field("capacity", self.capacity as u64)
                    .field("dropped_total", log.dropped_total),
                );
            }
            log.drops_since_notice = (log.drops_since_notice + 1) % self.capacity as u64;
        }
        log.buffer.push_back(event);
    }

    fn fan_out(log: &mut Log, event: &Event, pending: &mut VecDeque<EventDraft>) {
        let mut detached = Vec::new();
        for subscriber in log.subscribers.iter_mut() {
            if subscriber.lagging {
                if event.event_type == SUBSCRIBER_DROPPED
                    && event.fields.get("subscriber_id") == Some(&Value::from(subscriber.id))
                {
                    let _ = subscriber.tx.try_send(event.clone());
                    detached.push(subscriber.id);
                }
                continue;
            }
            if subscriber.tx.is_closed() {
                detached.push(subscriber.id);
                continue;
            }
            if subscriber.tx.capacity() <= 1 {
                subscriber.lagging = true;
                warn!(subscriber_id = subscriber.id, "event subscriber lagging; detaching");
                pending.push_back(
                    EventDraft::new(
                        SUBSCRIBER_DROPPED,
                        format!("subscriber {} dropped after falling behind", subscriber.id),
                    )
                    .field("subscriber_id", subscriber.id),
                );
                continue;
            }
            if subscriber.tx.try_send(event.clone()).is_err() {
                detached.push(subscriber.id);
            }
        }
        if !detached.is_empty() {
            log.subscribers.retain(|s| !detached.contains(&s.id));
        }
    }

    /// Registers a live subscriber with a channel of `buffer` events.
    pub fn subscribe(self: &Arc<Self>, buffer: Option<usize>) -> Subscription {
        let depth = buffer.unwrap_or(self.subscriber_buffer).max(1);
        let (tx, receiver) = mpsc::channel(depth + 1);
        let mut log = self.log.lock();
        let id = log.next_subscriber;
        log.next_subscriber += 1;
        if !log.closed {
            log.subscribers.push(Subscriber {
                id,
                tx,
                lagging: false,
            });
        }
        Subscription {
            id,
            receiver,
            store: Arc::downgrade(self),
        }
    }

    /// Detaches a subscriber; unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.log.lock().subscribers.retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.log.lock().subscribers.len()
    }

    /// Most recent `limit` events in ascending order.
    pub fn list(&self, limit: usize) -> Vec<Event> {
        self.query(&EventQuery {
            limit: Some(limit),
            ..Default::default()
        })
    }

    pub fn query(&self, query: &EventQuery) -> Vec<Event> {
        let log = self.log.lock();
        let mut matched: Vec<Event> = log
            .buffer
            .iter()
            .filter(|event| event.matches(query))
            .cloned()
            .collect();
        drop(log);

        if let Some(limit) = query.limit
            && matched.len() > limit
        {
            matched.drain(..matched.len() - limit);
        }
        if query.desc {
            matched.reverse();
        }
        matched
    }

    /// Retained events with a sequence number above `seq`, oldest first.
    pub fn since_seq(&self, seq: u64) -> Vec<Event> {
        let log = self.log.lock();
        let start = log.buffer.partition_point(|event| event.seq <= seq);
        log.buffer.range(start..).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.log.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_seq(&self) -> u64 {
        self.log.lock().next_seq - 1
    }

    /// Recomputes every retained hash and prev-link; reports the first break.
    pub fn integrity_check(&self) -> IntegrityReport {
        let log = self.log.lock();
        let mut previous: Option<&Event> = None;
        for (idx, event) in log.buffer.iter().enumerate() {
            if let Some(prev) = previous {
                if event.prev_hash != prev.hash {
                    return broken(log.buffer.len(), idx, "prev_hash does not match preceding event");
                }
                if event.seq != prev.seq + 1 {
                    return broken(log.buffer.len(), idx, "sequence gap");
                }
            }
            if event.compute_hash() != event.hash {
                return broken(log.buffer.len(), idx, "hash does not match event contents");
            }
            previous = Some(event);
        }
        IntegrityReport {
            valid: true,
            checked: log.buffer.len(),
            break_at: None,
            reason: None,
        }
    }

    /// Rejects further appends and closes every subscriber channel.
    pub fn close(&self) {
        let mut log = self.log.lock();
        log.closed = true;
        log.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.log.lock().closed
    }

    /// Edits a retained event in place without resealing it.
    #[cfg(any(test, feature = "testing"))]
    pub fn tamper(&self, index: usize, edit: impl FnOnce(&mut Event)) -> bool {
        let mut log = self.log.lock();
        match log.buffer.get_mut(index) {
            Some(event) => {
                edit(event);
                true
            }
            None => false,
        }
    }
}

fn broken(checked: usize, idx: usize, reason: &str) -> IntegrityReport {
    IntegrityReport {
        valid: false,
        checked,
        break_at: Some(idx),
        reason: Some(reason.to_string()),
    }
}

impl RecordSource for EventStore {
    fn list_records(&self) -> Vec<Map<String, Value>> {
        let log = self.log.lock();
        log.buffer.iter().map(Event::to_record).collect()
    }
}
