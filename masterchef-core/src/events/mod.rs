//! Hash-chained event log and its subscriber fan-out.

mod model;
mod store;

pub use model::{
    Event, EventDraft, EventQuery, GENESIS_HASH, IntegrityReport, canonical_json,
};
pub use store::{
    EVENTS_TRUNCATED, EventStore, SUBSCRIBER_DROPPED, SubscriberId, Subscription,
};
