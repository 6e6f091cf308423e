//! Activity log reads and the live SSE feed.

use std::{convert::Infallible, sync::Arc, time::Duration};

use async_stream::stream;
use axum::{
    Json,
    extract::{Query, State},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use masterchef_core::events::{Event, EventQuery, EventStore, IntegrityReport};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::AppState;

pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const DEFAULT_REPLAY_LIMIT: usize = 50;
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Default, Deserialize)]
pub struct ActivityListParams {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub type_prefix: Option<String>,
    pub contains: Option<String>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub desc: bool,
}

pub async fn list_activity(
    State(state): State<AppState>,
    Query(params): Query<ActivityListParams>,
) -> Json<Vec<Event>> {
    let query = EventQuery {
        since: params.since,
        until: params.until,
        type_prefix: params.type_prefix,
        contains: params.contains,
        limit: Some(params.limit.unwrap_or(DEFAULT_LIST_LIMIT)),
        desc: params.desc,
    };
    Json(state.control().events().query(&query))
}

pub async fn activity_integrity(State(state): State<AppState>) -> Json<IntegrityReport> {
    Json(state.control().events().integrity_check())
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct ActivityStreamParams {
    pub replay_limit: Option<usize>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub type_prefix: Option<String>,
    pub contains: Option<String>,
}

impl ActivityStreamParams {
    fn filter(&self) -> EventQuery {
        EventQuery {
            since: self.since,
            until: self.until,
            type_prefix: self.type_prefix.clone(),
            contains: self.contains.clone(),
            limit: None,
            desc: false,
        }
    }
}

/// Replay slice followed by live events matching `params`.
///
/// The subscription is taken before the replay is read, so nothing appended
/// in between is lost; live events at or below the last replayed `seq` are
/// skipped. The feed ends once an event passes `until`, when the store drops
/// the subscriber, or when the consumer stops polling.
pub fn activity_feed(
    events: &Arc<EventStore>,
    params: ActivityStreamParams,
    now: DateTime<Utc>,
) -> impl Stream<Item = Event> + Send + 'static + use<> {
    let mut subscription = events.subscribe(None);
    let filter = params.filter();
    let replay = events.query(&EventQuery {
        limit: Some(params.replay_limit.unwrap_or(DEFAULT_REPLAY_LIMIT)),
        ..filter.clone()
    });

    stream! {
        let mut last_seq = 0;
        for event in replay {
            last_seq = event.seq;
            yield event;
        }
        let expired = filter.until.is_some_and(|until| until < now);
        while !expired {
            let Some(event) = subscription.recv().await else {
                break;
            };
            if event.seq <= last_seq {
                continue;
            }
            if filter.until.is_some_and(|until| event.time > until) {
                debug!("activity stream reached its until boundary");
                break;
            }
            if event.matches(&filter) {
                yield event;
            }
        }
    }
}

pub async fn activity_stream(
    State(state): State<AppState>,
    Query(params): Query<ActivityStreamParams>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let control = state.control();
    let feed = activity_feed(control.events(), params, control.clock().now());
    let stream = feed.filter_map(|event| async move {
        match SseEvent::default().event("activity").json_data(&event) {
            Ok(sse) => Some(Ok(sse)),
            Err(err) => {
                warn!(event_id = %event.id, error = %err, "failed to encode activity event");
                None
            }
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    )
}
