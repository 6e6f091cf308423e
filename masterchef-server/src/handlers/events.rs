//! External event ingestion and the beacon compatibility endpoint.

use axum::{Json, extract::State, http::StatusCode};
use masterchef_core::events::{Event, EventDraft};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{
    AppState,
    errors::{ApiJson, AppError, AppResult},
};

#[derive(Debug, Deserialize)]
pub struct IngestEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

pub async fn ingest_event(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<IngestEvent>,
) -> AppResult<(StatusCode, Json<Event>)> {
    let event_type = body.event_type.trim();
    if event_type.is_empty() {
        return Err(AppError::bad_request("event type is required"));
    }
    let message = body
        .message
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| format!("external event {event_type}"));
    let event = state
        .control()
        .events()
        .append(EventDraft::new(event_type, message).with_fields(body.fields))?;
    Ok((StatusCode::ACCEPTED, Json(event)))
}

#[derive(Debug, Deserialize)]
pub struct Beacon {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

/// Appends `beacon.<name>`; object payloads become the event fields.
pub async fn ingest_beacon(
    State(state): State<AppState>,
    ApiJson(beacon): ApiJson<Beacon>,
) -> AppResult<(StatusCode, Json<Event>)> {
    let name = beacon.name.trim();
    if name.is_empty() {
        return Err(AppError::bad_request("beacon name is required"));
    }
    let fields = match beacon.data {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => Map::from_iter([("data".to_string(), other)]),
    };
    let event = state.control().events().append(
        EventDraft::new(format!("beacon.{name}"), format!("beacon {name}"))
            .with_fields(fields),
    )?;
    Ok((StatusCode::ACCEPTED, Json(event)))
}
