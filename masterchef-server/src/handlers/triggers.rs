use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use masterchef_core::triggers::{TriggerPage, TriggerRecord, TriggerRequest, TriggerStatus};
use serde::Deserialize;
use tracing::info;

use crate::{
    AppState,
    errors::{ApiJson, AppResult},
};

const DEFAULT_PAGE_SIZE: usize = 50;

/// Blocked triggers answer 409 with the stored record as the body.
pub async fn ingest_trigger(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<TriggerRequest>,
) -> AppResult<(StatusCode, Json<TriggerRecord>)> {
    let record = state.control().triggers().ingest(request)?;
    let status = match record.status {
        TriggerStatus::Blocked => StatusCode::CONFLICT,
        TriggerStatus::Queued | TriggerStatus::Recorded => StatusCode::ACCEPTED,
    };
    info!(
        trigger_id = %record.id,
        source = %record.source,
        status = ?record.status,
        "converge trigger ingested"
    );
    Ok((status, Json(record)))
}

#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

pub async fn list_triggers(
    State(state): State<AppState>,
    Query(page): Query<PageParams>,
) -> Json<TriggerPage> {
    Json(state.control().triggers().list(
        page.offset.unwrap_or(0),
        page.limit.unwrap_or(DEFAULT_PAGE_SIZE),
    ))
}

pub async fn get_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<TriggerRecord>> {
    Ok(Json(state.control().triggers().get(&id)?))
}
