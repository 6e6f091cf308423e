use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
};
use masterchef_core::queue::{EnqueueRequest, Job, JobFilter};
use serde_json::{Value, json};
use tracing::info;

use super::{FORCE_APPLY_HEADER, IDEMPOTENCY_KEY_HEADER, header_flag, header_str};
use crate::{
    AppState,
    errors::{ApiJson, AppError, AppResult},
};

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(filter): Query<JobFilter>,
) -> Json<Vec<Job>> {
    Json(state.control().queue().list(&filter))
}

/// `Idempotency-Key` applies when the body has none; `X-Force-Apply: true`
/// marks the job forced.
pub async fn enqueue_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(mut request): ApiJson<EnqueueRequest>,
) -> AppResult<(StatusCode, Json<Job>)> {
    if request.idempotency().is_none()
        && let Some(key) = header_str(&headers, IDEMPOTENCY_KEY_HEADER)
    {
        request.idempotency_key = Some(key.to_string());
    }
    if header_flag(&headers, FORCE_APPLY_HEADER) {
        request.force = true;
    }
    request.source = "api".into();

    let job = state.control().queue().enqueue(request)?;
    info!(job_id = %job.id, priority = %job.priority, "job accepted");
    Ok((StatusCode::ACCEPTED, Json(job)))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Job>> {
    state
        .control()
        .queue()
        .get(&id)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("job {id} not found")))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let job = state.control().queue().cancel(&id).await?;
    Ok(Json(json!({ "status": job.status, "job": job })))
}
