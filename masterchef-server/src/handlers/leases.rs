use axum::{Json, body::Bytes, extract::State, http::StatusCode};
use chrono::{DateTime, Duration, Utc};
use masterchef_core::leases::RunLease;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::optional_body;
use crate::{
    AppState,
    errors::{ApiJson, AppResult},
};

fn default_lease_ttl() -> i64 {
    30
}

#[derive(Debug, Deserialize)]
pub struct AcquireLease {
    pub job_id: String,
    pub holder: String,
    #[serde(default = "default_lease_ttl", alias = "ttl")]
    pub ttl_seconds: i64,
}

#[derive(Debug, Deserialize)]
pub struct LeaseHandle {
    pub lease_id: String,
    pub holder: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RecoverLeases {
    /// Evaluation instant; defaults to the control plane clock.
    #[serde(default)]
    pub now: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct RecoverLeasesResponse {
    pub recovered: usize,
    pub leases: Vec<RunLease>,
}

pub async fn list_leases(State(state): State<AppState>) -> Json<Vec<RunLease>> {
    Json(state.control().leases().list())
}

pub async fn acquire_lease(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<AcquireLease>,
) -> AppResult<(StatusCode, Json<RunLease>)> {
    let lease = state.control().leases().acquire(
        &request.job_id,
        &request.holder,
        Duration::seconds(request.ttl_seconds),
    )?;
    Ok((StatusCode::CREATED, Json(lease)))
}

pub async fn heartbeat_lease(
    State(state): State<AppState>,
    ApiJson(handle): ApiJson<LeaseHandle>,
) -> AppResult<Json<RunLease>> {
    Ok(Json(
        state
            .control()
            .leases()
            .heartbeat(&handle.lease_id, &handle.holder)?,
    ))
}

pub async fn release_lease(
    State(state): State<AppState>,
    ApiJson(handle): ApiJson<LeaseHandle>,
) -> AppResult<Json<RunLease>> {
    Ok(Json(
        state
            .control()
            .leases()
            .release(&handle.lease_id, &handle.holder)?,
    ))
}

/// Expired leases are marked recovered and their jobs failed.
pub async fn recover_leases(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Json<RecoverLeasesResponse>> {
    let request = optional_body::<RecoverLeases>(&body)?.unwrap_or_default();
    let control = state.control();
    let now = request.now.unwrap_or_else(|| control.clock().now());
    let leases = control.recover_run_leases(now);
    info!(recovered = leases.len(), %now, "run lease recovery requested");
    Ok(Json(RecoverLeasesResponse {
        recovered: leases.len(),
        leases,
    }))
}
