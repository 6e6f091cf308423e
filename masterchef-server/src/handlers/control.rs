//! Operator switches: emergency stop, freeze, maintenance, queue and
//! admission policies.

use axum::{Json, body::Bytes, extract::State};
use chrono::Duration;
use masterchef_core::{
    admission::{
        CostPolicy, EmergencyStopStatus, FreezeStatus, MaintenanceWindow,
        TenantPolicy, TopologyPolicy,
    },
    queue::{Job, QueueStatus},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use super::optional_body;
use crate::{
    AppState,
    errors::{ApiJson, AppError, AppResult},
};

#[derive(Debug, Deserialize)]
pub struct EmergencyStopRequest {
    pub enabled: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn get_emergency_stop(State(state): State<AppState>) -> Json<EmergencyStopStatus> {
    Json(state.control().emergency_stop().status())
}

pub async fn set_emergency_stop(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<EmergencyStopRequest>,
) -> Json<EmergencyStopStatus> {
    Json(
        state
            .control()
            .emergency_stop()
            .set(request.enabled, request.reason),
    )
}

#[derive(Debug, Deserialize)]
pub struct FreezeRequest {
    pub enabled: bool,
    #[serde(default)]
    pub duration_seconds: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn get_freeze(State(state): State<AppState>) -> Json<FreezeStatus> {
    Json(state.control().freeze().status())
}

pub async fn set_freeze(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<FreezeRequest>,
) -> AppResult<Json<FreezeStatus>> {
    let freeze = state.control().freeze();
    if !request.enabled {
        return Ok(Json(freeze.unfreeze()));
    }
    let seconds = request.duration_seconds.ok_or_else(|| {
        AppError::bad_request("duration_seconds is required to enable a freeze")
    })?;
    Ok(Json(
        freeze.freeze(Duration::seconds(seconds), request.reason)?,
    ))
}

pub async fn list_maintenance(State(state): State<AppState>) -> Json<Vec<MaintenanceWindow>> {
    Json(state.control().maintenance().list())
}

pub async fn set_maintenance(
    State(state): State<AppState>,
    ApiJson(window): ApiJson<MaintenanceWindow>,
) -> AppResult<Json<MaintenanceWindow>> {
    Ok(Json(state.control().maintenance().set_window(window)?))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum QueueAction {
    Pause,
    Resume,
    SetCapacity {
        max_backlog: usize,
        #[serde(default)]
        max_execution_cost: Option<f64>,
    },
    SetHostHealth {
        host: String,
        healthy: bool,
    },
}

pub async fn queue_status(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(state.control().queue().status())
}

pub async fn queue_action(
    State(state): State<AppState>,
    ApiJson(action): ApiJson<QueueAction>,
) -> AppResult<Json<QueueStatus>> {
    let queue = state.control().queue();
    let status = match action {
        QueueAction::Pause => queue.pause(),
        QueueAction::Resume => queue.resume(),
        QueueAction::SetCapacity {
            max_backlog,
            max_execution_cost,
        } => queue.set_capacity(max_backlog, max_execution_cost)?,
        QueueAction::SetHostHealth { host, healthy } => {
            queue.set_host_health(&host, healthy)?
        }
    };
    Ok(Json(status))
}

fn default_max_age_seconds() -> i64 {
    300
}

#[derive(Debug, Deserialize)]
pub struct RecoverStuckRequest {
    #[serde(default = "default_max_age_seconds")]
    pub max_age_seconds: i64,
}

#[derive(Debug, Serialize)]
pub struct RecoverStuckResponse {
    pub recovered: usize,
    pub jobs: Vec<Job>,
}

pub async fn recover_stuck(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Json<RecoverStuckResponse>> {
    let max_age_seconds = match optional_body::<RecoverStuckRequest>(&body)? {
        Some(request) => request.max_age_seconds,
        None => default_max_age_seconds(),
    };
    if max_age_seconds < 0 {
        return Err(AppError::bad_request("max_age_seconds must not be negative"));
    }
    let jobs = state
        .control()
        .recover_stuck(Duration::seconds(max_age_seconds));
    info!(recovered = jobs.len(), "stuck job recovery requested");
    Ok(Json(RecoverStuckResponse {
        recovered: jobs.len(),
        jobs,
    }))
}

pub async fn list_tenant_limits(State(state): State<AppState>) -> Json<Vec<TenantPolicy>> {
    Json(state.control().tenant_limits().policies())
}

pub async fn set_tenant_limit(
    State(state): State<AppState>,
    ApiJson(policy): ApiJson<TenantPolicy>,
) -> AppResult<Json<TenantPolicy>> {
    Ok(Json(state.control().tenant_limits().set_policy(policy)?))
}

pub async fn get_cost_policy(State(state): State<AppState>) -> Json<Value> {
    let control = state.control();
    let cost = control.cost();
    Json(json!({
        "policy": cost.policy(),
        "spent_last_hour": cost.spent_since(control.clock().now()),
    }))
}

pub async fn set_cost_policy(
    State(state): State<AppState>,
    ApiJson(policy): ApiJson<CostPolicy>,
) -> AppResult<Json<CostPolicy>> {
    Ok(Json(state.control().cost().set_policy(policy)?))
}

pub async fn list_topology_policies(
    State(state): State<AppState>,
) -> Json<Vec<TopologyPolicy>> {
    Json(state.control().topology().policies())
}

pub async fn set_topology_policy(
    State(state): State<AppState>,
    ApiJson(policy): ApiJson<TopologyPolicy>,
) -> AppResult<Json<TopologyPolicy>> {
    Ok(Json(state.control().topology().set_policy(policy)?))
}
