use axum::{Json, extract::State, http::StatusCode};
use chrono::Duration;
use masterchef_core::locks::ExecutionLock;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    AppState,
    errors::{ApiJson, AppError, AppResult},
};

fn default_lock_ttl() -> i64 {
    300
}

#[derive(Debug, Deserialize)]
pub struct AcquireLock {
    pub key: String,
    pub holder: String,
    #[serde(default = "default_lock_ttl")]
    pub ttl_seconds: i64,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseLock {
    pub key: String,
    /// When set, only this holder's lock is released.
    #[serde(default)]
    pub holder: Option<String>,
}

pub async fn list_locks(State(state): State<AppState>) -> Json<Vec<ExecutionLock>> {
    Json(state.control().locks().list())
}

pub async fn acquire_lock(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<AcquireLock>,
) -> AppResult<(StatusCode, Json<ExecutionLock>)> {
    let lock = state.control().locks().acquire(
        &request.key,
        &request.holder,
        Duration::seconds(request.ttl_seconds),
    )?;
    Ok((StatusCode::CREATED, Json(lock)))
}

pub async fn release_lock(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<ReleaseLock>,
) -> AppResult<Json<ExecutionLock>> {
    let locks = state.control().locks();
    let released = match request.holder.as_deref() {
        Some(holder) => locks.release_if_held(&request.key, holder),
        None => locks.release(&request.key),
    };
    released
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("no lock held on {}", request.key)))
}

pub async fn cleanup_locks(State(state): State<AppState>) -> Json<Value> {
    let removed = state.control().locks().cleanup();
    Json(json!({ "removed": removed }))
}
