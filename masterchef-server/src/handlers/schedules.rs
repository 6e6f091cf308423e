use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use masterchef_core::scheduler::{CreateSchedule, Schedule};

use crate::{
    AppState,
    errors::{ApiJson, AppResult},
};

pub async fn list_schedules(State(state): State<AppState>) -> Json<Vec<Schedule>> {
    Json(state.control().scheduler().list())
}

pub async fn create_schedule(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CreateSchedule>,
) -> AppResult<(StatusCode, Json<Schedule>)> {
    let schedule = state.control().scheduler().create(request)?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

pub async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Schedule>> {
    Ok(Json(state.control().scheduler().get(&id)?))
}

pub async fn enable_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Schedule>> {
    Ok(Json(state.control().scheduler().enable(&id)?))
}

pub async fn disable_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Schedule>> {
    Ok(Json(state.control().scheduler().disable(&id)?))
}
