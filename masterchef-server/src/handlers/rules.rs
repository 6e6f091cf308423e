use std::collections::BTreeMap;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use masterchef_core::rules::{CreateRule, Rule};
use serde_json::Value;

use crate::{
    AppState,
    errors::{ApiJson, AppResult},
};

pub async fn list_rules(State(state): State<AppState>) -> Json<Vec<Rule>> {
    Json(state.control().rules().list())
}

pub async fn create_rule(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CreateRule>,
) -> AppResult<(StatusCode, Json<Rule>)> {
    let rule = state.control().rules().create(request)?;
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn get_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Rule>> {
    Ok(Json(state.control().rules().get(&id)?))
}

pub async fn enable_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Rule>> {
    Ok(Json(state.control().rules().set_enabled(&id, true)?))
}

pub async fn disable_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Rule>> {
    Ok(Json(state.control().rules().set_enabled(&id, false)?))
}

pub async fn list_flags(State(state): State<AppState>) -> Json<BTreeMap<String, Value>> {
    Json(state.control().rules().flags())
}
