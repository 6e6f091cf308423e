use axum::{Json, extract::State};
use masterchef_core::query::{QueryRequest, QueryResponse};
use serde_json::{Value, json};

use crate::{
    AppState,
    errors::{ApiJson, AppResult},
};

pub async fn run_query(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<QueryRequest>,
) -> AppResult<Json<QueryResponse>> {
    Ok(Json(state.control().query().query(&request)?))
}

pub async fn list_entities(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "entities": state.control().query().entities() }))
}
