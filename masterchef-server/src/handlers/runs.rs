use axum::{
    Json,
    extract::{Path, Query, State},
};
use masterchef_core::runner::RunRecord;
use serde::Deserialize;

use crate::{
    AppState,
    errors::{AppError, AppResult},
};

const DEFAULT_RUN_LIMIT: usize = 50;

#[derive(Debug, Default, Deserialize)]
pub struct RunListParams {
    pub limit: Option<usize>,
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<RunListParams>,
) -> AppResult<Json<Vec<RunRecord>>> {
    let store = state.control.state().clone();
    let limit = params.limit.unwrap_or(DEFAULT_RUN_LIMIT);
    let runs = tokio::task::spawn_blocking(move || store.list_runs(limit))
        .await
        .map_err(|err| AppError::internal(format!("run listing task failed: {err}")))??;
    Ok(Json(runs))
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<RunRecord>> {
    let store = state.control.state().clone();
    let run = tokio::task::spawn_blocking(move || store.load_run(&id))
        .await
        .map_err(|err| AppError::internal(format!("run lookup task failed: {err}")))??;
    Ok(Json(run))
}
