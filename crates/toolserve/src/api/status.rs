use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use toolserve_core::ExecutionRecord;

use super::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct RootResponse {
    pub message: &'static str,
    pub configuration: Value,
}

pub async fn root(State(state): State<AppState>) -> Json<RootResponse> {
    tracing::info!("Root endpoint accessed.");
    Json(RootResponse {
        message: "API is running. Tool configuration loaded.",
        configuration: state.document.as_ref().clone(),
    })
}

pub async fn running_processes(State(state): State<AppState>) -> Json<Vec<(String, ExecutionRecord)>> {
    Json(state.executions.running().await)
}

pub async fn execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionRecord>, ApiError> {
    state
        .executions
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("No execution with id {id}")))
}
