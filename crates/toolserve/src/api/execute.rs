use axum::{extract::State, http::StatusCode, Extension, Json};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::OwnedSemaphorePermit;
use tracing::Instrument;
use toolserve_core::{ExecutionRequest, ExecutionResult};

use super::error::ApiError;
use crate::request_id::RequestId;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub execution_id: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub tool_directory: String,
    pub working_directory: String,
    pub command: String,
    pub output_variables: Map<String, Value>,
}

impl ExecuteResponse {
    fn new(execution_id: String, result: ExecutionResult) -> Self {
        Self {
            execution_id,
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            tool_directory: result.tool_directory.display().to_string(),
            working_directory: result.working_directory.display().to_string(),
            command: result.command,
            output_variables: result.output_variables,
        }
    }
}

/// Run the request to completion on its own task.
///
/// The handler only awaits the task; a client that disconnects does not
/// cancel the run.
pub async fn execute_tool(
    State(state): State<AppState>,
    Extension(id): Extension<RequestId>,
    Json(request): Json<ExecutionRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let Ok(permit) = state.admission.clone().try_acquire_owned() else {
        tracing::warn!("Request limit reached, rejecting execution");
        return Err(
            ApiError::too_many_requests("Too many executions in progress. Try again later.")
                .with_execution_id(id.as_str()),
        );
    };

    let task = tokio::spawn(run_execution(state, id.clone(), request, permit).in_current_span());
    let result = match task.await {
        Ok(outcome) => outcome?,
        Err(err) => {
            tracing::error!(error = %err, "Execution task did not finish");
            return Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Execution task failed")
                .with_execution_id(id.as_str()));
        }
    };

    Ok(Json(ExecuteResponse::new(id.0, result)))
}

async fn run_execution(
    state: AppState,
    id: RequestId,
    request: ExecutionRequest,
    _permit: OwnedSemaphorePermit,
) -> Result<ExecutionResult, ApiError> {
    state.executions.start(id.as_str(), request.inputs.clone()).await;

    let result = match state.engine.execute(&request).await {
        Ok(result) => result,
        Err(failure) => {
            tracing::error!(stage = %failure.stage, "Error during tool execution: {}", failure.error);
            state.executions.fail(id.as_str(), &failure).await;
            return Err(ApiError::from(failure).with_execution_id(id.as_str()));
        }
    };

    state.executions.complete(id.as_str(), &result).await;

    if let Some(err) = ApiError::from_outcome(result.outcome, &result.stderr) {
        tracing::error!(exit_code = result.exit_code, "Tool did not run to completion: {}", result.stderr);
        return Err(err.with_execution_id(id.as_str()));
    }

    Ok(result)
}
