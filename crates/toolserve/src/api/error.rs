use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use toolserve_core::{ErrorCategory, ExecutionFailure, ExecutionStage, InvocationOutcome};

/// Error response body: `{"detail", "stage", "execution_id"}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ApiErrorBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiErrorBody {
    pub detail: String,
    pub stage: Option<ExecutionStage>,
    pub execution_id: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            body: ApiErrorBody {
                detail: detail.into(),
                stage: None,
                execution_id: None,
            },
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    pub fn too_many_requests(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, detail)
    }

    #[must_use]
    pub fn with_stage(mut self, stage: ExecutionStage) -> Self {
        self.body.stage = Some(stage);
        self
    }

    #[must_use]
    pub fn with_execution_id(mut self, id: impl Into<String>) -> Self {
        self.body.execution_id = Some(id.into());
        self
    }

    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Response for a run that ended with a sentinel outcome
    pub fn from_outcome(outcome: InvocationOutcome, detail: impl Into<String>) -> Option<Self> {
        let status = status_for_outcome(outcome)?;
        Some(Self::new(status, detail).with_stage(ExecutionStage::InvokingProcess))
    }
}

pub const fn status_for_outcome(outcome: InvocationOutcome) -> Option<StatusCode> {
    match outcome {
        InvocationOutcome::Exited => None,
        InvocationOutcome::TimedOut => Some(StatusCode::REQUEST_TIMEOUT),
        InvocationOutcome::PermissionDenied => Some(StatusCode::FORBIDDEN),
    }
}

pub const fn status_for_category(category: ErrorCategory) -> StatusCode {
    match category {
        ErrorCategory::Request => StatusCode::BAD_REQUEST,
        ErrorCategory::Environment | ErrorCategory::Script | ErrorCategory::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<ExecutionFailure> for ApiError {
    fn from(failure: ExecutionFailure) -> Self {
        Self::new(status_for_category(failure.error.category()), failure.error.to_string())
            .with_stage(failure.stage)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolserve_core::{Error, PartialExecution};

    #[test]
    fn sentinel_outcomes_map_to_statuses() {
        assert_eq!(status_for_outcome(InvocationOutcome::Exited), None);
        assert_eq!(
            status_for_outcome(InvocationOutcome::TimedOut),
            Some(StatusCode::REQUEST_TIMEOUT)
        );
        assert_eq!(
            status_for_outcome(InvocationOutcome::PermissionDenied),
            Some(StatusCode::FORBIDDEN)
        );

        let err = ApiError::from_outcome(InvocationOutcome::PermissionDenied, "Permission denied")
            .unwrap();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.body.stage, Some(ExecutionStage::InvokingProcess));
    }

    #[test]
    fn failures_map_by_category() {
        let failure = ExecutionFailure {
            stage: ExecutionStage::Validating,
            error: Error::EmptyInput { name: "x".into() },
            partial: PartialExecution::default(),
        };
        let err = ApiError::from(failure).with_execution_id("0a1b2c3d");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.body.detail, "Input value for x is empty.");
        assert_eq!(err.body.execution_id.as_deref(), Some("0a1b2c3d"));

        assert_eq!(
            status_for_category(ErrorCategory::Script),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for_category(ErrorCategory::Environment),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
