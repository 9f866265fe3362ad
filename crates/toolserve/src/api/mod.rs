mod error;
mod execute;
mod status;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::request_id;
use crate::state::AppState;

pub use error::ApiError;
pub use execute::ExecuteResponse;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(status::root))
        .route("/running-processes/", get(status::running_processes))
        .route("/running-processes", get(status::running_processes))
        .route("/executions/{id}", get(status::execution))
        .route("/execute-tool/", post(execute::execute_tool))
        .route("/execute-tool", post(execute::execute_tool))
        .layer(middleware::from_fn(request_id::assign))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
