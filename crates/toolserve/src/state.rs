use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use toolserve_core::{ExecutionStatusTable, ToolEngine};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ToolEngine>,
    pub executions: Arc<ExecutionStatusTable>,
    /// Permits for executions allowed to run at once
    pub admission: Arc<Semaphore>,
    /// Configuration document as loaded, echoed by `GET /`
    pub document: Arc<Value>,
}

impl AppState {
    pub fn new(engine: ToolEngine, document: Value, request_limit: usize) -> Self {
        Self {
            engine: Arc::new(engine),
            executions: Arc::new(ExecutionStatusTable::new()),
            admission: Arc::new(Semaphore::new(request_limit)),
            document: Arc::new(document),
        }
    }
}
