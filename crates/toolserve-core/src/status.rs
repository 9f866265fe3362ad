use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::engine::{ExecutionFailure, ExecutionResult, ExecutionStage};
use crate::invoke::InvocationOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

/// What is known about one execution, keyed by request id
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub inputs: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<ExecutionStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Process-lifetime table of executions
#[derive(Debug, Default)]
pub struct ExecutionStatusTable {
    records: RwLock<HashMap<String, ExecutionRecord>>,
}

impl ExecutionStatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start(&self, id: &str, inputs: Map<String, Value>) {
        let record = ExecutionRecord {
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            inputs,
            result: None,
            stage: None,
            error: None,
        };
        self.records.write().await.insert(id.to_string(), record);
    }

    /// Record a finished run. Sentinel outcomes count as failed.
    pub async fn complete(&self, id: &str, result: &ExecutionResult) {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(id) else {
            tracing::warn!(execution_id = id, "Completed execution was never started");
            return;
        };
        record.finished_at = Some(Utc::now());
        if result.outcome == InvocationOutcome::Exited {
            record.status = ExecutionStatus::Completed;
            record.stage = Some(ExecutionStage::Completed);
        } else {
            record.status = ExecutionStatus::Failed;
            record.stage = Some(ExecutionStage::InvokingProcess);
            record.error = Some(result.stderr.clone());
        }
        record.result = Some(result.clone());
    }

    pub async fn fail(&self, id: &str, failure: &ExecutionFailure) {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(id) else {
            tracing::warn!(execution_id = id, "Failed execution was never started");
            return;
        };
        record.status = ExecutionStatus::Failed;
        record.finished_at = Some(Utc::now());
        record.stage = Some(failure.stage);
        record.error = Some(failure.error.to_string());
    }

    /// Executions still running, oldest first
    pub async fn running(&self) -> Vec<(String, ExecutionRecord)> {
        let records = self.records.read().await;
        let mut running: Vec<_> = records
            .iter()
            .filter(|(_, record)| record.status == ExecutionStatus::Running)
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect();
        running.sort_by_key(|(_, record)| record.started_at);
        running
    }

    pub async fn get(&self, id: &str) -> Option<ExecutionRecord> {
        self.records.read().await.get(id).cloned()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}
