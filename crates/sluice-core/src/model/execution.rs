use crate::model::{ErrorDetail, ExecutionStatus, NodeStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hot-store record for one execution of a workflow, bound one-to-one to
/// its definition at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub timeout_seconds: Option<f64>,
}

impl ExecutionRecord {
    pub fn new(workflow_id: Uuid, timeout_seconds: Option<f64>) -> Self {
        Self {
            execution_id: Uuid::now_v7(),
            workflow_id,
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            timeout_seconds,
        }
    }

    pub fn timed_out_at(&self, now: DateTime<Utc>) -> bool {
        if self.status != ExecutionStatus::Running {
            return false;
        }
        match (self.timeout_seconds, self.started_at) {
            (Some(timeout), Some(started_at)) => {
                (now - started_at).num_milliseconds() as f64 / 1_000.0 > timeout
            }
            _ => false,
        }
    }
}

/// Per-node hot state, keyed by `(execution_id, node_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub status: NodeStatus,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<ErrorDetail>,
}

impl NodeRecord {
    pub fn waiting() -> Self {
        Self {
            status: NodeStatus::Waiting,
            retry_count: 0,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

/// Extra fields applied atomically with a successful status CAS.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeUpdate {
    pub retry_count: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<ErrorDetail>,
}

impl NodeUpdate {
    pub fn started(now: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(now),
            ..Self::default()
        }
    }

    pub fn finished(now: DateTime<Utc>) -> Self {
        Self {
            finished_at: Some(now),
            ..Self::default()
        }
    }

    pub fn failed(now: DateTime<Utc>, error: ErrorDetail) -> Self {
        Self {
            finished_at: Some(now),
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn apply(&self, record: &mut NodeRecord) {
        if let Some(retry_count) = self.retry_count {
            record.retry_count = retry_count;
        }
        if let Some(started_at) = self.started_at {
            record.started_at = Some(started_at);
        }
        if let Some(finished_at) = self.finished_at {
            record.finished_at = Some(finished_at);
        }
        if let Some(error) = &self.error {
            record.error = Some(error.clone());
        }
    }
}
