use crate::model::ErrorDetail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A task that exhausted its retry budget (or failed in a way retries
/// cannot fix), parked for operator inspection. Entries are append-only
/// and removed only by explicit operator action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub entry_id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub handler: String,
    pub original_config: Value,
    pub resolved_config: Value,
    pub error: ErrorDetail,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        execution_id: Uuid,
        node_id: impl Into<String>,
        handler: impl Into<String>,
        original_config: Value,
        resolved_config: Value,
        error: ErrorDetail,
        retry_count: u32,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            execution_id,
            node_id: node_id.into(),
            handler: handler.into(),
            original_config,
            resolved_config,
            error,
            retry_count,
            created_at: Utc::now(),
        }
    }
}
