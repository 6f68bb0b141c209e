//! Hot-store key namespace. Every ephemeral key the engine writes is
//! built here so the layout stays in one place.

use uuid::Uuid;

pub fn status_key(execution_id: Uuid, node_id: &str) -> String {
    format!("status:{execution_id}:{node_id}")
}

pub fn output_key(execution_id: Uuid, node_id: &str) -> String {
    format!("output:{execution_id}:{node_id}")
}

pub fn execution_meta_key(execution_id: Uuid) -> String {
    format!("meta:execution:{execution_id}")
}

pub fn idempotency_key(fingerprint: &str) -> String {
    format!("idempotency:{fingerprint}")
}

/// Fan-in serialization lock for dispatching one child of one execution.
pub fn eval_lock_key(execution_id: Uuid, node_id: &str) -> String {
    format!("lock:eval:{execution_id}:{node_id}")
}

pub fn rate_key(key: &str, window_start: i64) -> String {
    format!("rate_limit:{key}:{window_start}")
}
