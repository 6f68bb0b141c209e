use crate::StateError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sluice_core::model::{ExecutionRecord, ExecutionStatus, NodeRecord, NodeStatus, NodeUpdate};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// One entry read from a stream: broker-assigned id plus flat string
/// field pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: String,
    pub fields: Fields,
}

pub type Fields = Vec<(String, String)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// Narrow façade over the hot key-value broker with stream semantics.
///
/// Everything the engine mutates concurrently goes through here, and the
/// store rather than its callers enforces the atomicity invariants:
/// status transitions are compare-and-set, lock release checks the owner
/// token, ephemeral keys carry a best-effort TTL.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn execution_create(&self, record: &ExecutionRecord) -> Result<(), StateError>;

    async fn execution_get(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionRecord>, StateError>;

    /// Compare-and-set on the overall execution status. Stamps
    /// `started_at` when moving to `Running` and `finished_at` when
    /// moving to a terminal status.
    async fn execution_cas(
        &self,
        execution_id: Uuid,
        expected: ExecutionStatus,
        new: ExecutionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, StateError>;

    async fn execution_list_running(&self) -> Result<Vec<ExecutionRecord>, StateError>;

    /// Seeds per-node state for a fresh execution: every node `Waiting`.
    async fn node_seed(&self, execution_id: Uuid, node_ids: &[String]) -> Result<(), StateError>;

    async fn node_get(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeRecord>, StateError>;

    /// Multi-get in a single round-trip; absent nodes are omitted from
    /// the result map.
    async fn node_mget(
        &self,
        execution_id: Uuid,
        node_ids: &[&str],
    ) -> Result<HashMap<String, NodeRecord>, StateError>;

    async fn node_all(
        &self,
        execution_id: Uuid,
    ) -> Result<HashMap<String, NodeRecord>, StateError>;

    /// Atomic compare-and-set on a node status; `update` is applied only
    /// when the CAS succeeds.
    async fn node_cas(
        &self,
        execution_id: Uuid,
        node_id: &str,
        expected: NodeStatus,
        new: NodeStatus,
        update: NodeUpdate,
    ) -> Result<bool, StateError>;

    async fn output_put(
        &self,
        execution_id: Uuid,
        node_id: &str,
        output: &Value,
    ) -> Result<(), StateError>;

    async fn output_get(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<Value>, StateError>;

    /// Multi-get of node outputs in a single round-trip; nodes without
    /// an output are omitted.
    async fn output_mget(
        &self,
        execution_id: Uuid,
        node_ids: &[&str],
    ) -> Result<HashMap<String, Value>, StateError>;

    async fn idempotency_seen(&self, fingerprint: &str) -> Result<bool, StateError>;

    /// Set-if-absent with TTL; true iff this caller claimed the mark.
    async fn idempotency_try_claim(
        &self,
        fingerprint: &str,
        ttl: Duration,
    ) -> Result<bool, StateError>;

    async fn lock_acquire(
        &self,
        key: &str,
        owner_token: &str,
        ttl: Duration,
    ) -> Result<bool, StateError>;

    /// Check-and-delete: releases only if the lock still holds
    /// `owner_token`, so a holder that outlived its TTL cannot release a
    /// successor's lock.
    async fn lock_release(&self, key: &str, owner_token: &str) -> Result<bool, StateError>;

    async fn rate_window_incr(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
    ) -> Result<RateLimitDecision, StateError>;

    /// Applies the terminal-state TTL to every per-execution key so hot
    /// state drains out of the store on its own.
    async fn expire_terminal(
        &self,
        execution_id: Uuid,
        node_ids: &[String],
        ttl: Duration,
    ) -> Result<(), StateError>;

    async fn stream_publish(&self, stream: &str, fields: Fields) -> Result<String, StateError>;

    /// Reads up to `count` undelivered entries for `consumer` in
    /// `group`, blocking up to `block` when the stream is drained.
    /// Delivered entries move to the group's pending list until acked.
    async fn stream_consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, StateError>;

    async fn stream_ack(&self, stream: &str, group: &str, ids: &[String])
    -> Result<(), StateError>;

    /// Takes ownership of pending entries idle for at least `min_idle`,
    /// reassigning them to `new_consumer` and resetting their idle clock.
    async fn stream_reclaim(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StateError>;

    async fn stream_len(&self, stream: &str) -> Result<usize, StateError>;
}
