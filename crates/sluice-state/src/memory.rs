use crate::store::{Fields, RateLimitDecision, StateStore, StreamMessage};
use crate::{StateError, keys};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde_json::Value;
use sluice_core::model::{ExecutionRecord, ExecutionStatus, NodeRecord, NodeStatus, NodeUpdate};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Approximate stream retention: entries beyond this are trimmed
    /// from the log (pending copies survive until acked).
    pub stream_max_len: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            stream_max_len: 100_000,
        }
    }
}

impl MemoryStoreConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(max_len) = std::env::var("SLUICE_STREAM_MAX_LEN")
            .ok()
            .and_then(|raw| raw.parse().ok())
        {
            config.stream_max_len = max_len;
        }
        config
    }
}

/// In-process implementation of the state-store façade: key-value state
/// with TTLs plus append-only streams with consumer groups and
/// pending-entry tracking. Backs the embedded runtime mode and the test
/// suite; a networked broker adapter slots in behind the same trait.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    publish_notify: Notify,
    config: MemoryStoreConfig,
}

#[derive(Default)]
struct Inner {
    executions: HashMap<String, Expiring<ExecutionRecord>>,
    nodes: HashMap<String, Expiring<NodeRecord>>,
    outputs: HashMap<String, Expiring<Value>>,
    idempotency: HashMap<String, DateTime<Utc>>,
    locks: HashMap<String, LockEntry>,
    rate_windows: HashMap<String, RateWindow>,
    streams: HashMap<String, Stream>,
}

struct Expiring<T> {
    value: T,
    expires_at: Option<DateTime<Utc>>,
}

impl<T> Expiring<T> {
    fn live(value: T) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct LockEntry {
    owner_token: String,
    expires_at: DateTime<Utc>,
}

struct RateWindow {
    count: u32,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Stream {
    next_id: u64,
    entries: VecDeque<StreamEntry>,
    groups: HashMap<String, Group>,
}

struct StreamEntry {
    id: u64,
    fields: Fields,
}

#[derive(Default)]
struct Group {
    last_delivered: u64,
    pending: HashMap<u64, PendingEntry>,
}

struct PendingEntry {
    consumer: String,
    fields: Fields,
    delivered_at: DateTime<Utc>,
    delivery_count: u32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            publish_notify: Notify::new(),
            config,
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("state mutex poisoned")
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn deliver(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        now: DateTime<Utc>,
    ) -> Vec<StreamMessage> {
        let stream = self.streams.entry(stream.to_string()).or_default();
        let group = stream.groups.entry(group.to_string()).or_default();

        let mut delivered = Vec::new();
        for entry in &stream.entries {
            if delivered.len() >= count {
                break;
            }
            if entry.id <= group.last_delivered {
                continue;
            }
            group.last_delivered = entry.id;
            group.pending.insert(
                entry.id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    fields: entry.fields.clone(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            delivered.push(StreamMessage {
                id: entry.id.to_string(),
                fields: entry.fields.clone(),
            });
        }
        delivered
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn execution_create(&self, record: &ExecutionRecord) -> Result<(), StateError> {
        let key = keys::execution_meta_key(record.execution_id);
        let mut inner = self.lock_inner();
        let now = Utc::now();
        if inner
            .executions
            .get(&key)
            .is_some_and(|existing| !existing.is_expired(now))
        {
            return Err(StateError::AlreadyExists(key));
        }
        inner.executions.insert(key, Expiring::live(record.clone()));
        Ok(())
    }

    async fn execution_get(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionRecord>, StateError> {
        let key = keys::execution_meta_key(execution_id);
        let inner = self.lock_inner();
        let now = Utc::now();
        Ok(inner
            .executions
            .get(&key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone()))
    }

    async fn execution_cas(
        &self,
        execution_id: Uuid,
        expected: ExecutionStatus,
        new: ExecutionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, StateError> {
        let key = keys::execution_meta_key(execution_id);
        let mut inner = self.lock_inner();
        let Some(entry) = inner.executions.get_mut(&key) else {
            return Ok(false);
        };
        if entry.is_expired(Utc::now()) || entry.value.status != expected {
            return Ok(false);
        }

        entry.value.status = new;
        if new == ExecutionStatus::Running && entry.value.started_at.is_none() {
            entry.value.started_at = Some(now);
        }
        if new.is_terminal() {
            entry.value.finished_at = Some(now);
        }
        Ok(true)
    }

    async fn execution_list_running(&self) -> Result<Vec<ExecutionRecord>, StateError> {
        let inner = self.lock_inner();
        let now = Utc::now();
        Ok(inner
            .executions
            .values()
            .filter(|entry| !entry.is_expired(now))
            .filter(|entry| entry.value.status == ExecutionStatus::Running)
            .map(|entry| entry.value.clone())
            .collect())
    }

    async fn node_seed(&self, execution_id: Uuid, node_ids: &[String]) -> Result<(), StateError> {
        let mut inner = self.lock_inner();
        for node_id in node_ids {
            inner.nodes.insert(
                keys::status_key(execution_id, node_id),
                Expiring::live(NodeRecord::waiting()),
            );
        }
        Ok(())
    }

    async fn node_get(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeRecord>, StateError> {
        let key = keys::status_key(execution_id, node_id);
        let inner = self.lock_inner();
        let now = Utc::now();
        Ok(inner
            .nodes
            .get(&key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone()))
    }

    async fn node_mget(
        &self,
        execution_id: Uuid,
        node_ids: &[&str],
    ) -> Result<HashMap<String, NodeRecord>, StateError> {
        let inner = self.lock_inner();
        let now = Utc::now();
        let mut result = HashMap::with_capacity(node_ids.len());
        for node_id in node_ids {
            let key = keys::status_key(execution_id, node_id);
            if let Some(entry) = inner.nodes.get(&key)
                && !entry.is_expired(now)
            {
                result.insert(node_id.to_string(), entry.value.clone());
            }
        }
        Ok(result)
    }

    async fn node_all(
        &self,
        execution_id: Uuid,
    ) -> Result<HashMap<String, NodeRecord>, StateError> {
        let prefix = keys::status_key(execution_id, "");
        let inner = self.lock_inner();
        let now = Utc::now();
        Ok(inner
            .nodes
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .filter_map(|(key, entry)| {
                key.strip_prefix(&prefix)
                    .map(|node_id| (node_id.to_string(), entry.value.clone()))
            })
            .collect())
    }

    async fn node_cas(
        &self,
        execution_id: Uuid,
        node_id: &str,
        expected: NodeStatus,
        new: NodeStatus,
        update: NodeUpdate,
    ) -> Result<bool, StateError> {
        // The store, not its callers, enforces the node state machine:
        // a CAS along an edge the machine does not admit never applies.
        if !expected.can_transition_to(new) {
            return Ok(false);
        }
        let key = keys::status_key(execution_id, node_id);
        let mut inner = self.lock_inner();
        let Some(entry) = inner.nodes.get_mut(&key) else {
            return Ok(false);
        };
        if entry.is_expired(Utc::now()) || entry.value.status != expected {
            return Ok(false);
        }

        entry.value.status = new;
        update.apply(&mut entry.value);
        Ok(true)
    }

    async fn output_put(
        &self,
        execution_id: Uuid,
        node_id: &str,
        output: &Value,
    ) -> Result<(), StateError> {
        let key = keys::output_key(execution_id, node_id);
        let mut inner = self.lock_inner();
        inner.outputs.insert(key, Expiring::live(output.clone()));
        Ok(())
    }

    async fn output_get(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<Value>, StateError> {
        let key = keys::output_key(execution_id, node_id);
        let inner = self.lock_inner();
        let now = Utc::now();
        Ok(inner
            .outputs
            .get(&key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone()))
    }

    async fn output_mget(
        &self,
        execution_id: Uuid,
        node_ids: &[&str],
    ) -> Result<HashMap<String, Value>, StateError> {
        let inner = self.lock_inner();
        let now = Utc::now();
        let mut result = HashMap::with_capacity(node_ids.len());
        for node_id in node_ids {
            let key = keys::output_key(execution_id, node_id);
            if let Some(entry) = inner.outputs.get(&key)
                && !entry.is_expired(now)
            {
                result.insert(node_id.to_string(), entry.value.clone());
            }
        }
        Ok(result)
    }

    async fn idempotency_seen(&self, fingerprint: &str) -> Result<bool, StateError> {
        let key = keys::idempotency_key(fingerprint);
        let mut inner = self.lock_inner();
        let now = Utc::now();
        if inner.idempotency.get(&key).is_some_and(|at| *at <= now) {
            inner.idempotency.remove(&key);
        }
        Ok(inner.idempotency.contains_key(&key))
    }

    async fn idempotency_try_claim(
        &self,
        fingerprint: &str,
        ttl: Duration,
    ) -> Result<bool, StateError> {
        let key = keys::idempotency_key(fingerprint);
        let mut inner = self.lock_inner();
        let now = Utc::now();
        if inner.idempotency.get(&key).is_some_and(|at| *at <= now) {
            inner.idempotency.remove(&key);
        }
        if inner.idempotency.contains_key(&key) {
            return Ok(false);
        }
        inner.idempotency.insert(key, now + to_chrono(ttl));
        Ok(true)
    }

    async fn lock_acquire(
        &self,
        key: &str,
        owner_token: &str,
        ttl: Duration,
    ) -> Result<bool, StateError> {
        let mut inner = self.lock_inner();
        let now = Utc::now();
        if inner
            .locks
            .get(key)
            .is_some_and(|entry| entry.expires_at <= now)
        {
            inner.locks.remove(key);
        }
        if inner.locks.contains_key(key) {
            return Ok(false);
        }
        inner.locks.insert(
            key.to_string(),
            LockEntry {
                owner_token: owner_token.to_string(),
                expires_at: now + to_chrono(ttl),
            },
        );
        Ok(true)
    }

    async fn lock_release(&self, key: &str, owner_token: &str) -> Result<bool, StateError> {
        let mut inner = self.lock_inner();
        let now = Utc::now();
        match inner.locks.get(key) {
            Some(entry) if entry.expires_at <= now => {
                inner.locks.remove(key);
                Ok(false)
            }
            Some(entry) if entry.owner_token == owner_token => {
                inner.locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn rate_window_incr(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
    ) -> Result<RateLimitDecision, StateError> {
        let window_seconds = window.as_secs().max(1) as i64;
        let now = Utc::now();
        let window_start = now.timestamp() / window_seconds * window_seconds;
        let window_key = keys::rate_key(key, window_start);
        let reset_at = Utc
            .timestamp_opt(window_start + window_seconds, 0)
            .single()
            .unwrap_or(now);

        let mut inner = self.lock_inner();
        inner.rate_windows.retain(|_, entry| entry.expires_at > now);
        let entry = inner
            .rate_windows
            .entry(window_key)
            .or_insert_with(|| RateWindow {
                count: 0,
                expires_at: reset_at,
            });
        entry.count += 1;

        Ok(RateLimitDecision {
            allowed: entry.count <= limit,
            remaining: limit.saturating_sub(entry.count),
            reset_at,
        })
    }

    async fn expire_terminal(
        &self,
        execution_id: Uuid,
        node_ids: &[String],
        ttl: Duration,
    ) -> Result<(), StateError> {
        let expires_at = Utc::now() + to_chrono(ttl);
        let mut inner = self.lock_inner();

        let meta_key = keys::execution_meta_key(execution_id);
        if let Some(entry) = inner.executions.get_mut(&meta_key) {
            entry.expires_at = Some(expires_at);
        }
        for node_id in node_ids {
            if let Some(entry) = inner.nodes.get_mut(&keys::status_key(execution_id, node_id)) {
                entry.expires_at = Some(expires_at);
            }
            if let Some(entry) = inner.outputs.get_mut(&keys::output_key(execution_id, node_id)) {
                entry.expires_at = Some(expires_at);
            }
        }
        Ok(())
    }

    async fn stream_publish(&self, stream: &str, fields: Fields) -> Result<String, StateError> {
        let id = {
            let mut inner = self.lock_inner();
            let max_len = self.config.stream_max_len;
            let stream = inner.streams.entry(stream.to_string()).or_default();
            stream.next_id += 1;
            let id = stream.next_id;
            stream.entries.push_back(StreamEntry {
                id,
                fields,
            });
            while stream.entries.len() > max_len {
                stream.entries.pop_front();
            }
            id
        };
        self.publish_notify.notify_waiters();
        Ok(id.to_string())
    }

    async fn stream_consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, StateError> {
        let deadline = Instant::now() + block;
        loop {
            // Register interest before checking state so a publish that
            // lands between the check and the await still wakes us.
            let notified = self.publish_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let delivered = {
                let mut inner = self.lock_inner();
                inner.deliver(stream, group, consumer, count, Utc::now())
            };
            if !delivered.is_empty() || block.is_zero() {
                return Ok(delivered);
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn stream_ack(
        &self,
        stream: &str,
        group: &str,
        ids: &[String],
    ) -> Result<(), StateError> {
        let mut inner = self.lock_inner();
        let Some(stream) = inner.streams.get_mut(stream) else {
            return Ok(());
        };
        let Some(group) = stream.groups.get_mut(group) else {
            return Ok(());
        };
        for id in ids {
            if let Ok(id) = id.parse::<u64>() {
                group.pending.remove(&id);
            }
        }
        Ok(())
    }

    async fn stream_reclaim(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StateError> {
        let now = Utc::now();
        let min_idle = to_chrono(min_idle);
        let mut inner = self.lock_inner();
        let Some(stream) = inner.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(group) = stream.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let mut idle_ids: Vec<u64> = group
            .pending
            .iter()
            .filter(|(_, pending)| now - pending.delivered_at >= min_idle)
            .map(|(id, _)| *id)
            .collect();
        idle_ids.sort_unstable();
        idle_ids.truncate(count);

        let mut reclaimed = Vec::with_capacity(idle_ids.len());
        for id in idle_ids {
            let pending = group
                .pending
                .get_mut(&id)
                .expect("id collected from pending set");
            pending.consumer = new_consumer.to_string();
            pending.delivered_at = now;
            pending.delivery_count += 1;
            reclaimed.push(StreamMessage {
                id: id.to_string(),
                fields: pending.fields.clone(),
            });
        }
        Ok(reclaimed)
    }

    async fn stream_len(&self, stream: &str) -> Result<usize, StateError> {
        let inner = self.lock_inner();
        Ok(inner
            .streams
            .get(stream)
            .map_or(0, |stream| stream.entries.len()))
    }
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::zero())
}
