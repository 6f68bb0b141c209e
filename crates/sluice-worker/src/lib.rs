mod breakers;
mod registry;

pub use breakers::BreakerSet;
pub use registry::{HandlerError, HandlerFuture, HandlerRegistry, TaskHandler, handler};

use chrono::Utc;
use sha2::{Digest, Sha256};
use sluice_core::breaker::BreakerConfig;
use sluice_core::model::{DeadLetterEntry, ErrorCategory, ErrorDetail, ExecutionStatus, NodeStatus, NodeUpdate};
use sluice_core::retry::{RetryPolicy, backoff_delay};
use sluice_protocol::{
    COMPLETIONS_STREAM, CompletionMessage, ProtocolError, TASKS_STREAM, TaskMessage, WORKER_GROUP,
};
use sluice_state::{DefinitionStore, DlqStore, StateError, StateStore, StreamMessage};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error("worker shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub consumer_name: String,
    pub batch_size: usize,
    pub block: Duration,
    pub max_retries: u32,
    pub retry: RetryPolicy,
    pub handler_timeout: Duration,
    pub idempotency_ttl: Duration,
    pub breaker: BreakerConfig,
    pub error_pause: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consumer_name: format!("worker-{}", short_id()),
            batch_size: 10,
            block: Duration::from_millis(2_000),
            max_retries: 4,
            retry: RetryPolicy::default(),
            handler_timeout: Duration::from_secs(60),
            idempotency_ttl: Duration::from_secs(3_600),
            breaker: BreakerConfig::default(),
            error_pause: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    /// Defaults overridden by `SLUICE_WORKER_*` environment variables
    /// where present.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(max_retries) = env_parse("SLUICE_WORKER_MAX_RETRIES") {
            config.max_retries = max_retries;
        }
        if let Some(base_ms) = env_parse("SLUICE_WORKER_RETRY_BASE_MS") {
            config.retry.base_ms = base_ms;
        }
        if let Some(cap_ms) = env_parse("SLUICE_WORKER_RETRY_CAP_MS") {
            config.retry.cap_ms = cap_ms;
        }
        if let Some(jitter_ms) = env_parse("SLUICE_WORKER_RETRY_JITTER_MS") {
            config.retry.jitter_ms = jitter_ms;
        }
        if let Some(timeout_secs) = env_parse("SLUICE_WORKER_HANDLER_TIMEOUT_SECONDS") {
            config.handler_timeout = Duration::from_secs(timeout_secs);
        }
        if let Some(batch_size) = env_parse("SLUICE_WORKER_BATCH_SIZE") {
            config.batch_size = batch_size;
        }
        if let Some(block_ms) = env_parse("SLUICE_WORKER_BLOCK_MS") {
            config.block = Duration::from_millis(block_ms);
        }
        if let Some(threshold) = env_parse("SLUICE_WORKER_CB_THRESHOLD") {
            config.breaker.failure_threshold = threshold;
        }
        if let Some(open_secs) = env_parse::<u64>("SLUICE_WORKER_CB_OPEN_TIMEOUT_SECONDS") {
            config.breaker.open_timeout_ms = open_secs * 1_000;
        }
        if let Some(ttl_secs) = env_parse("SLUICE_WORKER_IDEMPOTENCY_TTL_SECONDS") {
            config.idempotency_ttl = Duration::from_secs(ttl_secs);
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|raw| raw.parse().ok())
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Logical-attempt fingerprint for idempotency marks. The mark is
/// claimed only after the attempt's completion is published, so a
/// reclaimed in-flight attempt is re-runnable while a finished one is
/// deduplicated across the whole fleet.
pub fn task_fingerprint(execution_id: Uuid, node_id: &str, retry_count: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{execution_id}:{node_id}:{retry_count}"));
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

/// A worker replica: consumes tasks from the shared consumer group and
/// runs handlers through the idempotency, circuit-breaker, retry, and
/// dead-letter pipeline.
pub struct Worker {
    state: Arc<dyn StateStore>,
    definitions: Arc<dyn DefinitionStore>,
    dlq: Arc<dyn DlqStore>,
    registry: HandlerRegistry,
    breakers: BreakerSet,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        state: Arc<dyn StateStore>,
        definitions: Arc<dyn DefinitionStore>,
        dlq: Arc<dyn DlqStore>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            state,
            definitions,
            dlq,
            registry: HandlerRegistry::new(),
            breakers: BreakerSet::new(config.breaker),
            config,
        }
    }

    pub fn registry_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.registry
    }

    /// Runs until `shutdown` flips to true. In-flight handlers finish
    /// (or hit their timeout) before exit; anything unacknowledged is
    /// reclaimed by the reaper.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        info!(consumer = %self.config.consumer_name, "worker starting");
        let in_task_shutdown = shutdown.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                consumed = self.state.stream_consume(
                    TASKS_STREAM,
                    WORKER_GROUP,
                    &self.config.consumer_name,
                    self.config.batch_size,
                    self.config.block,
                ) => {
                    match consumed {
                        Ok(messages) => {
                            futures::future::join_all(
                                messages.iter().map(|message| {
                                    self.process_stream_message(message, &in_task_shutdown)
                                }),
                            )
                            .await;
                        }
                        Err(err) => {
                            error!(error = %err, "task consume failed, backing off");
                            tokio::time::sleep(self.config.error_pause).await;
                        }
                    }
                }
            }
        }
        info!(consumer = %self.config.consumer_name, "worker shutdown complete");
        Ok(())
    }

    /// Decodes and runs one task, acknowledging unless the message must
    /// survive for redelivery (future schema version, store failure,
    /// shutdown mid-backoff).
    pub async fn process_stream_message(
        &self,
        message: &StreamMessage,
        shutdown: &watch::Receiver<bool>,
    ) {
        let task = match TaskMessage::from_fields(&message.fields) {
            Ok(task) => task,
            Err(ProtocolError::UnsupportedSchemaVersion { found, supported }) => {
                warn!(
                    id = %message.id,
                    found,
                    supported,
                    "task from a future schema version, leaving unacknowledged"
                );
                return;
            }
            Err(err) => {
                error!(id = %message.id, error = %err, "undecodable task, acknowledging");
                self.ack(&message.id).await;
                return;
            }
        };

        match self.process_task(&task, shutdown).await {
            Ok(()) => self.ack(&message.id).await,
            Err(err) => {
                warn!(
                    execution_id = %task.execution_id,
                    node_id = %task.node_id,
                    error = %err,
                    "task left unacknowledged for redelivery"
                );
            }
        }
    }

    async fn ack(&self, id: &str) {
        if let Err(err) = self
            .state
            .stream_ack(TASKS_STREAM, WORKER_GROUP, &[id.to_string()])
            .await
        {
            error!(id, error = %err, "task ack failed");
        }
    }

    /// The per-task pipeline. `Ok(())` means the message may be
    /// acknowledged.
    pub async fn process_task(
        &self,
        task: &TaskMessage,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), WorkerError> {
        let fingerprint = task_fingerprint(task.execution_id, &task.node_id, task.retry_count);
        if self.state.idempotency_seen(&fingerprint).await? {
            debug!(
                execution_id = %task.execution_id,
                node_id = %task.node_id,
                retry_count = task.retry_count,
                "attempt already completed elsewhere, skipping"
            );
            return Ok(());
        }

        let Some(execution) = self.state.execution_get(task.execution_id).await? else {
            warn!(execution_id = %task.execution_id, "task for unknown or expired execution");
            return Ok(());
        };
        if execution.status == ExecutionStatus::Cancelled {
            info!(execution_id = %task.execution_id, node_id = %task.node_id, "execution cancelled, dropping task");
            return Ok(());
        }

        let now = Utc::now();
        let started = self
            .state
            .node_cas(
                task.execution_id,
                &task.node_id,
                NodeStatus::Pending,
                NodeStatus::Running,
                NodeUpdate::started(now),
            )
            .await?;
        if !started {
            match self.state.node_get(task.execution_id, &task.node_id).await? {
                // The previous owner of this attempt died after its CAS;
                // the reaper handed the message to us. Resume it.
                Some(record) if record.status == NodeStatus::Running => {
                    debug!(
                        execution_id = %task.execution_id,
                        node_id = %task.node_id,
                        "resuming reclaimed in-flight attempt"
                    );
                }
                other => {
                    debug!(
                        execution_id = %task.execution_id,
                        node_id = %task.node_id,
                        status = ?other.map(|record| record.status),
                        "node not runnable, dropping task"
                    );
                    return Ok(());
                }
            }
        }

        let Some(task_handler) = self.registry.get(&task.handler) else {
            let error = ErrorDetail::new(
                ErrorCategory::Validation,
                format!("no handler registered for {}", task.handler),
            );
            return self.dead_letter(task, error).await;
        };
        let task_handler = Arc::clone(task_handler);

        if !self.breakers.allow_call(&task.handler, now) {
            // The call never happened, so the breaker is not fed; the
            // failure still consumes retry budget.
            let error = ErrorDetail::new(
                ErrorCategory::CircuitOpen,
                format!("circuit open for handler {}", task.handler),
            );
            return self.handle_failure(task, error, shutdown).await;
        }

        debug!(
            execution_id = %task.execution_id,
            node_id = %task.node_id,
            handler = %task.handler,
            retry_count = task.retry_count,
            "running handler"
        );
        let outcome = self.invoke(task_handler, task.resolved_config.clone()).await;

        match outcome {
            Ok(output) => {
                self.breakers.record_success(&task.handler);

                // Cancellation may have landed while the handler ran;
                // its outcome is discarded rather than published.
                let cancelled = self
                    .state
                    .execution_get(task.execution_id)
                    .await?
                    .is_some_and(|execution| execution.status == ExecutionStatus::Cancelled);
                if cancelled {
                    info!(
                        execution_id = %task.execution_id,
                        node_id = %task.node_id,
                        "execution cancelled mid-flight, discarding output"
                    );
                    return Ok(());
                }

                self.state
                    .output_put(task.execution_id, &task.node_id, &output)
                    .await?;
                let completion =
                    CompletionMessage::completed(task.execution_id, &task.node_id, Some(output));
                self.state
                    .stream_publish(COMPLETIONS_STREAM, completion.to_fields())
                    .await?;
                self.state
                    .idempotency_try_claim(&fingerprint, self.config.idempotency_ttl)
                    .await?;
                info!(
                    execution_id = %task.execution_id,
                    node_id = %task.node_id,
                    handler = %task.handler,
                    "task completed"
                );
                Ok(())
            }
            Err(error) => {
                self.breakers.record_failure(&task.handler, Utc::now());
                self.handle_failure(task, error, shutdown).await
            }
        }
    }

    async fn invoke(&self, task_handler: TaskHandler, config: Value) -> Result<Value, ErrorDetail> {
        let handle = tokio::spawn(task_handler(config));
        let abort = handle.abort_handle();
        match tokio::time::timeout(self.config.handler_timeout, handle).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(err))) => Err(classify(err)),
            Ok(Err(join_error)) => Err(ErrorDetail::new(
                ErrorCategory::Unknown,
                format!("handler aborted: {join_error}"),
            )),
            Err(_) => {
                abort.abort();
                Err(ErrorDetail::new(
                    ErrorCategory::Timeout,
                    format!(
                        "handler exceeded {}s deadline",
                        self.config.handler_timeout.as_secs_f64()
                    ),
                ))
            }
        }
    }

    async fn handle_failure(
        &self,
        task: &TaskMessage,
        error: ErrorDetail,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), WorkerError> {
        let next_retry_count = task.retry_count + 1;
        if error.retryable && next_retry_count <= self.config.max_retries {
            let delay = backoff_delay(task.retry_count, &self.config.retry);
            info!(
                execution_id = %task.execution_id,
                node_id = %task.node_id,
                retry_count = next_retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %error.message,
                "retrying after backoff"
            );

            let mut shutdown = shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    // Leave the message pending; the reaper re-delivers
                    // the original attempt after restart.
                    return Err(WorkerError::ShuttingDown);
                }
            }

            // Hand the node back before republishing so the next
            // attempt's Pending -> Running CAS can succeed.
            let reset = self
                .state
                .node_cas(
                    task.execution_id,
                    &task.node_id,
                    NodeStatus::Running,
                    NodeStatus::Pending,
                    NodeUpdate::default().with_retry_count(next_retry_count),
                )
                .await?;
            if !reset {
                debug!(
                    execution_id = %task.execution_id,
                    node_id = %task.node_id,
                    "node advanced elsewhere during backoff, dropping retry"
                );
                return Ok(());
            }

            let next = TaskMessage::new(
                task.execution_id,
                &task.node_id,
                &task.handler,
                task.resolved_config.clone(),
                next_retry_count,
            );
            self.state
                .stream_publish(TASKS_STREAM, next.to_fields())
                .await?;
            return Ok(());
        }

        self.dead_letter(task, error).await
    }

    /// Terminal failure: park the task for the operator, then let the
    /// orchestrator see the failure through the normal completion path.
    async fn dead_letter(&self, task: &TaskMessage, error: ErrorDetail) -> Result<(), WorkerError> {
        let entry = DeadLetterEntry::new(
            task.execution_id,
            &task.node_id,
            &task.handler,
            self.original_config(task).await,
            task.resolved_config.clone(),
            error.clone(),
            task.retry_count,
        );
        self.dlq.push(&entry).await?;
        warn!(
            execution_id = %task.execution_id,
            node_id = %task.node_id,
            handler = %task.handler,
            category = error.category.as_str(),
            retry_count = task.retry_count,
            "task dead-lettered"
        );

        let completion = CompletionMessage::failed(task.execution_id, &task.node_id, error);
        self.state
            .stream_publish(COMPLETIONS_STREAM, completion.to_fields())
            .await?;
        let fingerprint = task_fingerprint(task.execution_id, &task.node_id, task.retry_count);
        self.state
            .idempotency_try_claim(&fingerprint, self.config.idempotency_ttl)
            .await?;
        Ok(())
    }

    /// Best-effort original (pre-resolution) config for DLQ entries.
    async fn original_config(&self, task: &TaskMessage) -> Value {
        let Ok(Some(execution)) = self.state.execution_get(task.execution_id).await else {
            return Value::Null;
        };
        let Ok(definition) = self.definitions.load_dag(execution.workflow_id).await else {
            return Value::Null;
        };
        definition
            .nodes
            .iter()
            .find(|node| node.id == task.node_id)
            .map(|node| node.config.clone())
            .unwrap_or(Value::Null)
    }
}

fn classify(err: HandlerError) -> ErrorDetail {
    match err {
        HandlerError::Validation(message) => {
            ErrorDetail::new(ErrorCategory::Validation, message)
        }
        HandlerError::Connection(message) => {
            ErrorDetail::new(ErrorCategory::Connection, message)
        }
        HandlerError::Failed(message) => ErrorDetail::new(ErrorCategory::Handler, message),
        HandlerError::NonRetryable(message) => {
            ErrorDetail::new(ErrorCategory::Handler, message).non_retryable()
        }
    }
}
