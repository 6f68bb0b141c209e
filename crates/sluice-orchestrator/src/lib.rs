mod evaluate;

use sluice_core::model::DagGraph;
use sluice_protocol::{COMPLETIONS_STREAM, CompletionMessage, ORCHESTRATOR_GROUP, ProtocolError};
use sluice_state::{DefinitionStore, StateError, StateStore, StreamMessage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error("workflow definition failed validation: {0}")]
    Definition(#[from] sluice_core::DagValidationError),
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub consumer_name: String,
    pub batch_size: usize,
    pub block: Duration,
    pub lock_ttl: Duration,
    pub completion_reclaim_idle: Duration,
    pub housekeeping_interval: Duration,
    pub terminal_state_ttl: Duration,
    pub error_pause: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            consumer_name: format!("orchestrator-{}", short_id()),
            batch_size: 10,
            block: Duration::from_millis(2_000),
            lock_ttl: Duration::from_secs(30),
            completion_reclaim_idle: Duration::from_millis(60_000),
            housekeeping_interval: Duration::from_secs(5),
            terminal_state_ttl: Duration::from_secs(24 * 60 * 60),
            error_pause: Duration::from_secs(1),
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overridden by `SLUICE_ORCHESTRATOR_*` environment
    /// variables where present.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(batch_size) = env_parse("SLUICE_ORCHESTRATOR_BATCH_SIZE") {
            config.batch_size = batch_size;
        }
        if let Some(block_ms) = env_parse("SLUICE_ORCHESTRATOR_BLOCK_MS") {
            config.block = Duration::from_millis(block_ms);
        }
        if let Some(lock_ttl_secs) = env_parse("SLUICE_ORCHESTRATOR_LOCK_TTL_SECONDS") {
            config.lock_ttl = Duration::from_secs(lock_ttl_secs);
        }
        if let Some(idle_ms) = env_parse("SLUICE_ORCHESTRATOR_COMPLETION_RECLAIM_IDLE_MS") {
            config.completion_reclaim_idle = Duration::from_millis(idle_ms);
        }
        if let Some(ttl_secs) = env_parse("SLUICE_TERMINAL_STATE_TTL_SECONDS") {
            config.terminal_state_ttl = Duration::from_secs(ttl_secs);
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

/// A single orchestrator replica: consumes completion events from the
/// shared consumer group and advances execution frontiers. Any number of
/// replicas may run against the same store; per-child dispatch locks
/// keep fan-in single-shot.
pub struct Orchestrator {
    state: Arc<dyn StateStore>,
    definitions: Arc<dyn DefinitionStore>,
    config: OrchestratorConfig,
    graphs: Mutex<HashMap<Uuid, Arc<DagGraph>>>,
}

impl Orchestrator {
    pub fn new(
        state: Arc<dyn StateStore>,
        definitions: Arc<dyn DefinitionStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            state,
            definitions,
            config,
            graphs: Mutex::new(HashMap::new()),
        }
    }

    /// Runs until `shutdown` flips to true. In-flight evaluations finish
    /// before the loop exits; unacknowledged completions are reclaimed
    /// by the reaper.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), OrchestratorError> {
        info!(consumer = %self.config.consumer_name, "orchestrator starting");
        let mut housekeeping = tokio::time::interval(self.config.housekeeping_interval);
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = housekeeping.tick() => {
                    if let Err(err) = self.housekeeping().await {
                        error!(error = %err, "housekeeping pass failed");
                    }
                }
                consumed = self.state.stream_consume(
                    COMPLETIONS_STREAM,
                    ORCHESTRATOR_GROUP,
                    &self.config.consumer_name,
                    self.config.batch_size,
                    self.config.block,
                ) => {
                    match consumed {
                        Ok(messages) => self.process_batch(messages).await,
                        Err(err) => {
                            error!(error = %err, "completion consume failed, backing off");
                            tokio::time::sleep(self.config.error_pause).await;
                        }
                    }
                }
            }
        }

        info!(consumer = %self.config.consumer_name, "orchestrator shutdown complete");
        Ok(())
    }

    async fn process_batch(&self, messages: Vec<StreamMessage>) {
        if messages.is_empty() {
            return;
        }
        debug!(count = messages.len(), "processing completion batch");
        futures::future::join_all(messages.iter().map(|message| self.process_message(message)))
            .await;
    }

    /// Decodes and evaluates one completion, acknowledging only when
    /// evaluation succeeded. Failed evaluations stay in the pending list
    /// for the reaper to hand to another replica.
    pub async fn process_message(&self, message: &StreamMessage) {
        let completion = match CompletionMessage::from_fields(&message.fields) {
            Ok(completion) => completion,
            Err(ProtocolError::UnsupportedSchemaVersion { found, supported }) => {
                warn!(
                    id = %message.id,
                    found,
                    supported,
                    "completion from a future schema version, leaving unacknowledged"
                );
                return;
            }
            Err(err) => {
                error!(id = %message.id, error = %err, "undecodable completion, acknowledging");
                self.ack(&message.id).await;
                return;
            }
        };

        match self.evaluate(&completion).await {
            Ok(()) => self.ack(&message.id).await,
            Err(err) => {
                error!(
                    execution_id = %completion.execution_id,
                    node_id = %completion.node_id,
                    error = %err,
                    "evaluation failed, leaving completion unacknowledged"
                );
            }
        }
    }

    async fn ack(&self, id: &str) {
        if let Err(err) = self
            .state
            .stream_ack(COMPLETIONS_STREAM, ORCHESTRATOR_GROUP, &[id.to_string()])
            .await
        {
            error!(id, error = %err, "completion ack failed");
        }
    }

    /// Periodic pass: re-process completions whose consumer went silent,
    /// then fail executions that outran their deadline.
    async fn housekeeping(&self) -> Result<(), OrchestratorError> {
        let reclaimed = self
            .state
            .stream_reclaim(
                COMPLETIONS_STREAM,
                ORCHESTRATOR_GROUP,
                &self.config.consumer_name,
                self.config.completion_reclaim_idle,
                self.config.batch_size,
            )
            .await?;
        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "reclaimed idle completions");
            self.process_batch(reclaimed).await;
        }

        self.fail_timed_out_executions().await
    }

    fn cached_graph(&self, workflow_id: Uuid) -> Option<Arc<DagGraph>> {
        self.graphs
            .lock()
            .expect("graph cache mutex poisoned")
            .get(&workflow_id)
            .cloned()
    }

    pub(crate) async fn graph(
        &self,
        workflow_id: Uuid,
    ) -> Result<Arc<DagGraph>, OrchestratorError> {
        if let Some(graph) = self.cached_graph(workflow_id) {
            return Ok(graph);
        }
        let definition = self.definitions.load_dag(workflow_id).await?;
        let graph = Arc::new(definition.validate()?);
        self.graphs
            .lock()
            .expect("graph cache mutex poisoned")
            .insert(workflow_id, Arc::clone(&graph));
        Ok(graph)
    }

    pub(crate) fn state(&self) -> &Arc<dyn StateStore> {
        &self.state
    }

    pub(crate) fn definitions(&self) -> &Arc<dyn DefinitionStore> {
        &self.definitions
    }

    pub(crate) fn config(&self) -> &OrchestratorConfig {
        &self.config
    }
}
