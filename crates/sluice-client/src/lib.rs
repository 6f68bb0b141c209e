mod display;

pub use display::{ExecutionSnapshot, NodeSnapshot};

use chrono::{DateTime, Utc};
use serde_json::Value;
use sluice_core::model::{ExecutionRecord, ExecutionStatus, WorkflowDefinition};
use sluice_core::{DagValidationError, PARAMS_NODE_ID, TRIGGER_NODE_ID};
use sluice_protocol::{COMPLETIONS_STREAM, CompletionMessage};
use sluice_state::{DefinitionStore, StateError, StateStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] DagValidationError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("submission rate limit exceeded, window resets at {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),
    #[error("execution {execution_id} is {status:?}, not triggerable")]
    NotTriggerable {
        execution_id: Uuid,
        status: ExecutionStatus,
    },
    #[error("execution {execution_id} already reached {status:?}")]
    AlreadyTerminal {
        execution_id: Uuid,
        status: ExecutionStatus,
    },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// When set, submissions are counted against a fixed rate window.
    pub submit_rate_limit: Option<u32>,
    pub submit_rate_window: Duration,
    pub terminal_state_ttl: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            submit_rate_limit: None,
            submit_rate_window: Duration::from_secs(60),
            terminal_state_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Submission surface: validate and persist a workflow, trigger it,
/// cancel it, and read its state back.
pub struct Client {
    state: Arc<dyn StateStore>,
    definitions: Arc<dyn DefinitionStore>,
    config: ClientConfig,
}

impl Client {
    pub fn new(state: Arc<dyn StateStore>, definitions: Arc<dyn DefinitionStore>) -> Self {
        Self::with_config(state, definitions, ClientConfig::default())
    }

    pub fn with_config(
        state: Arc<dyn StateStore>,
        definitions: Arc<dyn DefinitionStore>,
        config: ClientConfig,
    ) -> Self {
        Self {
            state,
            definitions,
            config,
        }
    }

    /// Validates and persists a workflow, creating one execution with
    /// every node `Waiting`. A definition that fails validation
    /// persists nothing.
    pub async fn submit(
        &self,
        definition: &WorkflowDefinition,
        timeout_seconds: Option<f64>,
    ) -> Result<Uuid, SubmitError> {
        let graph = definition.validate()?;

        if let Some(limit) = self.config.submit_rate_limit {
            let decision = self
                .state
                .rate_window_incr("submit", self.config.submit_rate_window, limit)
                .await?;
            if !decision.allowed {
                return Err(SubmitError::RateLimited {
                    reset_at: decision.reset_at,
                });
            }
        }

        self.definitions.save_dag(definition).await?;

        let execution = ExecutionRecord::new(definition.workflow_id, timeout_seconds);
        let execution_id = execution.execution_id;
        self.state.execution_create(&execution).await?;

        let node_ids: Vec<String> = graph.node_ids().map(str::to_string).collect();
        self.state.node_seed(execution_id, &node_ids).await?;

        info!(
            workflow_id = %definition.workflow_id,
            %execution_id,
            nodes = node_ids.len(),
            "workflow submitted"
        );
        Ok(execution_id)
    }

    /// Starts a pending execution by publishing the synthetic
    /// virtual-root completion; the orchestrator group picks it up and
    /// dispatches the DAG roots. Optional params become the outputs of
    /// the reserved `_params` node.
    pub async fn trigger(
        &self,
        execution_id: Uuid,
        params: Option<Value>,
    ) -> Result<(), ClientError> {
        let Some(execution) = self.state.execution_get(execution_id).await? else {
            return Err(ClientError::ExecutionNotFound(execution_id));
        };

        let now = Utc::now();
        let started = self
            .state
            .execution_cas(
                execution_id,
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
                now,
            )
            .await?;
        if !started {
            return Err(ClientError::NotTriggerable {
                execution_id,
                status: execution.status,
            });
        }

        if let Some(params) = params {
            self.state
                .output_put(execution_id, PARAMS_NODE_ID, &params)
                .await?;
        }

        let completion = CompletionMessage::completed(execution_id, TRIGGER_NODE_ID, None);
        self.state
            .stream_publish(COMPLETIONS_STREAM, completion.to_fields())
            .await?;
        info!(%execution_id, "execution triggered");
        Ok(())
    }

    /// Flips the execution to `Cancelled`. Orchestrators stop
    /// dispatching and workers drop its tasks; in-flight handlers run
    /// to completion with their outcomes discarded.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<(), ClientError> {
        let now = Utc::now();
        for from in [ExecutionStatus::Running, ExecutionStatus::Pending] {
            if self
                .state
                .execution_cas(execution_id, from, ExecutionStatus::Cancelled, now)
                .await?
            {
                info!(%execution_id, "execution cancelled");
                let outputs = self.visible_outputs(execution_id).await?;
                self.definitions
                    .record_terminal(execution_id, ExecutionStatus::Cancelled, outputs)
                    .await?;

                let node_ids = self.definition_node_ids(execution_id).await?;
                self.state
                    .expire_terminal(execution_id, &node_ids, self.config.terminal_state_ttl)
                    .await?;
                return Ok(());
            }
        }

        match self.state.execution_get(execution_id).await? {
            Some(execution) => Err(ClientError::AlreadyTerminal {
                execution_id,
                status: execution.status,
            }),
            None => Err(ClientError::ExecutionNotFound(execution_id)),
        }
    }

    pub async fn status(&self, execution_id: Uuid) -> Result<ExecutionSnapshot, ClientError> {
        let Some(execution) = self.state.execution_get(execution_id).await? else {
            return Err(ClientError::ExecutionNotFound(execution_id));
        };
        let definition = self.definitions.load_dag(execution.workflow_id).await?;
        let graph = definition
            .validate()
            .map_err(|err| StateError::Other(format!("stored definition no longer validates: {err}")))?;
        let nodes = self.state.node_all(execution_id).await?;
        Ok(ExecutionSnapshot::build(&execution, &graph, &nodes))
    }

    /// Outputs of the execution's definition nodes; reserved synthetic
    /// nodes such as `_params` are not part of the surface.
    pub async fn outputs(&self, execution_id: Uuid) -> Result<HashMap<String, Value>, ClientError> {
        Ok(self.visible_outputs(execution_id).await?)
    }

    async fn visible_outputs(
        &self,
        execution_id: Uuid,
    ) -> Result<HashMap<String, Value>, StateError> {
        let node_ids = self.definition_node_ids(execution_id).await?;
        let node_refs: Vec<&str> = node_ids.iter().map(String::as_str).collect();
        self.state.output_mget(execution_id, &node_refs).await
    }

    async fn definition_node_ids(&self, execution_id: Uuid) -> Result<Vec<String>, StateError> {
        let Some(execution) = self.state.execution_get(execution_id).await? else {
            return Ok(Vec::new());
        };
        let Ok(definition) = self.definitions.load_dag(execution.workflow_id).await else {
            return Ok(Vec::new());
        };
        Ok(definition.nodes.iter().map(|node| node.id.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sluice_core::model::{NodeSpec, NodeStatus};
    use sluice_state::{MemoryDefinitionStore, MemoryStore};

    fn node(id: &str, deps: &[&str]) -> NodeSpec {
        NodeSpec {
            id: id.to_string(),
            handler: "echo".to_string(),
            config: json!({}),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            condition: None,
        }
    }

    struct Env {
        state: Arc<MemoryStore>,
        definitions: Arc<MemoryDefinitionStore>,
    }

    impl Env {
        fn new() -> Self {
            Self {
                state: Arc::new(MemoryStore::new()),
                definitions: Arc::new(MemoryDefinitionStore::new()),
            }
        }

        fn client(&self) -> Client {
            Client::new(
                Arc::clone(&self.state) as Arc<dyn StateStore>,
                Arc::clone(&self.definitions) as Arc<dyn DefinitionStore>,
            )
        }
    }

    #[tokio::test]
    async fn submit_seeds_every_node_waiting() {
        let env = Env::new();
        let client = env.client();
        let definition =
            WorkflowDefinition::new("w", vec![node("a", &[]), node("b", &["a"])]);

        let execution_id = client.submit(&definition, None).await.expect("submit");

        let execution = env
            .state
            .execution_get(execution_id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(execution.status, ExecutionStatus::Pending);

        let nodes = env.state.node_all(execution_id).await.expect("all");
        assert_eq!(nodes.len(), 2);
        assert!(nodes.values().all(|n| n.status == NodeStatus::Waiting));

        env.definitions
            .load_dag(definition.workflow_id)
            .await
            .expect("definition persisted");
    }

    #[tokio::test]
    async fn invalid_dag_persists_nothing() {
        let env = Env::new();
        let client = env.client();
        let definition =
            WorkflowDefinition::new("w", vec![node("a", &["b"]), node("b", &["a"])]);

        let err = client
            .submit(&definition, None)
            .await
            .expect_err("cycle must fail");
        assert!(matches!(
            err,
            SubmitError::Validation(DagValidationError::CycleDetected(_))
        ));

        assert!(
            env.definitions
                .load_dag(definition.workflow_id)
                .await
                .is_err(),
            "no definition row"
        );
        assert!(
            env.definitions
                .list_workflows()
                .await
                .expect("list")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn trigger_publishes_the_virtual_root_completion() {
        let env = Env::new();
        let client = env.client();
        let definition = WorkflowDefinition::new("w", vec![node("a", &[])]);
        let execution_id = client.submit(&definition, None).await.expect("submit");

        client
            .trigger(execution_id, Some(json!({"user_id": 7})))
            .await
            .expect("trigger");

        let execution = env
            .state
            .execution_get(execution_id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(execution.status, ExecutionStatus::Running);
        assert!(execution.started_at.is_some());

        let messages = env
            .state
            .stream_consume(COMPLETIONS_STREAM, "c:test", "c", 10, Duration::ZERO)
            .await
            .expect("consume");
        assert_eq!(messages.len(), 1);
        let completion =
            CompletionMessage::from_fields(&messages[0].fields).expect("decode completion");
        assert_eq!(completion.node_id, TRIGGER_NODE_ID);

        let params = env
            .state
            .output_get(execution_id, PARAMS_NODE_ID)
            .await
            .expect("get")
            .expect("params stored");
        assert_eq!(params, json!({"user_id": 7}));

        let err = client
            .trigger(execution_id, None)
            .await
            .expect_err("double trigger must fail");
        assert!(matches!(err, ClientError::NotTriggerable { .. }));
    }

    #[tokio::test]
    async fn cancel_is_terminal_and_recorded() {
        let env = Env::new();
        let client = env.client();
        let definition = WorkflowDefinition::new("w", vec![node("a", &[])]);
        let execution_id = client.submit(&definition, None).await.expect("submit");
        client.trigger(execution_id, None).await.expect("trigger");

        client.cancel(execution_id).await.expect("cancel");
        let execution = env
            .state
            .execution_get(execution_id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert!(execution.finished_at.is_some());

        let terminal = env
            .definitions
            .load_terminal(execution_id)
            .await
            .expect("load")
            .expect("recorded");
        assert_eq!(terminal.final_status, ExecutionStatus::Cancelled);

        let err = client.cancel(execution_id).await.expect_err("re-cancel");
        assert!(matches!(err, ClientError::AlreadyTerminal { .. }));
    }

    #[tokio::test]
    async fn submit_rate_limit_rejects_over_budget() {
        let env = Env::new();
        let client = Client::with_config(
            Arc::clone(&env.state) as Arc<dyn StateStore>,
            Arc::clone(&env.definitions) as Arc<dyn DefinitionStore>,
            ClientConfig {
                submit_rate_limit: Some(2),
                ..ClientConfig::default()
            },
        );

        for _ in 0..2 {
            let definition = WorkflowDefinition::new("w", vec![node("a", &[])]);
            client.submit(&definition, None).await.expect("submit");
        }

        let definition = WorkflowDefinition::new("w", vec![node("a", &[])]);
        let err = client
            .submit(&definition, None)
            .await
            .expect_err("over budget");
        assert!(matches!(err, SubmitError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn outputs_hide_reserved_nodes() {
        let env = Env::new();
        let client = env.client();
        let definition = WorkflowDefinition::new("w", vec![node("a", &[])]);
        let execution_id = client.submit(&definition, None).await.expect("submit");
        client
            .trigger(execution_id, Some(json!({"k": 1})))
            .await
            .expect("trigger");
        env.state
            .output_put(execution_id, "a", &json!({"v": 2}))
            .await
            .expect("output");

        let outputs = client.outputs(execution_id).await.expect("outputs");
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs["a"], json!({"v": 2}));
    }
}
