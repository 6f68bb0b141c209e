use crate::{Orchestrator, OrchestratorError};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sluice_core::model::{DagGraph, ErrorCategory, ErrorDetail, ExecutionStatus, NodeStatus, NodeUpdate};
use sluice_core::{PARAMS_NODE_ID, TRIGGER_NODE_ID, evaluate_condition, resolve_config};
use sluice_protocol::{COMPLETIONS_STREAM, CompletionMessage, CompletionStatus, TASKS_STREAM, TaskMessage};
use sluice_state::keys;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl Orchestrator {
    /// Evaluation transaction for one completion event.
    ///
    /// Convergent under redelivery and reordering: every state change is
    /// CAS-guarded and readiness is monotone, so reprocessing a
    /// completion can only repeat work that was already a no-op.
    pub async fn evaluate(&self, completion: &CompletionMessage) -> Result<(), OrchestratorError> {
        let execution_id = completion.execution_id;
        let Some(execution) = self.state().execution_get(execution_id).await? else {
            warn!(%execution_id, "completion for unknown or expired execution");
            return Ok(());
        };
        let graph = self.graph(execution.workflow_id).await?;
        let now = Utc::now();
        let is_trigger = completion.node_id == TRIGGER_NODE_ID;

        let mut node_failed = false;
        if !is_trigger {
            if !graph.contains(&completion.node_id) {
                warn!(%execution_id, node_id = %completion.node_id, "completion for node outside the workflow");
                return Ok(());
            }
            match self.apply_completion(completion, now).await? {
                Applied::Failed => node_failed = true,
                Applied::Completed => {}
                Applied::NotApplicable => return Ok(()),
            }
        }

        if execution.status == ExecutionStatus::Cancelled {
            debug!(%execution_id, "execution cancelled, suppressing dispatch");
            return Ok(());
        }

        if node_failed {
            self.propagate_skips(&graph, execution_id, &completion.node_id, now)
                .await?;
            self.finalize_if_quiescent(&graph, execution_id).await?;
            return Ok(());
        }

        let children: Vec<String> = if is_trigger {
            graph.roots().iter().map(|id| id.to_string()).collect()
        } else {
            graph
                .children(&completion.node_id)
                .map(str::to_string)
                .collect()
        };

        if !children.is_empty() {
            // Upstream outputs plus trigger params, one round-trip.
            let output_ids: Vec<&str> = graph
                .node_ids()
                .chain(std::iter::once(PARAMS_NODE_ID))
                .collect();
            let outputs = self.state().output_mget(execution_id, &output_ids).await?;
            for child in &children {
                self.try_dispatch(&graph, execution_id, child, &outputs, now)
                    .await?;
            }
        }

        self.finalize_if_quiescent(&graph, execution_id).await?;
        Ok(())
    }

    /// Step 1: fold the completion into node state. The worker usually
    /// left the node `Running`; `Pending` covers workers that published
    /// a terminal completion without the intermediate CAS.
    async fn apply_completion(
        &self,
        completion: &CompletionMessage,
        now: DateTime<Utc>,
    ) -> Result<Applied, OrchestratorError> {
        let execution_id = completion.execution_id;
        let node_id = &completion.node_id;

        let (target, update) = match completion.status {
            CompletionStatus::Completed => (NodeStatus::Completed, NodeUpdate::finished(now)),
            CompletionStatus::Failed => {
                let error = completion.error.clone().unwrap_or_else(|| {
                    ErrorDetail::new(ErrorCategory::Unknown, "task failed without error detail")
                });
                (NodeStatus::Failed, NodeUpdate::failed(now, error))
            }
        };

        let applied = self
            .state()
            .node_cas(execution_id, node_id, NodeStatus::Running, target, update.clone())
            .await?
            || self
                .state()
                .node_cas(execution_id, node_id, NodeStatus::Pending, target, update)
                .await?;

        if applied {
            if let (CompletionStatus::Completed, Some(output)) =
                (completion.status, &completion.output)
            {
                self.state().output_put(execution_id, node_id, output).await?;
            }
            debug!(%execution_id, %node_id, status = ?completion.status, "completion applied");
            return Ok(match completion.status {
                CompletionStatus::Completed => Applied::Completed,
                CompletionStatus::Failed => Applied::Failed,
            });
        }

        // The CAS lost: either a duplicate delivery, or a synthetic
        // completion for a node this orchestrator already skipped or
        // failed. Terminal state decides whether evaluation continues.
        match self.state().node_get(execution_id, node_id).await? {
            Some(record) if record.status == NodeStatus::Failed => Ok(Applied::Failed),
            Some(record) if record.status.is_terminal() => Ok(Applied::Completed),
            other => {
                warn!(
                    %execution_id,
                    %node_id,
                    status = ?other.map(|record| record.status),
                    "completion for a node not in a completable state"
                );
                Ok(Applied::NotApplicable)
            }
        }
    }

    /// Step 3: fail-fast. Descendants of a failed node that have not
    /// started are marked `Skipped`, not `Failed`, so the cause stays
    /// distinguishable from the effect. Running or terminal descendants
    /// are left alone.
    async fn propagate_skips(
        &self,
        graph: &DagGraph,
        execution_id: Uuid,
        failed_node: &str,
        now: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        for descendant in graph.descendants(failed_node) {
            let skipped = self
                .state()
                .node_cas(
                    execution_id,
                    &descendant,
                    NodeStatus::Waiting,
                    NodeStatus::Skipped,
                    NodeUpdate::finished(now),
                )
                .await?;
            if skipped {
                debug!(%execution_id, node_id = %descendant, "skipped descendant of failed node");
            }
        }
        Ok(())
    }

    /// Steps 4–5: readiness check plus lock-serialised dispatch of one
    /// child.
    async fn try_dispatch(
        &self,
        graph: &DagGraph,
        execution_id: Uuid,
        child: &str,
        outputs: &HashMap<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        let parent_ids: Vec<&str> = graph.parents(child).collect();
        if !parent_ids.is_empty() {
            let statuses = self.state().node_mget(execution_id, &parent_ids).await?;
            let ready = parent_ids.iter().all(|parent| {
                statuses.get(*parent).is_some_and(|record| {
                    matches!(record.status, NodeStatus::Completed | NodeStatus::Skipped)
                })
            });
            if !ready {
                return Ok(());
            }
        }

        let lock_key = keys::eval_lock_key(execution_id, child);
        let token = Uuid::new_v4().to_string();
        if !self
            .state()
            .lock_acquire(&lock_key, &token, self.config().lock_ttl)
            .await?
        {
            // Another replica is dispatching this child right now.
            return Ok(());
        }

        let result = self
            .dispatch_locked(graph, execution_id, child, outputs, now)
            .await;

        if let Err(err) = self.state().lock_release(&lock_key, &token).await {
            warn!(%execution_id, node_id = %child, error = %err, "eval lock release failed");
        }
        result
    }

    async fn dispatch_locked(
        &self,
        graph: &DagGraph,
        execution_id: Uuid,
        child: &str,
        outputs: &HashMap<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        // Re-read under the lock: another replica may have advanced the
        // node between the readiness check and lock acquisition.
        let Some(record) = self.state().node_get(execution_id, child).await? else {
            return Ok(());
        };
        if record.status != NodeStatus::Waiting {
            return Ok(());
        }

        let node = graph.node(child).expect("child taken from graph");

        if let Some(condition) = &node.condition {
            match evaluate_condition(condition, outputs) {
                Ok(true) => {}
                Ok(false) => {
                    let skipped = self
                        .state()
                        .node_cas(
                            execution_id,
                            child,
                            NodeStatus::Waiting,
                            NodeStatus::Skipped,
                            NodeUpdate::finished(now),
                        )
                        .await?;
                    if skipped {
                        info!(%execution_id, node_id = %child, "condition false, node skipped");
                        // Synthetic completion keeps the frontier moving
                        // through the skipped node.
                        let synthetic = CompletionMessage::completed(execution_id, child, None);
                        self.state()
                            .stream_publish(COMPLETIONS_STREAM, synthetic.to_fields())
                            .await?;
                    }
                    return Ok(());
                }
                Err(err) => {
                    return self
                        .fail_before_dispatch(execution_id, child, err.to_string(), now)
                        .await;
                }
            }
        }

        match resolve_config(&node.config, outputs) {
            Ok(resolved) => {
                let dispatched = self
                    .state()
                    .node_cas(
                        execution_id,
                        child,
                        NodeStatus::Waiting,
                        NodeStatus::Pending,
                        NodeUpdate::default(),
                    )
                    .await?;
                if dispatched {
                    let task = TaskMessage::new(execution_id, child, &node.handler, resolved, 0);
                    self.state()
                        .stream_publish(TASKS_STREAM, task.to_fields())
                        .await?;
                    info!(%execution_id, node_id = %child, handler = %node.handler, "task dispatched");
                }
                Ok(())
            }
            Err(err) => {
                self.fail_before_dispatch(execution_id, child, err.to_string(), now)
                    .await
            }
        }
    }

    /// Template or condition resolution failed: the node fails with a
    /// validation error before any worker sees it, and the failure flows
    /// through the normal completion path.
    async fn fail_before_dispatch(
        &self,
        execution_id: Uuid,
        node_id: &str,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        let error = ErrorDetail::new(ErrorCategory::Validation, message);
        let failed = self
            .state()
            .node_cas(
                execution_id,
                node_id,
                NodeStatus::Waiting,
                NodeStatus::Failed,
                NodeUpdate::failed(now, error.clone()),
            )
            .await?;
        if failed {
            warn!(%execution_id, %node_id, error = %error.message, "node failed before dispatch");
            let completion = CompletionMessage::failed(execution_id, node_id, error);
            self.state()
                .stream_publish(COMPLETIONS_STREAM, completion.to_fields())
                .await?;
        }
        Ok(())
    }

    /// Step 6: once no node is runnable, settle the overall execution
    /// status, write terminal history, and put the hot keys on their
    /// expiry clock.
    async fn finalize_if_quiescent(
        &self,
        graph: &DagGraph,
        execution_id: Uuid,
    ) -> Result<(), OrchestratorError> {
        let node_ids: Vec<&str> = graph.node_ids().collect();
        let statuses = self.state().node_mget(execution_id, &node_ids).await?;
        if statuses.len() != node_ids.len() {
            return Ok(());
        }
        if statuses.values().any(|record| {
            matches!(
                record.status,
                NodeStatus::Waiting | NodeStatus::Pending | NodeStatus::Running
            )
        }) {
            return Ok(());
        }

        let any_failed = statuses
            .values()
            .any(|record| record.status == NodeStatus::Failed);
        let final_status = if any_failed {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };

        let now = Utc::now();
        if self
            .state()
            .execution_cas(execution_id, ExecutionStatus::Running, final_status, now)
            .await?
        {
            info!(%execution_id, status = final_status.as_str(), "execution reached terminal status");
            self.record_terminal(graph, execution_id, final_status).await?;
        }
        Ok(())
    }

    pub(crate) async fn record_terminal(
        &self,
        graph: &DagGraph,
        execution_id: Uuid,
        final_status: ExecutionStatus,
    ) -> Result<(), OrchestratorError> {
        let output_ids: Vec<&str> = graph.node_ids().collect();
        let outputs = self.state().output_mget(execution_id, &output_ids).await?;
        self.definitions()
            .record_terminal(execution_id, final_status, outputs)
            .await?;

        let node_ids: Vec<String> = graph.node_ids().map(str::to_string).collect();
        self.state()
            .expire_terminal(execution_id, &node_ids, self.config().terminal_state_ttl)
            .await?;
        Ok(())
    }

    /// Housekeeper half of execution deadlines: a `Running` execution
    /// past its timeout fails, and its unstarted nodes are parked as
    /// `Skipped`. In-flight handlers are left to finish; their
    /// completions land on an already-failed execution.
    pub async fn fail_timed_out_executions(&self) -> Result<(), OrchestratorError> {
        let now = Utc::now();
        for execution in self.state().execution_list_running().await? {
            if !execution.timed_out_at(now) {
                continue;
            }
            let failed = self
                .state()
                .execution_cas(
                    execution.execution_id,
                    ExecutionStatus::Running,
                    ExecutionStatus::Failed,
                    now,
                )
                .await?;
            if !failed {
                continue;
            }
            warn!(
                execution_id = %execution.execution_id,
                timeout_seconds = execution.timeout_seconds,
                "execution timed out"
            );

            let graph = self.graph(execution.workflow_id).await?;
            for node_id in graph.node_ids() {
                for from in [NodeStatus::Waiting, NodeStatus::Pending] {
                    self.state()
                        .node_cas(
                            execution.execution_id,
                            node_id,
                            from,
                            NodeStatus::Skipped,
                            NodeUpdate::finished(now),
                        )
                        .await?;
                }
            }
            self.record_terminal(&graph, execution.execution_id, ExecutionStatus::Failed)
                .await?;
        }
        Ok(())
    }
}

enum Applied {
    Completed,
    Failed,
    NotApplicable,
}
