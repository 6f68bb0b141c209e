use chrono::{DateTime, Utc};
use sluice_core::model::{DagGraph, ExecutionRecord, ExecutionStatus, NodeRecord, NodeStatus};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSnapshot {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub nodes: Vec<NodeSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub node_id: String,
    pub status: NodeStatus,
    pub retry_count: u32,
    pub waiting_on: Vec<String>,
    pub error: Option<String>,
}

impl ExecutionSnapshot {
    pub fn build(
        execution: &ExecutionRecord,
        graph: &DagGraph,
        nodes: &HashMap<String, NodeRecord>,
    ) -> Self {
        let node_snapshots = graph
            .topological_order()
            .iter()
            .map(|node_id| {
                let record = nodes.get(node_id);
                let status = record.map_or(NodeStatus::Waiting, |record| record.status);
                let waiting_on = if status == NodeStatus::Waiting {
                    graph
                        .parents(node_id)
                        .filter(|parent| {
                            nodes
                                .get(*parent)
                                .is_none_or(|record| !record.status.is_terminal())
                        })
                        .map(str::to_string)
                        .collect()
                } else {
                    Vec::new()
                };
                NodeSnapshot {
                    node_id: node_id.clone(),
                    status,
                    retry_count: record.map_or(0, |record| record.retry_count),
                    waiting_on,
                    error: record.and_then(|record| {
                        record.error.as_ref().map(|error| error.message.clone())
                    }),
                }
            })
            .collect();

        Self {
            execution_id: execution.execution_id,
            workflow_id: execution.workflow_id,
            status: execution.status,
            started_at: execution.started_at,
            finished_at: execution.finished_at,
            nodes: node_snapshots,
        }
    }

    pub fn counts(&self) -> HashMap<NodeStatus, usize> {
        let mut counts = HashMap::new();
        for node in &self.nodes {
            *counts.entry(node.status).or_insert(0) += 1;
        }
        counts
    }
}

impl Display for ExecutionSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Execution {}: {} ({} nodes)",
            self.execution_id,
            self.status.as_str(),
            self.nodes.len()
        )?;

        let counts = self.counts();
        let mut parts = Vec::new();
        for status in [
            NodeStatus::Completed,
            NodeStatus::Running,
            NodeStatus::Pending,
            NodeStatus::Waiting,
            NodeStatus::Failed,
            NodeStatus::Skipped,
        ] {
            if let Some(count) = counts.get(&status) {
                parts.push(format!("{count} {}", status.as_str()));
            }
        }
        writeln!(f, "  {}", parts.join(", "))?;

        writeln!(f)?;
        writeln!(f, "Nodes:")?;
        for node in &self.nodes {
            if node.waiting_on.is_empty() {
                writeln!(f, "  {:<16} {}", node.node_id, node.status.as_str())?;
            } else {
                writeln!(
                    f,
                    "  {:<16} {} (waiting on: {})",
                    node.node_id,
                    node.status.as_str(),
                    node.waiting_on.join(", ")
                )?;
            }
            if node.retry_count > 0 {
                writeln!(f, "    retries: {}", node.retry_count)?;
            }
            if let Some(error) = &node.error {
                writeln!(f, "    error: {error}")?;
            }
        }

        Ok(())
    }
}
