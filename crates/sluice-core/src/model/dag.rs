use crate::errors::DagValidationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    pub handler: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow_id: Uuid,
    pub name: String,
    pub nodes: Vec<NodeSpec>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, nodes: Vec<NodeSpec>) -> Self {
        Self {
            workflow_id: Uuid::new_v4(),
            name: name.into(),
            nodes,
        }
    }

    /// Validates the definition and builds the immutable graph the
    /// orchestrator evaluates against.
    pub fn validate(&self) -> Result<DagGraph, DagValidationError> {
        DagGraph::build(&self.nodes)
    }
}

/// Validated, immutable view of a workflow DAG.
///
/// Nodes are held in an id-keyed map with separate adjacency sets, so
/// cyclic references in the definition never translate into owning
/// pointers. The topological order is a plain array of ids.
#[derive(Debug, Clone)]
pub struct DagGraph {
    nodes: HashMap<String, NodeSpec>,
    children: HashMap<String, BTreeSet<String>>,
    parents: HashMap<String, BTreeSet<String>>,
    topological: Vec<String>,
}

impl DagGraph {
    pub fn build(nodes: &[NodeSpec]) -> Result<Self, DagValidationError> {
        if nodes.is_empty() {
            return Err(DagValidationError::EmptyWorkflow);
        }

        let mut seen = HashSet::new();
        for spec in nodes {
            validate_node_id(&spec.id)?;
            if spec.handler.trim().is_empty() {
                return Err(DagValidationError::MissingHandler(spec.id.clone()));
            }
            if !seen.insert(spec.id.clone()) {
                return Err(DagValidationError::DuplicateNodeId(spec.id.clone()));
            }
        }

        for spec in nodes {
            for dependency in &spec.dependencies {
                if !seen.contains(dependency) {
                    return Err(DagValidationError::UnknownReference {
                        node: spec.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let mut children: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut parents: HashMap<String, BTreeSet<String>> = HashMap::new();
        for spec in nodes {
            children.entry(spec.id.clone()).or_default();
            let entry = parents.entry(spec.id.clone()).or_default();
            for dependency in &spec.dependencies {
                entry.insert(dependency.clone());
                children
                    .entry(dependency.clone())
                    .or_default()
                    .insert(spec.id.clone());
            }
        }

        let topological = kahn_order(nodes, &children, &parents)?;

        Ok(Self {
            nodes: nodes.iter().map(|n| (n.id.clone(), n.clone())).collect(),
            children,
            parents,
            topological,
        })
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeSpec> {
        self.nodes.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.topological.iter().map(String::as_str)
    }

    pub fn children(&self, node_id: &str) -> impl Iterator<Item = &str> {
        self.children
            .get(node_id)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    pub fn parents(&self, node_id: &str) -> impl Iterator<Item = &str> {
        self.parents
            .get(node_id)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Nodes with no dependencies, in topological (hence deterministic)
    /// order.
    pub fn roots(&self) -> Vec<&str> {
        self.topological
            .iter()
            .map(String::as_str)
            .filter(|id| self.parents.get(*id).is_none_or(BTreeSet::is_empty))
            .collect()
    }

    pub fn topological_order(&self) -> &[String] {
        &self.topological
    }

    /// Every strict descendant of `node_id`, breadth-first.
    pub fn descendants(&self, node_id: &str) -> Vec<String> {
        let mut queue: VecDeque<&str> = self.children(node_id).collect();
        let mut visited = HashSet::new();
        let mut result = Vec::new();
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.to_string()) {
                continue;
            }
            result.push(current.to_string());
            queue.extend(self.children(current));
        }
        result
    }
}

/// Kahn's algorithm, iterative to tolerate arbitrarily deep graphs.
/// O(V + E).
fn kahn_order(
    nodes: &[NodeSpec],
    children: &HashMap<String, BTreeSet<String>>,
    parents: &HashMap<String, BTreeSet<String>>,
) -> Result<Vec<String>, DagValidationError> {
    let mut in_degree: HashMap<&str, usize> = nodes
        .iter()
        .map(|n| {
            (
                n.id.as_str(),
                parents.get(&n.id).map_or(0, BTreeSet::len),
            )
        })
        .collect();

    let mut roots: Vec<&str> = nodes
        .iter()
        .filter(|n| in_degree[n.id.as_str()] == 0)
        .map(|n| n.id.as_str())
        .collect();
    roots.sort_unstable();

    // A rootless seed queue is just the degenerate cycle case: the loop
    // below visits nothing and the coverage check reports it.
    let mut queue: VecDeque<&str> = roots.into();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(node_id) = queue.pop_front() {
        order.push(node_id.to_string());
        for child in children.get(node_id).into_iter().flatten() {
            let degree = in_degree
                .get_mut(child.as_str())
                .expect("child collected from validated node set");
            *degree -= 1;
            if *degree == 0 {
                queue.push_back(child.as_str());
            }
        }
    }

    if order.len() != nodes.len() {
        let stuck = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(id, _)| id.to_string())
            .min()
            .expect("incomplete order implies a positive in-degree node");
        return Err(DagValidationError::CycleDetected(stuck));
    }

    Ok(order)
}

fn validate_node_id(node_id: &str) -> Result<(), DagValidationError> {
    if node_id.is_empty() {
        return Err(DagValidationError::InvalidNodeId(node_id.to_string()));
    }
    if node_id.starts_with('_') {
        return Err(DagValidationError::ReservedNodeId(node_id.to_string()));
    }

    let mut chars = node_id.chars();
    let first = chars.next().expect("node_id emptiness handled above");
    if !first.is_ascii_alphanumeric() {
        return Err(DagValidationError::InvalidNodeId(node_id.to_string()));
    }
    if chars.any(|c| !(c.is_ascii_alphanumeric() || c == '_' || c == '-')) {
        return Err(DagValidationError::InvalidNodeId(node_id.to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, deps: &[&str]) -> NodeSpec {
        NodeSpec {
            id: id.to_string(),
            handler: "echo".to_string(),
            config: json!({}),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            condition: None,
        }
    }

    #[test]
    fn builds_diamond_with_correct_adjacency() {
        let graph = DagGraph::build(&[
            node("a", &[]),
            node("b", &["a"]),
            node("c", &["a"]),
            node("d", &["b", "c"]),
        ])
        .expect("diamond should validate");

        let a_children: Vec<&str> = graph.children("a").collect();
        assert_eq!(a_children, vec!["b", "c"]);
        let d_parents: Vec<&str> = graph.parents("d").collect();
        assert_eq!(d_parents, vec!["b", "c"]);
        assert_eq!(graph.roots(), vec!["a"]);
        assert_eq!(graph.len(), 4);
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let graph = DagGraph::build(&[
            node("load", &["merge"]),
            node("extract", &[]),
            node("merge", &["left", "right"]),
            node("left", &["extract"]),
            node("right", &["extract"]),
        ])
        .expect("pipeline should validate");

        let order = graph.topological_order();
        let position = |id: &str| order.iter().position(|n| n == id).expect("node in order");
        assert!(position("extract") < position("left"));
        assert!(position("extract") < position("right"));
        assert!(position("left") < position("merge"));
        assert!(position("right") < position("merge"));
        assert!(position("merge") < position("load"));
    }

    #[test]
    fn rejects_two_node_cycle() {
        let err = DagGraph::build(&[node("a", &["b"]), node("b", &["a"])])
            .expect_err("cycle should fail");
        assert_eq!(err, DagValidationError::CycleDetected("a".to_string()));
    }

    #[test]
    fn rejects_cycle_behind_valid_root() {
        let err = DagGraph::build(&[
            node("root", &[]),
            node("a", &["root", "c"]),
            node("b", &["a"]),
            node("c", &["b"]),
        ])
        .expect_err("cycle should fail");
        assert_eq!(err, DagValidationError::CycleDetected("a".to_string()));
    }

    #[test]
    fn rejects_unknown_reference() {
        let err =
            DagGraph::build(&[node("a", &["ghost"])]).expect_err("unknown reference should fail");
        assert_eq!(
            err,
            DagValidationError::UnknownReference {
                node: "a".to_string(),
                dependency: "ghost".to_string(),
            }
        );
    }

    #[test]
    fn rejects_duplicate_node_id() {
        let err = DagGraph::build(&[node("a", &[]), node("a", &[])])
            .expect_err("duplicate id should fail");
        assert_eq!(err, DagValidationError::DuplicateNodeId("a".to_string()));
    }

    #[test]
    fn rejects_empty_workflow() {
        let err = DagGraph::build(&[]).expect_err("empty workflow should fail");
        assert_eq!(err, DagValidationError::EmptyWorkflow);
    }

    #[test]
    fn rejects_reserved_and_invalid_ids() {
        let err = DagGraph::build(&[node("_hidden", &[])]).expect_err("reserved id should fail");
        assert_eq!(err, DagValidationError::ReservedNodeId("_hidden".to_string()));

        let err = DagGraph::build(&[node("a b", &[])]).expect_err("space should fail");
        assert_eq!(err, DagValidationError::InvalidNodeId("a b".to_string()));
    }

    #[test]
    fn rejects_missing_handler() {
        let mut spec = node("a", &[]);
        spec.handler = "  ".to_string();
        let err = DagGraph::build(&[spec]).expect_err("blank handler should fail");
        assert_eq!(err, DagValidationError::MissingHandler("a".to_string()));
    }

    #[test]
    fn single_node_graph_is_its_own_root() {
        let graph = DagGraph::build(&[node("only", &[])]).expect("single node validates");
        assert_eq!(graph.roots(), vec!["only"]);
        assert_eq!(graph.topological_order(), ["only".to_string()]);
        assert!(graph.descendants("only").is_empty());
    }

    #[test]
    fn descendants_cover_transitive_children_once() {
        let graph = DagGraph::build(&[
            node("a", &[]),
            node("b", &["a"]),
            node("c", &["a"]),
            node("d", &["b", "c"]),
            node("e", &["d"]),
        ])
        .expect("graph validates");

        let mut descendants = graph.descendants("a");
        descendants.sort();
        assert_eq!(descendants, vec!["b", "c", "d", "e"]);
    }

    #[test]
    fn deep_chain_validates_without_recursion() {
        let mut nodes = vec![node("n0", &[])];
        for i in 1..5_000 {
            let prev = format!("n{}", i - 1);
            nodes.push(node(&format!("n{i}"), &[prev.as_str()]));
        }
        let graph = DagGraph::build(&nodes).expect("deep chain validates");
        assert_eq!(graph.topological_order().len(), 5_000);
        assert_eq!(graph.roots(), vec!["n0"]);
    }

    #[test]
    fn definition_round_trips_through_serde() {
        let definition = WorkflowDefinition::new(
            "pipeline",
            vec![node("a", &[]), node("b", &["a"])],
        );
        let encoded = serde_json::to_string(&definition).expect("serialize definition");
        let decoded: WorkflowDefinition =
            serde_json::from_str(&encoded).expect("deserialize definition");
        assert_eq!(decoded, definition);
        decoded.validate().expect("decoded definition validates");
    }
}
