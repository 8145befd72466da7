//! Immutable per-run view of a workflow's nodes and dependency edges

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;

/// Errors found while validating a workflow graph
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("workflow '{workflow_id}' has no nodes")]
    Empty { workflow_id: String },

    #[error("duplicate node id '{node_id}'")]
    DuplicateNode { node_id: String },

    #[error("edge {from} -> {to} references unknown node '{missing}'")]
    UnknownNode {
        from: String,
        to: String,
        missing: String,
    },

    #[error("node '{node_id}' depends on itself")]
    SelfLoop { node_id: String },

    #[error("circular dependency detected involving node '{node_id}'")]
    Cycle { node_id: String },
}

/// Where a node's script comes from
///
/// Global scripts live in a shared catalog, custom scripts ship with the
/// workflow definition. Both are resolved once, when a run's schedule
/// entries are created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptReference {
    Global(String),
    Custom(String),
}

impl std::fmt::Display for ScriptReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptReference::Global(id) => write!(f, "global:{}", id),
            ScriptReference::Custom(id) => write!(f, "custom:{}", id),
        }
    }
}

/// A single node of a workflow
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NodeDefinition {
    /// Node id (unique within workflow)
    pub id: String,

    /// Human-readable name, defaults to the id
    pub name: Option<String>,

    /// Script to run
    pub script: ScriptReference,

    /// Logical attempt budget (falls back to the configured default)
    pub max_retries: Option<u32>,

    /// Per-attempt timeout (falls back to the configured default)
    pub timeout_seconds: Option<u64>,

    /// Dispatch priority hint, higher runs first
    #[serde(default)]
    pub priority: u32,

    /// Static parameters, resolved per dispatch
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl NodeDefinition {
    pub fn new(id: impl Into<String>, script: ScriptReference) -> Self {
        Self {
            id: id.into(),
            name: None,
            script,
            max_retries: None,
            timeout_seconds: None,
            priority: 0,
            params: BTreeMap::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Directed dependency: `to` cannot start before `from` succeeds
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Nodes and edges of one workflow, as handed out by a graph provider
#[derive(Debug, Clone, Default)]
pub struct WorkflowGraph {
    pub workflow_id: String,
    nodes: Vec<NodeDefinition>,
    edges: BTreeSet<Edge>,
    /// Bodies of scripts referenced as `ScriptReference::Custom`
    pub custom_scripts: BTreeMap<String, String>,
    /// Wall-clock budget for a whole run, overriding the configured default
    pub run_timeout_seconds: Option<u64>,
    /// Run-level retry budget, overriding the configured default
    pub max_run_retries: Option<u32>,
}

impl WorkflowGraph {
    /// Build a graph. Duplicate edges collapse into one dependency.
    pub fn new(
        workflow_id: impl Into<String>,
        nodes: Vec<NodeDefinition>,
        edges: impl IntoIterator<Item = Edge>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            nodes,
            edges: edges.into_iter().collect(),
            custom_scripts: BTreeMap::new(),
            run_timeout_seconds: None,
            max_run_retries: None,
        }
    }

    pub fn with_custom_script(mut self, id: impl Into<String>, body: impl Into<String>) -> Self {
        self.custom_scripts.insert(id.into(), body.into());
        self
    }

    pub fn nodes(&self) -> &[NodeDefinition] {
        &self.nodes
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// Number of distinct predecessors of a node
    pub fn in_degree(&self, node_id: &str) -> u32 {
        self.edges.iter().filter(|e| e.to == node_id).count() as u32
    }

    /// Direct successors of a node
    pub fn successors(&self, node_id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.from == node_id)
            .map(|e| e.to.as_str())
            .collect()
    }

    /// Check node ids, edge endpoints and acyclicity
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::Empty {
                workflow_id: self.workflow_id.clone(),
            });
        }

        let mut ids = BTreeSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(GraphError::DuplicateNode {
                    node_id: node.id.clone(),
                });
            }
        }

        for edge in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !ids.contains(endpoint.as_str()) {
                    return Err(GraphError::UnknownNode {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        missing: endpoint.clone(),
                    });
                }
            }
            if edge.from == edge.to {
                return Err(GraphError::SelfLoop {
                    node_id: edge.from.clone(),
                });
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Kahn's algorithm; nodes with equal depth come out in id order
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        let mut remaining: BTreeMap<&str, u32> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), self.in_degree(&n.id)))
            .collect();

        let mut queue: VecDeque<&str> = remaining
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            for next in self.successors(id) {
                if let Some(degree) = remaining.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        if order.len() < self.nodes.len() {
            let stuck = remaining
                .iter()
                .find(|(_, degree)| **degree > 0)
                .map(|(id, _)| id.to_string())
                .unwrap_or_default();
            return Err(GraphError::Cycle { node_id: stuck });
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeDefinition {
        NodeDefinition::new(id, ScriptReference::Global("noop".into()))
    }

    fn diamond() -> WorkflowGraph {
        WorkflowGraph::new(
            "diamond",
            vec![node("a"), node("b"), node("c"), node("d")],
            vec![
                Edge::new("a", "b"),
                Edge::new("a", "c"),
                Edge::new("b", "d"),
                Edge::new("c", "d"),
            ],
        )
    }

    #[test]
    fn test_in_degree() {
        let graph = diamond();
        assert_eq!(graph.in_degree("a"), 0);
        assert_eq!(graph.in_degree("b"), 1);
        assert_eq!(graph.in_degree("d"), 2);
    }

    #[test]
    fn test_duplicate_edges_collapse() {
        let graph = WorkflowGraph::new(
            "dup",
            vec![node("a"), node("b")],
            vec![Edge::new("a", "b"), Edge::new("a", "b")],
        );
        assert_eq!(graph.in_degree("b"), 1);
    }

    #[test]
    fn test_topological_order() {
        let order = diamond().topological_order().unwrap();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_cycle_detection() {
        let graph = WorkflowGraph::new(
            "cycle",
            vec![node("a"), node("b"), node("c")],
            vec![Edge::new("a", "b"), Edge::new("b", "c"), Edge::new("c", "b")],
        );
        assert!(matches!(graph.validate(), Err(GraphError::Cycle { .. })));
    }

    #[test]
    fn test_unknown_node_detection() {
        let graph = WorkflowGraph::new("unknown", vec![node("a")], vec![Edge::new("a", "ghost")]);
        assert_eq!(
            graph.validate(),
            Err(GraphError::UnknownNode {
                from: "a".into(),
                to: "ghost".into(),
                missing: "ghost".into(),
            })
        );
    }

    #[test]
    fn test_duplicate_node_and_self_loop() {
        let graph = WorkflowGraph::new("dup", vec![node("a"), node("a")], Vec::new());
        assert!(matches!(graph.validate(), Err(GraphError::DuplicateNode { .. })));

        let graph = WorkflowGraph::new("loop", vec![node("a")], vec![Edge::new("a", "a")]);
        assert!(matches!(graph.validate(), Err(GraphError::SelfLoop { .. })));

        let graph = WorkflowGraph::new("empty", Vec::new(), Vec::new());
        assert!(matches!(graph.validate(), Err(GraphError::Empty { .. })));
    }

    #[test]
    fn test_script_reference_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            script: ScriptReference,
        }

        let parsed: Wrapper = toml::from_str(r#"script = { custom = "inline" }"#).unwrap();
        assert_eq!(parsed.script, ScriptReference::Custom("inline".into()));
        assert_eq!(parsed.script.to_string(), "custom:inline");
    }
}
