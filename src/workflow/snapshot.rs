//! Immutable copies of what a node will run, captured when a run starts

use super::graph::{NodeDefinition, ScriptReference, WorkflowGraph};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors while resolving node scripts into snapshots
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("node '{node_id}' references unknown global script '{script_id}'")]
    UnknownGlobalScript { node_id: String, script_id: String },

    #[error("node '{node_id}' references unknown custom script '{script_id}'")]
    UnknownCustomScript { node_id: String, script_id: String },

    #[error("failed to read script '{script_id}': {source}")]
    Io {
        script_id: String,
        #[source]
        source: std::io::Error,
    },
}

/// Source of global scripts
pub trait ScriptCatalog: Send + Sync {
    /// Return the body of a global script, or `None` if it does not exist
    fn global_script(&self, script_id: &str) -> Result<Option<String>, SnapshotError>;
}

/// Everything a worker needs to run one node, frozen at entry creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_id: String,
    pub name: String,
    pub script: ScriptReference,
    pub script_body: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

/// Resolve a single node against the catalog and the workflow's custom scripts
pub fn snapshot_node(
    graph: &WorkflowGraph,
    node: &NodeDefinition,
    catalog: &dyn ScriptCatalog,
) -> Result<NodeSnapshot, SnapshotError> {
    let script_body = match &node.script {
        ScriptReference::Global(id) => {
            catalog
                .global_script(id)?
                .ok_or_else(|| SnapshotError::UnknownGlobalScript {
                    node_id: node.id.clone(),
                    script_id: id.clone(),
                })?
        }
        ScriptReference::Custom(id) => graph.custom_scripts.get(id).cloned().ok_or_else(|| {
            SnapshotError::UnknownCustomScript {
                node_id: node.id.clone(),
                script_id: id.clone(),
            }
        })?,
    };

    Ok(NodeSnapshot {
        node_id: node.id.clone(),
        name: node.display_name().to_string(),
        script: node.script.clone(),
        script_body,
        params: node.params.clone(),
    })
}

/// Resolve every node, failing on the first unresolved script
pub fn snapshot_graph(
    graph: &WorkflowGraph,
    catalog: &dyn ScriptCatalog,
) -> Result<Vec<NodeSnapshot>, SnapshotError> {
    graph
        .nodes()
        .iter()
        .map(|node| snapshot_node(graph, node, catalog))
        .collect()
}

/// In-memory catalog
#[derive(Debug, Clone, Default)]
pub struct MemoryScriptCatalog {
    scripts: BTreeMap<String, String>,
}

impl MemoryScriptCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, id: impl Into<String>, body: impl Into<String>) -> Self {
        self.scripts.insert(id.into(), body.into());
        self
    }
}

impl ScriptCatalog for MemoryScriptCatalog {
    fn global_script(&self, script_id: &str) -> Result<Option<String>, SnapshotError> {
        Ok(self.scripts.get(script_id).cloned())
    }
}
