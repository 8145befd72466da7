//! Workflow graphs as consumed by the scheduler
//!
//! This module handles:
//! - The per-run graph of nodes and dependency edges
//! - Validation (unknown nodes, duplicates, cycles)
//! - Resolving script references into immutable node snapshots
//! - Loading definitions from TOML files

mod graph;
mod provider;
mod snapshot;

pub use graph::{Edge, GraphError, NodeDefinition, ScriptReference, WorkflowGraph};
pub use provider::{
    CustomScript, DirScriptCatalog, FileGraphProvider, GraphProvider, MemoryGraphProvider,
    ProviderError, WorkflowDefinition,
};
pub use snapshot::{
    MemoryScriptCatalog, NodeSnapshot, ScriptCatalog, SnapshotError, snapshot_graph, snapshot_node,
};
