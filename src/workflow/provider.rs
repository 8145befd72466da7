//! Graph providers and script catalogs

use super::graph::{Edge, GraphError, NodeDefinition, WorkflowGraph};
use super::snapshot::{ScriptCatalog, SnapshotError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

/// Errors while fetching a workflow definition
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("workflow '{0}' not found")]
    NotFound(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid workflow: {0}")]
    Invalid(#[from] GraphError),
}

/// Source of workflow graphs
#[async_trait]
pub trait GraphProvider: Send + Sync {
    /// Fetch and validate the graph for a workflow
    async fn get_definition(&self, workflow_id: &str) -> Result<WorkflowGraph, ProviderError>;
}

/// A custom script shipped inside a workflow file
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CustomScript {
    pub source: String,
}

/// On-disk workflow definition
///
/// ```toml
/// name = "nightly"
///
/// [[nodes]]
/// id = "fetch"
/// script = { global = "fetch-data" }
///
/// [[nodes]]
/// id = "report"
/// script = { custom = "report" }
/// max_retries = 2
///
/// [[edges]]
/// from = "fetch"
/// to = "report"
///
/// [custom_scripts.report]
/// source = "echo done"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDefinition {
    /// Workflow name, defaults to the file stem
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Wall-clock budget for one run in seconds
    pub timeout_seconds: Option<u64>,

    /// Run-level retry budget
    pub max_run_retries: Option<u32>,

    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,

    #[serde(default)]
    pub edges: Vec<Edge>,

    #[serde(default)]
    pub custom_scripts: BTreeMap<String, CustomScript>,
}

impl WorkflowDefinition {
    /// Parse a definition from TOML text
    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Convert into a validated graph
    pub fn into_graph(self, workflow_id: &str) -> Result<WorkflowGraph, GraphError> {
        let mut graph = WorkflowGraph::new(workflow_id, self.nodes, self.edges);
        graph.custom_scripts = self
            .custom_scripts
            .into_iter()
            .map(|(id, script)| (id, script.source))
            .collect();
        graph.run_timeout_seconds = self.timeout_seconds;
        graph.max_run_retries = self.max_run_retries;
        graph.validate()?;
        Ok(graph)
    }
}

/// Loads `<dir>/<workflow_id>.toml`
#[derive(Debug, Clone)]
pub struct FileGraphProvider {
    dir: PathBuf,
}

impl FileGraphProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(format!("{}.toml", workflow_id))
    }

    /// Load synchronously; shared by the provider and `validate`
    pub fn load(&self, workflow_id: &str) -> Result<WorkflowGraph, ProviderError> {
        let path = self.path_for(workflow_id);
        if !path.exists() {
            return Err(ProviderError::NotFound(workflow_id.to_string()));
        }

        let contents = std::fs::read_to_string(&path).map_err(|source| ProviderError::Io {
            path: path.clone(),
            source,
        })?;
        let definition = WorkflowDefinition::from_toml(&contents)
            .map_err(|source| ProviderError::Parse { path, source })?;

        Ok(definition.into_graph(workflow_id)?)
    }
}

#[async_trait]
impl GraphProvider for FileGraphProvider {
    async fn get_definition(&self, workflow_id: &str) -> Result<WorkflowGraph, ProviderError> {
        self.load(workflow_id)
    }
}

/// Graphs registered in memory
#[derive(Debug, Default)]
pub struct MemoryGraphProvider {
    graphs: RwLock<HashMap<String, WorkflowGraph>>,
}

impl MemoryGraphProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, graph: WorkflowGraph) {
        if let Ok(mut graphs) = self.graphs.write() {
            graphs.insert(graph.workflow_id.clone(), graph);
        }
    }
}

#[async_trait]
impl GraphProvider for MemoryGraphProvider {
    async fn get_definition(&self, workflow_id: &str) -> Result<WorkflowGraph, ProviderError> {
        let graph = self
            .graphs
            .read()
            .ok()
            .and_then(|graphs| graphs.get(workflow_id).cloned())
            .ok_or_else(|| ProviderError::NotFound(workflow_id.to_string()))?;
        graph.validate()?;
        Ok(graph)
    }
}

/// Global scripts stored as `<dir>/<script_id>.sh`
#[derive(Debug, Clone)]
pub struct DirScriptCatalog {
    dir: PathBuf,
}

impl DirScriptCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn script_path(&self, script_id: &str) -> Option<PathBuf> {
        // Ids are file stems, never paths
        if script_id.is_empty() || script_id.contains(['/', '\\']) || script_id.starts_with('.') {
            return None;
        }
        Some(self.dir.join(format!("{}.sh", script_id)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ScriptCatalog for DirScriptCatalog {
    fn global_script(&self, script_id: &str) -> Result<Option<String>, SnapshotError> {
        let Some(path) = self.script_path(script_id) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        std::fs::read_to_string(&path)
            .map(Some)
            .map_err(|source| SnapshotError::Io {
                script_id: script_id.to_string(),
                source,
            })
    }
}
