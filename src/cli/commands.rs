//! CLI command implementations

use super::output::{OutputEvent, OutputHandler};
use crate::config::FlowschedConfig;
use crate::dispatcher::{Dispatcher, DispatcherConfig, ShellExecutor, TemplateParamResolver};
use crate::lifecycle::{LifecycleManager, RunDefaults};
use crate::retry::{RetryController, RetryPolicy};
use crate::signals::CancellationToken;
use crate::store::{ExecutionStatus, SqliteStore};
use crate::workflow::{
    DirScriptCatalog, FileGraphProvider, GraphProvider, ScriptCatalog, snapshot_graph,
};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

/// Everything a command needs, built once from config
pub struct AppContext {
    pub config: FlowschedConfig,
    pub store: Arc<SqliteStore>,
    pub lifecycle: Arc<LifecycleManager>,
    graphs: Arc<dyn GraphProvider>,
    catalog: Arc<dyn ScriptCatalog>,
}

impl AppContext {
    /// Open the database and the file-backed workflow and script sources
    pub fn open(config: FlowschedConfig, db_override: Option<&Path>) -> Result<Self> {
        let db_path = db_override
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config.database.resolved_path());
        let store = SqliteStore::open(&db_path, config.database.busy_timeout())
            .with_context(|| format!("Failed to open database {}", db_path.display()))?
            .with_tie_break(config.scheduler.tie_break);

        let graphs = Arc::new(FileGraphProvider::new(config.paths.resolved_workflows_dir()));
        let catalog = Arc::new(DirScriptCatalog::new(config.paths.resolved_scripts_dir()));
        Ok(Self::new(config, Arc::new(store), graphs, catalog))
    }

    pub fn new(
        config: FlowschedConfig,
        store: Arc<SqliteStore>,
        graphs: Arc<dyn GraphProvider>,
        catalog: Arc<dyn ScriptCatalog>,
    ) -> Self {
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            graphs.clone(),
            catalog.clone(),
            RunDefaults::from_config(&config),
        ));
        Self {
            config,
            store,
            lifecycle,
            graphs,
            catalog,
        }
    }

    /// A shell-executing worker pool over this context's store
    pub fn dispatcher(&self) -> Dispatcher {
        let retry = RetryController::new(
            self.store.clone(),
            self.lifecycle.clone(),
            RetryPolicy::from_config(&self.config.retry),
        );
        Dispatcher::new(
            self.lifecycle.clone(),
            retry,
            Arc::new(ShellExecutor::new()),
            Arc::new(TemplateParamResolver::new(self.config.variables.clone())),
            DispatcherConfig::from_config(&self.config),
        )
    }
}

/// Parse `key=value` trigger arguments into a JSON object
///
/// Values that parse as JSON keep their type; anything else is a string.
pub fn parse_trigger_args(args: &[String]) -> Result<serde_json::Value> {
    let mut trigger = serde_json::Map::new();
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .with_context(|| format!("Trigger argument '{}' is not key=value", arg))?;
        if key.is_empty() {
            anyhow::bail!("Trigger argument '{}' has an empty key", arg);
        }
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        trigger.insert(key.to_string(), value);
    }
    Ok(serde_json::Value::Object(trigger))
}

/// Create a run and return immediately
pub async fn start_execution(
    app: &AppContext,
    workflow_id: &str,
    args: &[String],
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let trigger = parse_trigger_args(args)?;
    let execution_id = app
        .lifecycle
        .start_execution(workflow_id, trigger)
        .await
        .with_context(|| format!("Failed to start workflow '{}'", workflow_id))?;
    let record = app.store.get_execution(execution_id)?;
    handler.emit(OutputEvent::ExecutionStarted {
        execution_id,
        workflow_id: workflow_id.to_string(),
        nodes: record.total_nodes,
    });
    Ok(0)
}

/// Create a run and work it to a terminal status in this process
pub async fn run_workflow(
    app: &AppContext,
    workflow_id: &str,
    args: &[String],
    shutdown: CancellationToken,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let trigger = parse_trigger_args(args)?;
    let execution_id = app
        .lifecycle
        .start_execution(workflow_id, trigger)
        .await
        .with_context(|| format!("Failed to start workflow '{}'", workflow_id))?;
    let started = app.store.get_execution(execution_id)?;
    handler.emit(OutputEvent::ExecutionStarted {
        execution_id,
        workflow_id: workflow_id.to_string(),
        nodes: started.total_nodes,
    });

    let record = app
        .dispatcher()
        .run_until_terminal(execution_id, shutdown)
        .await
        .with_context(|| format!("Execution {} did not finish", execution_id))?;
    let succeeded = record.status == ExecutionStatus::Completed && record.failed_nodes == 0;
    handler.emit(OutputEvent::ExecutionStatus { execution: record });
    handler.emit(OutputEvent::NodeResults {
        execution_id,
        results: app.store.list_results(execution_id)?,
    });
    Ok(if succeeded { 0 } else { 1 })
}

/// Long-running worker pool
pub async fn run_worker(
    app: &AppContext,
    shutdown: CancellationToken,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let dispatcher = app.dispatcher();
    handler.emit(OutputEvent::WorkerStarted {
        worker_id: dispatcher.worker_id().to_string(),
        pool_size: app.config.workers.pool_size,
    });
    dispatcher.run(shutdown).await.context("Worker stopped")?;
    Ok(0)
}

pub fn show_status(app: &AppContext, execution_id: i64, handler: &dyn OutputHandler) -> Result<i32> {
    let record = app.lifecycle.get_status(execution_id)?;
    handler.emit(OutputEvent::ExecutionStatus { execution: record });
    Ok(0)
}

pub fn show_results(app: &AppContext, execution_id: i64, handler: &dyn OutputHandler) -> Result<i32> {
    // Fails on unknown runs
    app.store.get_execution(execution_id)?;
    handler.emit(OutputEvent::NodeResults {
        execution_id,
        results: app.store.list_results(execution_id)?,
    });
    Ok(0)
}

pub fn cancel_execution(
    app: &AppContext,
    execution_id: i64,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    match app.lifecycle.cancel_execution(execution_id)? {
        Some(outcome) => {
            handler.emit(OutputEvent::ExecutionCancelled {
                execution_id,
                cancelled: outcome.cancelled,
            });
            Ok(0)
        }
        None => {
            let record = app.store.get_execution(execution_id)?;
            handler.emit(OutputEvent::Info {
                message: format!(
                    "Execution {} is already {}; nothing to cancel",
                    execution_id, record.status
                ),
            });
            Ok(1)
        }
    }
}

pub async fn retry_execution(
    app: &AppContext,
    execution_id: i64,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let retry_id = app
        .lifecycle
        .retry_execution(execution_id)
        .await
        .with_context(|| format!("Failed to retry execution {}", execution_id))?;
    let record = app.store.get_execution(retry_id)?;
    handler.emit(OutputEvent::ExecutionStarted {
        execution_id: retry_id,
        workflow_id: record.workflow_id,
        nodes: record.total_nodes,
    });
    Ok(0)
}

/// Load a workflow, check its graph and resolve every script, without writing anything
pub async fn validate_workflow(
    app: &AppContext,
    workflow_id: &str,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let checked = async {
        let graph = app.graphs.get_definition(workflow_id).await?;
        graph.validate()?;
        snapshot_graph(&graph, app.catalog.as_ref())?;
        let order = graph.topological_order()?;
        Ok::<_, crate::error::SchedulerError>((graph, order))
    }
    .await;

    match checked {
        Ok((graph, order)) => {
            handler.emit(OutputEvent::WorkflowValidated {
                workflow_id: workflow_id.to_string(),
                nodes: graph.nodes().len(),
                edges: graph.edges().count(),
                order,
            });
            Ok(0)
        }
        Err(e) => {
            handler.emit(OutputEvent::WorkflowInvalid {
                workflow_id: workflow_id.to_string(),
                error: e.to_string(),
            });
            Ok(1)
        }
    }
}
