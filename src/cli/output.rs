//! Output handlers for CLI commands
//!
//! Supports console (pretty), JSON, and quiet output modes.

use crate::store::{ExecutionRecord, ExecutionStatus, ResultEntry};
use serde::Serialize;

/// Output mode for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Console,
    Json,
    Quiet,
}

impl OutputMode {
    /// Parse from string
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "quiet" => Self::Quiet,
            _ => Self::Console,
        }
    }
}

/// Events emitted by commands
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    ExecutionStarted {
        execution_id: i64,
        workflow_id: String,
        nodes: u32,
    },
    ExecutionStatus {
        execution: ExecutionRecord,
    },
    NodeResults {
        execution_id: i64,
        results: Vec<ResultEntry>,
    },
    ExecutionCancelled {
        execution_id: i64,
        cancelled: Vec<String>,
    },
    WorkflowValidated {
        workflow_id: String,
        nodes: usize,
        edges: usize,
        order: Vec<String>,
    },
    WorkflowInvalid {
        workflow_id: String,
        error: String,
    },
    WorkerStarted {
        worker_id: String,
        pool_size: usize,
    },
    Info {
        message: String,
    },
}

/// Output handler trait
pub trait OutputHandler: Send + Sync {
    /// Emit an event
    fn emit(&self, event: OutputEvent);
}

fn status_mark(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Completed => "✓",
        ExecutionStatus::Pending | ExecutionStatus::Running => "…",
        _ => "✗",
    }
}

/// Console output handler
pub struct ConsoleHandler;

impl ConsoleHandler {
    fn format_duration(ms: i64) -> String {
        if ms < 1000 {
            format!("{}ms", ms)
        } else {
            format!("{:.1}s", ms as f64 / 1000.0)
        }
    }
}

impl OutputHandler for ConsoleHandler {
    fn emit(&self, event: OutputEvent) {
        match event {
            OutputEvent::ExecutionStarted {
                execution_id,
                workflow_id,
                nodes,
            } => {
                println!(
                    "Started execution {} of '{}' ({} nodes)",
                    execution_id, workflow_id, nodes
                );
            }
            OutputEvent::ExecutionStatus { execution } => {
                println!(
                    "{} execution {} [{}] {}",
                    status_mark(execution.status),
                    execution.id,
                    execution.workflow_id,
                    execution.status
                );
                println!(
                    "  nodes: {} total, {} pending, {} running, {} completed, {} failed",
                    execution.total_nodes,
                    execution.pending_nodes,
                    execution.running_nodes,
                    execution.completed_nodes,
                    execution.failed_nodes
                );
                if execution.is_retry {
                    println!(
                        "  retry {}/{} of execution {}",
                        execution.retry_count,
                        execution.max_retries,
                        execution
                            .parent_execution_id
                            .map(|id| id.to_string())
                            .unwrap_or_else(|| "?".into())
                    );
                }
                if let (Some(started), Some(ended)) = (execution.started_at, execution.ended_at) {
                    let elapsed = (ended - started).num_milliseconds();
                    println!("  duration: {}", Self::format_duration(elapsed));
                }
                if let Some(error) = execution.error_message {
                    println!("  {}", error);
                }
            }
            OutputEvent::NodeResults {
                execution_id,
                results,
            } => {
                println!("Results for execution {}:", execution_id);
                for result in results {
                    let duration = result
                        .usage
                        .duration_ms
                        .map(|ms| format!(" ({})", Self::format_duration(ms as i64)))
                        .unwrap_or_default();
                    println!(
                        "  {:<24} {}{} attempts={}",
                        result.node_id, result.status, duration, result.attempt
                    );
                    if let Some(error) = result.error_message {
                        println!("    {}", error);
                    }
                }
            }
            OutputEvent::ExecutionCancelled {
                execution_id,
                cancelled,
            } => {
                println!(
                    "Cancelled execution {} ({} nodes)",
                    execution_id,
                    cancelled.len()
                );
            }
            OutputEvent::WorkflowValidated {
                workflow_id,
                nodes,
                edges,
                order,
            } => {
                println!(
                    "✓ Workflow '{}' is valid ({} nodes, {} edges)",
                    workflow_id, nodes, edges
                );
                println!("  order: {}", order.join(" → "));
            }
            OutputEvent::WorkflowInvalid { workflow_id, error } => {
                eprintln!("✗ Workflow '{}' is invalid: {}", workflow_id, error);
            }
            OutputEvent::WorkerStarted {
                worker_id,
                pool_size,
            } => {
                eprintln!("Worker {} started ({} slots)", worker_id, pool_size);
            }
            OutputEvent::Info { message } => {
                eprintln!("{}", message);
            }
        }
    }
}

/// JSON output handler
pub struct JsonHandler {
    pretty: bool,
}

impl JsonHandler {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    fn render<T: Serialize>(&self, value: &T) -> Option<String> {
        let json = if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };
        json.ok()
    }
}

impl OutputHandler for JsonHandler {
    fn emit(&self, event: OutputEvent) {
        if let Some(s) = self.render(&event) {
            println!("{}", s);
        }
    }
}

/// Quiet handler that emits nothing
pub struct QuietHandler;

impl OutputHandler for QuietHandler {
    fn emit(&self, _event: OutputEvent) {}
}

/// Create an output handler based on mode
pub fn create_handler(mode: OutputMode) -> Box<dyn OutputHandler> {
    match mode {
        OutputMode::Console => Box::new(ConsoleHandler),
        OutputMode::Json => Box::new(JsonHandler::new(true)),
        OutputMode::Quiet => Box::new(QuietHandler),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Handler that records events
    #[derive(Clone, Default)]
    pub(crate) struct MockHandler {
        events: Arc<Mutex<Vec<OutputEvent>>>,
    }

    impl MockHandler {
        pub(crate) fn events(&self) -> Vec<OutputEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl OutputHandler for MockHandler {
        fn emit(&self, event: OutputEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn test_output_mode_parse() {
        assert_eq!(OutputMode::parse("json"), OutputMode::Json);
        assert_eq!(OutputMode::parse("JSON"), OutputMode::Json);
        assert_eq!(OutputMode::parse("quiet"), OutputMode::Quiet);
        assert_eq!(OutputMode::parse("console"), OutputMode::Console);
        assert_eq!(OutputMode::parse("unknown"), OutputMode::Console);
    }

    #[test]
    fn test_console_format_duration() {
        assert_eq!(ConsoleHandler::format_duration(500), "500ms");
        assert_eq!(ConsoleHandler::format_duration(1000), "1.0s");
        assert_eq!(ConsoleHandler::format_duration(2500), "2.5s");
    }

    #[test]
    fn test_json_events_are_tagged() {
        let handler = JsonHandler::new(false);
        let json = handler
            .render(&OutputEvent::ExecutionCancelled {
                execution_id: 7,
                cancelled: vec!["a".into()],
            })
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "execution_cancelled");
        assert_eq!(value["execution_id"], 7);
    }

    #[test]
    fn test_mock_handler_captures_events() {
        let handler = MockHandler::default();
        handler.emit(OutputEvent::Info {
            message: "hello".into(),
        });
        assert_eq!(handler.events().len(), 1);
    }
}
