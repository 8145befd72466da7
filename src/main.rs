use anyhow::Result;
use clap::{Parser, Subcommand};
use flowsched::cli::{self, AppContext, OutputMode};
use flowsched::config::FlowschedConfig;
use flowsched::logging;
use flowsched::signals::{CancellationToken, cancel_on_shutdown_signal};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "flowsched")]
#[command(about = "Distributed DAG scheduler for workflow runs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file layered over user and project config
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides [database] path)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Project directory holding .flowsched/ (defaults to current)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Only log errors
    #[arg(long, global = true)]
    quiet: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Output format: console, json or quiet
    #[arg(long, global = true, default_value = "console")]
    output: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a run and return its id
    Start {
        /// Workflow id
        workflow: String,

        /// Trigger data as key=value pairs
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },

    /// Start a run and work it until it finishes
    Run {
        /// Workflow id
        workflow: String,

        /// Trigger data as key=value pairs
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },

    /// Run a worker pool until interrupted
    Worker,

    /// Show a run's status and counters
    Status { execution_id: i64 },

    /// Show per-node results of a run
    Results { execution_id: i64 },

    /// Cancel a run
    Cancel { execution_id: i64 },

    /// Start a fresh run of a FAILED or TIMEOUT run
    Retry { execution_id: i64 },

    /// Validate a workflow without running it
    Validate {
        /// Workflow id
        workflow: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_guard = logging::init_logging(cli.debug, cli.quiet, cli.log_file.as_deref())?;

    let config = FlowschedConfig::load(cli.dir.as_deref(), cli.config.as_deref())?;
    let app = AppContext::open(config, cli.db.as_deref())?;
    let handler = cli::create_handler(OutputMode::parse(&cli.output));
    let handler = handler.as_ref();

    let shutdown = CancellationToken::new();
    let signal_task = tokio::spawn(cancel_on_shutdown_signal(shutdown.clone()));

    let code = match cli.command {
        Commands::Start { workflow, args } => {
            cli::start_execution(&app, &workflow, &args, handler).await?
        }
        Commands::Run { workflow, args } => {
            cli::run_workflow(&app, &workflow, &args, shutdown, handler).await?
        }
        Commands::Worker => cli::run_worker(&app, shutdown, handler).await?,
        Commands::Status { execution_id } => cli::show_status(&app, execution_id, handler)?,
        Commands::Results { execution_id } => cli::show_results(&app, execution_id, handler)?,
        Commands::Cancel { execution_id } => cli::cancel_execution(&app, execution_id, handler)?,
        Commands::Retry { execution_id } => {
            cli::retry_execution(&app, execution_id, handler).await?
        }
        Commands::Validate { workflow } => {
            cli::validate_workflow(&app, &workflow, handler).await?
        }
    };

    signal_task.abort();
    if code != 0 {
        drop(log_guard);
        std::process::exit(code);
    }
    Ok(())
}
