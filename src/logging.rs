use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter directive for the given verbosity; `RUST_LOG` wins when set
pub fn filter_directive(debug: bool, quiet: bool) -> &'static str {
    if debug {
        "flowsched=debug"
    } else if quiet {
        "flowsched=error"
    } else {
        "flowsched=info"
    }
}

/// Initialize logging to stderr, plus an optional log file
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// lifetime of the process.
pub fn init_logging(
    debug: bool,
    quiet: bool,
    log_file: Option<&Path>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(debug, quiet)));

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(debug)
        .with_file(debug)
        .with_writer(std::io::stderr);

    let Some(log_path) = log_file else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
        return Ok(None);
    };

    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_target(true)
        .with_line_number(true)
        .with_file(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(file_layer)
        .try_init()?;
    Ok(Some(guard))
}

/// Default log file for a worker process
pub fn default_log_path(worker_id: &str) -> anyhow::Result<PathBuf> {
    let log_dir = dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?
        .join("flowsched")
        .join("logs");

    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    Ok(log_dir.join(format!("{}-{}.log", worker_id, timestamp)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive() {
        assert_eq!(filter_directive(true, true), "flowsched=debug");
        assert_eq!(filter_directive(false, true), "flowsched=error");
        assert_eq!(filter_directive(false, false), "flowsched=info");
    }

    #[test]
    fn test_default_log_path_names_worker() {
        if let Ok(path) = default_log_path("host-42") {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with("host-42-"));
            assert!(name.ends_with(".log"));
        }
    }
}
