//! Configuration types and loading for flowsched

mod error;
mod loader;
mod sections;

pub use error::ConfigError;
pub use loader::FlowschedConfig;
pub use sections::{
    DatabaseConfig, ExecutionConfig, PathsConfig, RetryConfig, SchedulerConfig, WorkersConfig,
};
