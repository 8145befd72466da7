//! Configuration validation errors

use thiserror::Error;

/// A setting that loaded but cannot be used
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("[{section}] {field} must be {requirement}")]
    Invalid {
        section: &'static str,
        field: &'static str,
        requirement: &'static str,
    },
}

impl ConfigError {
    pub(crate) fn invalid(
        section: &'static str,
        field: &'static str,
        requirement: &'static str,
    ) -> Self {
        Self::Invalid {
            section,
            field,
            requirement,
        }
    }
}
