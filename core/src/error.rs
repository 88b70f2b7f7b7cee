//! Error types for llm-loadgen-core

use thiserror::Error;

use crate::config::ConfigError;
use crate::traits::ExecutorError;

/// Core error type
#[derive(Error, Debug)]
pub enum BenchError {
    /// A required builder field was not provided
    #[error("missing required configuration: {0}")]
    MissingConfig(&'static str),

    /// Configuration failed validation
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The request executor raised a terminal failure
    #[error("request executor failed: {0}")]
    Executor(#[from] ExecutorError),

    /// A dispatched task panicked or was cancelled
    #[error("dispatch task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The transport session could not be created
    #[error("failed to create transport session: {0}")]
    Session(#[from] reqwest::Error),
}

impl BenchError {
    /// Shorthand for a missing builder field
    pub fn missing_config(field: &'static str) -> Self {
        BenchError::MissingConfig(field)
    }

    /// Whether this error originated in the request executor
    pub fn is_executor_failure(&self) -> bool {
        matches!(self, BenchError::Executor(_))
    }
}

/// Result type alias
pub type BenchResult<T> = std::result::Result<T, BenchError>;
