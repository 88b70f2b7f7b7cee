//! Core traits for request executors
//!
//! The dispatch engine only knows this contract. Concrete executors (HTTP
//! request construction, retries, response parsing) live in the vendors crate.

use crate::record::CompletedRequestRecord;
use async_trait::async_trait;
use std::time::Duration;

/// Transport session shared by every in-flight request of one run.
///
/// Created once per run by the dispatcher and dropped after the drain.
pub type Session = reqwest::Client;

// ============================================================================
// Request Executor Trait
// ============================================================================

/// Performs one logical request (including any retries) and reports its outcome.
///
/// Must be safe to call concurrently: many invocations share one [`Session`].
/// A non-2xx response is data and is returned as a record; only failures that
/// should end the whole run are returned as [`ExecutorError`].
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    /// Executor identifier used in logs
    fn name(&self) -> &str;

    /// Execute one logical request
    async fn execute(&self, session: &Session) -> Result<CompletedRequestRecord, ExecutorError>;
}

/// Terminal executor failures
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// HTTP/network error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Request timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Streaming parse error
    #[error("Streaming error: {0}")]
    StreamingError(String),
}
