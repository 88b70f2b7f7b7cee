//! Request executors for llm-loadgen
//!
//! This crate provides the HTTP side of a load run:
//!
//! - `ChatCompletionsExecutor`: streamed chat-completions requests against an
//!   Azure OpenAI style deployment
//! - SSE parsing of the response stream
//! - The `none` / `exponential` retry policies

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chat;
pub mod config;
pub mod retry;
pub mod sse;

pub use chat::{ChatCompletionsExecutor, UTILIZATION_HEADER};
pub use config::{EndpointConfig, VendorConfigError, DEFAULT_API_VERSION, DEFAULT_PROMPT};
pub use retry::{RetryPolicy, RETRY_BUDGET};
pub use sse::{ChunkSummary, SseEvent, SseParser};
