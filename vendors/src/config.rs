//! Endpoint configuration for the chat-completions executor

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// API version sent when none is configured
pub const DEFAULT_API_VERSION: &str = "2023-05-15";

/// Prompt sent when none is configured
pub const DEFAULT_PROMPT: &str = "Describe the rules of chess in detail.";

/// Configuration validation error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VendorConfigError {
    /// A required configuration field is missing.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// The endpoint is not an http(s) URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// A timeout value is out of acceptable range.
    #[error("invalid timeout: {0:?}")]
    InvalidTimeout(Duration),

    /// The request body could not be encoded.
    #[error("invalid request body: {0}")]
    InvalidRequestBody(String),
}

/// Target deployment and request shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Base endpoint URL, e.g. `https://myaccount.openai.azure.com`
    pub endpoint: String,

    /// Deployment name
    pub deployment: String,

    /// API version query parameter
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// API key sent in the `api-key` header
    #[serde(default, skip_serializing)]
    pub api_key: String,

    /// Prompt sent with every request
    #[serde(default = "default_prompt")]
    pub prompt: String,

    /// Requested `max_tokens`
    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// Prompt token estimate used when the response carries no usage block
    #[serde(default)]
    pub context_tokens: Option<u64>,

    /// Retry strategy for throttled and failed attempts
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Request timeout
    #[serde(default = "default_request_timeout")]
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Connection timeout
    #[serde(default = "default_connect_timeout")]
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_prompt() -> String {
    DEFAULT_PROMPT.to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

impl EndpointConfig {
    /// Create a config with required fields.
    pub fn new(endpoint: impl Into<String>, deployment: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            deployment: deployment.into(),
            api_version: default_api_version(),
            api_key: String::new(),
            prompt: default_prompt(),
            max_tokens: None,
            context_tokens: None,
            retry: RetryPolicy::default(),
            request_timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }

    /// Set the API key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    /// Set the API version.
    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    /// Set the prompt.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Set the requested `max_tokens`.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the prompt token estimate.
    pub fn with_context_tokens(mut self, tokens: u64) -> Self {
        self.context_tokens = Some(tokens);
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Chat-completions URL for this deployment
    pub fn url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint.trim_end_matches('/'),
            self.deployment,
            self.api_version
        )
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), VendorConfigError> {
        if self.endpoint.is_empty() {
            return Err(VendorConfigError::MissingField("endpoint"));
        }
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(VendorConfigError::InvalidEndpoint(self.endpoint.clone()));
        }
        if self.deployment.is_empty() {
            return Err(VendorConfigError::MissingField("deployment"));
        }
        if self.api_key.is_empty() {
            return Err(VendorConfigError::MissingField("api_key"));
        }

        // 1s to 1h for request, 1s to 5m for connect
        if self.request_timeout < Duration::from_secs(1)
            || self.request_timeout > Duration::from_secs(3600)
        {
            return Err(VendorConfigError::InvalidTimeout(self.request_timeout));
        }
        if self.connect_timeout < Duration::from_secs(1)
            || self.connect_timeout > Duration::from_secs(300)
        {
            return Err(VendorConfigError::InvalidTimeout(self.connect_timeout));
        }

        Ok(())
    }
}
