//! Streaming chat-completions executor

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use llm_loadgen_core::{CompletedRequestRecord, ExecutorError, RequestExecutor, Session};
use reqwest::header::HeaderMap;
use reqwest::Response;
use serde::Serialize;

use crate::config::{EndpointConfig, VendorConfigError};
use crate::retry::RetryPolicy;
use crate::sse::{ChunkSummary, SseEvent, SseParser};

/// Response header carrying deployment utilization, e.g. `"42.5%"`
pub const UTILIZATION_HEADER: &str = "azure-openai-deployment-utilization";

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

/// Timing and token counts read from a streamed body
#[derive(Debug, Default)]
struct StreamOutcome {
    first_token_time: Option<Instant>,
    content_chunks: u64,
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

/// Executes one streamed chat-completions request per call.
///
/// Non-2xx responses are returned as records. With [`RetryPolicy::Exponential`]
/// throttled and server-error attempts are retried first; the record's `calls`
/// counts every attempt and `request_start_time` is the start of the first one.
pub struct ChatCompletionsExecutor {
    url: String,
    api_key: String,
    body: String,
    retry: RetryPolicy,
    context_tokens: Option<u64>,
    request_timeout: Duration,
}

impl ChatCompletionsExecutor {
    /// Create an executor from a validated endpoint configuration
    pub fn new(config: &EndpointConfig) -> Result<Self, VendorConfigError> {
        config.validate()?;

        let body = request_body(config)?;

        Ok(Self {
            url: config.url(),
            api_key: config.api_key.clone(),
            body,
            retry: config.retry,
            context_tokens: config.context_tokens,
            request_timeout: config.request_timeout,
        })
    }

    /// Target URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Session (connection pool) tuned for `max_concurrency` parallel requests
    pub fn session(
        config: &EndpointConfig,
        max_concurrency: usize,
    ) -> Result<Session, reqwest::Error> {
        Session::builder()
            .pool_max_idle_per_host(max_concurrency)
            .connect_timeout(config.connect_timeout)
            .build()
    }

    async fn send(&self, session: &Session) -> Result<Response, ExecutorError> {
        session
            .post(&self.url)
            .header("api-key", &self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(self.request_timeout)
            .body(self.body.clone())
            .send()
            .await
            .map_err(|e| self.transport_error(e))
    }

    async fn read_stream(&self, response: Response) -> Result<StreamOutcome, ExecutorError> {
        let mut outcome = StreamOutcome::default();
        let mut parser = SseParser::new();
        let mut stream = response.bytes_stream();

        'stream: while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| self.transport_error(e))?;
            for event in parser.feed(&bytes) {
                let data = match event {
                    SseEvent::Done => break 'stream,
                    SseEvent::Data(data) => data,
                };
                let Some(summary) = ChunkSummary::parse(&data) else {
                    tracing::debug!(data = %data, "Skipping unparseable stream chunk");
                    continue;
                };
                if summary.has_content {
                    outcome.first_token_time.get_or_insert_with(Instant::now);
                    outcome.content_chunks += 1;
                }
                if summary.prompt_tokens.is_some() {
                    outcome.prompt_tokens = summary.prompt_tokens;
                }
                if summary.completion_tokens.is_some() {
                    outcome.completion_tokens = summary.completion_tokens;
                }
            }
        }

        Ok(outcome)
    }

    fn transport_error(&self, e: reqwest::Error) -> ExecutorError {
        if e.is_timeout() {
            ExecutorError::Timeout(self.request_timeout)
        } else if e.is_body() || e.is_decode() {
            ExecutorError::StreamingError(e.to_string())
        } else {
            ExecutorError::Http(e)
        }
    }
}

/// JSON body sent with every attempt
fn request_body(config: &EndpointConfig) -> Result<String, VendorConfigError> {
    let request = ChatRequest {
        messages: vec![ChatMessage {
            role: "user",
            content: &config.prompt,
        }],
        max_tokens: config.max_tokens,
        stream: true,
    };
    serde_json::to_string(&request)
        .map_err(|e| VendorConfigError::InvalidRequestBody(e.to_string()))
}

/// Utilization percentage from the response headers
fn deployment_utilization(headers: &HeaderMap) -> Option<f64> {
    let value = headers.get(UTILIZATION_HEADER)?.to_str().ok()?;
    value.trim().trim_end_matches('%').trim().parse().ok()
}

#[async_trait]
impl RequestExecutor for ChatCompletionsExecutor {
    fn name(&self) -> &str {
        "chat-completions"
    }

    async fn execute(&self, session: &Session) -> Result<CompletedRequestRecord, ExecutorError> {
        let mut record = CompletedRequestRecord::started_at(Instant::now());

        loop {
            record.calls += 1;
            let response = self.send(session).await?;
            record.response_time = Instant::now();

            let status = response.status();
            record.response_status_code = status.as_u16();
            record.deployment_utilization = deployment_utilization(response.headers());

            if status.is_success() {
                let outcome = self.read_stream(response).await?;
                record.response_end_time = Instant::now();
                record.first_token_time = outcome.first_token_time.unwrap_or(record.response_end_time);
                record.generated_tokens = outcome.completion_tokens.unwrap_or(outcome.content_chunks);
                record.context_tokens = outcome
                    .prompt_tokens
                    .or(self.context_tokens)
                    .unwrap_or_default();
                return Ok(record);
            }

            let spent = record.request_start_time.elapsed();
            if let Some(delay) =
                self.retry
                    .next_delay(status, response.headers(), record.calls, spent)
            {
                tracing::debug!(
                    status = status.as_u16(),
                    attempt = record.calls,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying request"
                );
                drop(response);
                tokio::time::sleep(delay).await;
                continue;
            }

            // Drain the error body so the connection can be reused
            if let Err(e) = response.bytes().await {
                tracing::debug!(
                    status = status.as_u16(),
                    error = %e,
                    "Failed to read error response body"
                );
            }
            record.response_end_time = Instant::now();
            record.first_token_time = record.response_end_time;
            return Ok(record);
        }
    }
}

impl std::fmt::Debug for ChatCompletionsExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsExecutor")
            .field("url", &self.url)
            .field("retry", &self.retry)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_deployment_utilization_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(deployment_utilization(&headers), None);

        headers.insert(UTILIZATION_HEADER, HeaderValue::from_static("42.5%"));
        assert_eq!(deployment_utilization(&headers), Some(42.5));

        headers.insert(UTILIZATION_HEADER, HeaderValue::from_static("7"));
        assert_eq!(deployment_utilization(&headers), Some(7.0));

        headers.insert(UTILIZATION_HEADER, HeaderValue::from_static("n/a"));
        assert_eq!(deployment_utilization(&headers), None);
    }

    #[test]
    fn test_request_body() {
        let config = EndpointConfig::new("https://x", "d")
            .with_api_key("k")
            .with_prompt("hello")
            .with_max_tokens(100);
        let executor = ChatCompletionsExecutor::new(&config).unwrap();

        let body: serde_json::Value = serde_json::from_str(&executor.body).unwrap();
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hello");
        assert_eq!(body["max_tokens"], 100);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn test_body_omits_unset_max_tokens() {
        let config = EndpointConfig::new("https://x", "d").with_api_key("k");
        let executor = ChatCompletionsExecutor::new(&config).unwrap();
        assert!(!executor.body.contains("max_tokens"));
    }

    #[test]
    fn test_request_body_escapes_prompt() {
        let config = EndpointConfig::new("https://x", "d")
            .with_api_key("k")
            .with_prompt("line one\n\"quoted\" \u{7} ünïcode");

        let body = request_body(&config).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(
            parsed["messages"][0]["content"],
            "line one\n\"quoted\" \u{7} ünïcode"
        );
    }

    #[test]
    fn test_new_validates_config() {
        let config = EndpointConfig::new("https://x", "d");
        assert!(matches!(
            ChatCompletionsExecutor::new(&config),
            Err(VendorConfigError::MissingField("api_key"))
        ));
    }

    #[test]
    fn test_debug_hides_api_key() {
        let config = EndpointConfig::new("https://x", "d").with_api_key("super-secret");
        let executor = ChatCompletionsExecutor::new(&config).unwrap();
        assert!(!format!("{executor:?}").contains("super-secret"));
    }
}
