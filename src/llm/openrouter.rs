//! OpenRouter-backed [`CompletionClient`] with automatic retry for transient errors.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::error::{classify_http_status, CompletionError, CompletionErrorKind, RetryConfig};
use super::{extract_json_object, Completion, CompletionClient, CompletionRequest, TokenUsage};

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// OpenRouter API client requesting structured JSON output.
pub struct OpenRouterCompletions {
    client: Client,
    api_key: String,
    retry_config: RetryConfig,
}

impl OpenRouterCompletions {
    /// Create a client with the default retry configuration.
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            retry_config: RetryConfig::default(),
        }
    }

    /// Create a client with a custom retry configuration.
    pub fn with_retry_config(api_key: String, retry_config: RetryConfig) -> Self {
        Self {
            client: Client::new(),
            api_key,
            retry_config,
        }
    }

    /// Parse a Retry-After header if present (seconds form only).
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok().map(Duration::from_secs))
    }

    /// Map an HTTP failure onto the error taxonomy.
    fn create_error(
        status: reqwest::StatusCode,
        body: &str,
        retry_after: Option<Duration>,
    ) -> CompletionError {
        let status_code = status.as_u16();
        match classify_http_status(status_code) {
            CompletionErrorKind::RateLimited => {
                CompletionError::rate_limited(body.to_string(), retry_after)
            }
            CompletionErrorKind::ServerError => {
                CompletionError::server_error(status_code, body.to_string())
            }
            _ => CompletionError::client_error(status_code, body.to_string()),
        }
    }

    /// Execute a single request without retry.
    async fn execute_request(
        &self,
        request: &OpenRouterRequest<'_>,
    ) -> Result<Completion, CompletionError> {
        let response = match self
            .client
            .post(OPENROUTER_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                if e.is_timeout() {
                    return Err(CompletionError::network_error(format!(
                        "Request timeout: {}",
                        e
                    )));
                } else if e.is_connect() {
                    return Err(CompletionError::network_error(format!(
                        "Connection failed: {}",
                        e
                    )));
                } else {
                    return Err(CompletionError::network_error(format!(
                        "Request failed: {}",
                        e
                    )));
                }
            }
        };

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(Self::create_error(status, &body, retry_after));
        }

        parse_success_body(&body, &request.model)
    }

    /// Execute a request with automatic retry for transient errors.
    async fn execute_with_retry(
        &self,
        request: &OpenRouterRequest<'_>,
    ) -> Result<Completion, CompletionError> {
        let start = Instant::now();
        let mut attempt = 0;
        let mut last_error: Option<CompletionError> = None;

        loop {
            if start.elapsed() > self.retry_config.max_retry_duration {
                return Err(last_error.unwrap_or_else(|| {
                    CompletionError::network_error("Max retry duration exceeded".to_string())
                }));
            }

            match self.execute_request(request).await {
                Ok(completion) => {
                    if attempt > 0 {
                        tracing::info!(
                            "Request succeeded after {} retries (total time: {:?})",
                            attempt,
                            start.elapsed()
                        );
                    }
                    return Ok(completion);
                }
                Err(error) => {
                    let should_retry = self.retry_config.should_retry(&error)
                        && attempt < self.retry_config.max_retries;

                    if should_retry {
                        let delay = error.suggested_delay(attempt);
                        let remaining = self
                            .retry_config
                            .max_retry_duration
                            .saturating_sub(start.elapsed());
                        let actual_delay = delay.min(remaining);

                        if actual_delay.is_zero() {
                            tracing::warn!(
                                "Retry attempt {} failed, no time remaining: {}",
                                attempt + 1,
                                error
                            );
                            return Err(error);
                        }

                        tracing::warn!(
                            "Retry attempt {} failed with {}, retrying in {:?}: {}",
                            attempt + 1,
                            error.kind,
                            actual_delay,
                            error.message
                        );

                        tokio::time::sleep(actual_delay).await;
                        attempt += 1;
                        last_error = Some(error);
                    } else {
                        if attempt > 0 {
                            tracing::error!(
                                "Request failed after {} retries (total time: {:?}): {}",
                                attempt,
                                start.elapsed(),
                                error
                            );
                        } else {
                            tracing::error!("Request failed (non-retryable): {}", error);
                        }
                        return Err(error);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl CompletionClient for OpenRouterCompletions {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
        let messages = vec![
            WireMessage {
                role: "system",
                content: &request.system,
            },
            WireMessage {
                role: "user",
                content: &request.prompt,
            },
        ];

        let wire = OpenRouterRequest {
            model: request.model.clone(),
            messages,
            max_tokens: Some(request.max_output_tokens),
            response_format: Some(ResponseFormat {
                format_type: "json_schema",
                json_schema: JsonSchemaFormat {
                    name: &request.schema.name,
                    strict: true,
                    schema: &request.schema.schema,
                },
            }),
        };

        tracing::debug!(model = %request.model, schema = %request.schema.name, "sending completion request");

        self.execute_with_retry(&wire).await
    }
}

/// Parse a 2xx response body into a [`Completion`].
fn parse_success_body(body: &str, request_model: &str) -> Result<Completion, CompletionError> {
    let parsed: OpenRouterResponse = serde_json::from_str(body).map_err(|e| {
        CompletionError::schema_violation(format!("Failed to parse response: {}, body: {}", e, body))
    })?;

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| CompletionError::schema_violation("No choices in response".to_string()))?;

    let content = choice
        .message
        .content
        .ok_or_else(|| CompletionError::schema_violation("Empty completion content".to_string()))?;

    // Even with response_format set some models wrap the object in fences.
    let raw = extract_json_object(&content).ok_or_else(|| {
        let preview: String = content.chars().take(200).collect();
        CompletionError::schema_violation(format!("No JSON object in completion: {preview}"))
    })?;

    let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
        CompletionError::schema_violation(format!("Completion is not valid JSON: {}", e))
    })?;

    Ok(Completion {
        value,
        usage: parsed
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default(),
        model: parsed.model.or_else(|| Some(request_model.to_string())),
    })
}

/// OpenRouter API request format.
#[derive(Debug, Serialize)]
struct OpenRouterRequest<'a> {
    model: String,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat<'a>>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    format_type: &'static str,
    json_schema: JsonSchemaFormat<'a>,
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat<'a> {
    name: &'a str,
    strict: bool,
    schema: &'a serde_json::Value,
}

/// OpenRouter API response format.
#[derive(Debug, Deserialize)]
struct OpenRouterResponse {
    choices: Vec<OpenRouterChoice>,
    #[serde(default)]
    usage: Option<OpenRouterUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterChoice {
    message: OpenRouterMessage,
}

#[derive(Debug, Deserialize)]
struct OpenRouterMessage {
    content: Option<String>,
}

/// Usage data (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct OpenRouterUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}
