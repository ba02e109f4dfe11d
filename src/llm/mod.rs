//! Reasoning-backend client module.
//!
//! The engine never talks to a language model directly; it goes through the
//! [`CompletionClient`] trait, which takes one bounded prompt plus a response
//! schema and returns one validated JSON value. This keeps the core testable
//! with a deterministic stub and makes every reasoning call an explicit,
//! size-limited transaction; there is no conversational state in here.

mod error;
mod openrouter;

pub use error::{classify_http_status, CompletionError, CompletionErrorKind, RetryConfig};
pub use openrouter::OpenRouterCompletions;

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Schema the model's reply must satisfy.
///
/// Passed to providers that support structured output (`json_schema` response
/// format) and echoed into the prompt for providers that do not.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseSchema {
    /// Short identifier for the schema (provider requirement)
    pub name: String,
    /// JSON Schema describing the expected reply
    pub schema: serde_json::Value,
}

impl ResponseSchema {
    pub fn new(name: impl Into<String>, schema: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}

/// One bounded completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Model identifier (OpenRouter format)
    pub model: String,
    /// System framing for the call
    pub system: String,
    /// The user-turn prompt
    pub prompt: String,
    /// Schema the reply must satisfy
    pub schema: ResponseSchema,
    /// Hard cap on generated tokens
    pub max_output_tokens: u64,
}

/// A validated completion: parsed JSON plus usage telemetry.
#[derive(Debug, Clone)]
pub struct Completion {
    /// The model's reply, parsed as JSON
    pub value: serde_json::Value,
    /// Token usage reported by the provider (zero when unknown)
    pub usage: TokenUsage,
    /// Model that actually served the request
    pub model: Option<String>,
}

/// Token usage for one or more completion calls.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Create a usage record ensuring `total_tokens` is consistent.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Component-wise saturating sum.
    pub fn merge(&self, other: &TokenUsage) -> TokenUsage {
        TokenUsage::new(
            self.prompt_tokens.saturating_add(other.prompt_tokens),
            self.completion_tokens
                .saturating_add(other.completion_tokens),
        )
    }
}

/// Trait for reasoning-backend clients.
///
/// One call, one bounded reply. Implementations must never keep conversational
/// state between calls.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Send one completion request and return its validated JSON reply.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError>;
}

/// Run a completion with exactly one automatic repair attempt.
///
/// `parse` turns the raw JSON value into the caller's type, returning a
/// human-readable description of what was wrong on failure. When the first
/// reply fails to parse (or the client reports a schema violation), the prompt
/// is re-sent once with the error appended as guidance. A second failure is
/// returned to the caller; there is never a third call.
pub async fn complete_with_repair<T, F>(
    client: &dyn CompletionClient,
    request: &CompletionRequest,
    mut parse: F,
) -> Result<(T, TokenUsage), CompletionError>
where
    F: FnMut(&serde_json::Value) -> Result<T, String>,
    T: Send,
{
    let mut usage = TokenUsage::default();

    let first_error = match client.complete(request).await {
        Ok(completion) => {
            usage = usage.merge(&completion.usage);
            match parse(&completion.value) {
                Ok(parsed) => return Ok((parsed, usage)),
                Err(why) => why,
            }
        }
        Err(e) if e.kind == CompletionErrorKind::SchemaViolation => e.message,
        Err(e) => return Err(e),
    };

    tracing::warn!(error = %first_error, "completion failed validation, sending repair attempt");

    let repair = CompletionRequest {
        prompt: format!(
            "{}\n\nYour previous reply could not be used: {}\n\
             Reply again with corrected JSON only, no prose.",
            request.prompt, first_error
        ),
        ..request.clone()
    };

    let completion = client.complete(&repair).await?;
    usage = usage.merge(&completion.usage);
    match parse(&completion.value) {
        Ok(parsed) => Ok((parsed, usage)),
        Err(why) => Err(CompletionError::schema_violation(format!(
            "reply failed validation after repair attempt: {}",
            why
        ))),
    }
}

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*\})\s*```").expect("fenced-json pattern")
});

/// Extract a JSON object from model text that may wrap it in markdown fences
/// or surrounding prose.
pub fn extract_json_object(text: &str) -> Option<&str> {
    if let Some(caps) = FENCED_JSON.captures(text) {
        return caps.get(1).map(|m| m.as_str());
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

#[cfg(test)]
pub mod testing {
    //! Deterministic stub client for tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{Completion, CompletionClient, CompletionError, CompletionRequest, TokenUsage};

    /// Scripted completion client: pops one canned reply per call and records
    /// every request it received so tests can inspect prompts.
    pub struct StubCompletionClient {
        replies: Mutex<VecDeque<Result<serde_json::Value, CompletionError>>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl StubCompletionClient {
        pub fn new() -> Self {
            Self {
                replies: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
            }
        }

        /// Queue a successful JSON reply.
        pub fn push_value(&self, value: serde_json::Value) {
            self.replies.lock().unwrap().push_back(Ok(value));
        }

        /// Queue a failure.
        pub fn push_error(&self, error: CompletionError) {
            self.replies.lock().unwrap().push_back(Err(error));
        }

        /// Requests seen so far, oldest first.
        pub fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().unwrap().clone()
        }

        /// Number of calls made against this stub.
        pub fn call_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    impl Default for StubCompletionClient {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl CompletionClient for StubCompletionClient {
        async fn complete(
            &self,
            request: &CompletionRequest,
        ) -> Result<Completion, CompletionError> {
            self.requests.lock().unwrap().push(request.clone());
            let next = self.replies.lock().unwrap().pop_front();
            match next {
                Some(Ok(value)) => Ok(Completion {
                    value,
                    usage: TokenUsage::new(100, 50),
                    model: Some(request.model.clone()),
                }),
                Some(Err(e)) => Err(e),
                None => Err(CompletionError::network_error(
                    "stub has no scripted reply left".to_string(),
                )),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::testing::StubCompletionClient;
    use super::*;

    #[test]
    fn test_extract_plain_object() {
        let text = r#"{"a": 1}"#;
        assert_eq!(extract_json_object(text), Some(r#"{"a": 1}"#));
    }

    #[test]
    fn test_extract_fenced_object() {
        let text = "Here is the plan:\n```json\n{\"a\": 1}\n```\nDone.";
        assert_eq!(extract_json_object(text), Some("{\"a\": 1}"));
    }

    #[test]
    fn test_extract_embedded_object() {
        let text = "Sure! {\"a\": {\"b\": 2}} hope that helps";
        assert_eq!(extract_json_object(text), Some("{\"a\": {\"b\": 2}}"));
    }

    #[test]
    fn test_extract_no_object() {
        assert_eq!(extract_json_object("no json here"), None);
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "test/model".to_string(),
            system: "system".to_string(),
            prompt: "prompt".to_string(),
            schema: ResponseSchema::new("reply", json!({"type": "object"})),
            max_output_tokens: 256,
        }
    }

    #[tokio::test]
    async fn test_repair_retries_exactly_once() {
        let stub = StubCompletionClient::new();
        stub.push_value(json!({"wrong": true}));
        stub.push_value(json!({"right": true}));

        let (value, usage) = complete_with_repair(&stub, &request(), |v| {
            if v.get("right").is_some() {
                Ok(v.clone())
            } else {
                Err("missing field `right`".to_string())
            }
        })
        .await
        .unwrap();

        assert!(value.get("right").is_some());
        assert_eq!(stub.call_count(), 2);
        // Usage accumulates over both attempts.
        assert_eq!(usage.total_tokens, 300);

        // The repair prompt carries the validation error as guidance.
        let second = &stub.requests()[1];
        assert!(second.prompt.contains("missing field `right`"));
    }

    #[tokio::test]
    async fn test_second_failure_surfaces() {
        let stub = StubCompletionClient::new();
        stub.push_value(json!({"wrong": true}));
        stub.push_value(json!({"still_wrong": true}));

        let err = complete_with_repair(&stub, &request(), |v| {
            v.get("right")
                .cloned()
                .ok_or_else(|| "missing field `right`".to_string())
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind, CompletionErrorKind::SchemaViolation);
        assert_eq!(stub.call_count(), 2);
    }

    #[tokio::test]
    async fn test_transient_error_not_repaired() {
        let stub = StubCompletionClient::new();
        stub.push_error(CompletionError::network_error("unreachable".to_string()));

        let err = complete_with_repair(&stub, &request(), |v| Ok(v.clone()))
            .await
            .unwrap_err();

        assert_eq!(err.kind, CompletionErrorKind::NetworkError);
        assert_eq!(stub.call_count(), 1);
    }
}
