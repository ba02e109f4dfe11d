//! Reasoning-backend error types with retry classification.
//!
//! Distinguishes between transient errors (should retry) and permanent errors
//! (should not retry). Schema violations are permanent for the client but the
//! caller is entitled to exactly one repair attempt, see `complete_with_repair`.

use std::time::Duration;

/// Error from a completion call.
#[derive(Debug, Clone)]
pub struct CompletionError {
    /// The kind of error
    pub kind: CompletionErrorKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    /// Error message
    pub message: String,
    /// Suggested retry delay (from Retry-After header or calculated)
    pub retry_after: Option<Duration>,
}

impl CompletionError {
    /// Create a rate limit error.
    pub fn rate_limited(message: String, retry_after: Option<Duration>) -> Self {
        Self {
            kind: CompletionErrorKind::RateLimited,
            status_code: Some(429),
            message,
            retry_after,
        }
    }

    /// Create a server error.
    pub fn server_error(status_code: u16, message: String) -> Self {
        Self {
            kind: CompletionErrorKind::ServerError,
            status_code: Some(status_code),
            message,
            retry_after: None,
        }
    }

    /// Create a client error (bad request, auth, etc.).
    pub fn client_error(status_code: u16, message: String) -> Self {
        Self {
            kind: CompletionErrorKind::ClientError,
            status_code: Some(status_code),
            message,
            retry_after: None,
        }
    }

    /// Create a network error.
    pub fn network_error(message: String) -> Self {
        Self {
            kind: CompletionErrorKind::NetworkError,
            status_code: None,
            message,
            retry_after: None,
        }
    }

    /// Create a schema violation: the model replied, but not with usable JSON.
    pub fn schema_violation(message: String) -> Self {
        Self {
            kind: CompletionErrorKind::SchemaViolation,
            status_code: None,
            message,
            retry_after: None,
        }
    }

    /// Check if this error is transient and should be retried.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Get the suggested delay before retry.
    ///
    /// Returns the `retry_after` if set, otherwise returns a default based on error kind.
    pub fn suggested_delay(&self, attempt: u32) -> Duration {
        if let Some(retry_after) = self.retry_after {
            return retry_after;
        }

        let base_delay = match self.kind {
            CompletionErrorKind::RateLimited => Duration::from_secs(5),
            CompletionErrorKind::ServerError => Duration::from_secs(2),
            CompletionErrorKind::NetworkError => Duration::from_secs(1),
            _ => Duration::from_secs(1),
        };

        // Exponential backoff: base * 2^attempt
        let multiplier = 2u64.saturating_pow(attempt);
        let delay_secs = base_delay.as_secs().saturating_mul(multiplier);

        // Deterministic jitter (up to 25% of delay) before capping
        let jitter_range = delay_secs / 4;
        let jitter = if jitter_range > 0 {
            (attempt as u64 * 7) % jitter_range
        } else {
            0
        };

        // Cap total delay (including jitter) at 60 seconds
        let total_delay = (delay_secs + jitter).min(60);

        Duration::from_secs(total_delay)
    }
}

impl std::fmt::Display for CompletionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for CompletionError {}

/// Classification of completion errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionErrorKind {
    /// Rate limited (429) - transient, should retry with backoff
    RateLimited,
    /// Server error (500, 502, 503, 504) - transient, should retry
    ServerError,
    /// Client error (400, 401, 403, 404) - permanent, should not retry
    ClientError,
    /// Network error (connection failed, timeout) - transient, should retry
    NetworkError,
    /// The model's output did not validate against the requested schema.
    /// Permanent for the client; caller may issue one repair attempt.
    SchemaViolation,
}

impl CompletionErrorKind {
    /// Check if this error kind is transient (should retry with the same request).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CompletionErrorKind::RateLimited
                | CompletionErrorKind::ServerError
                | CompletionErrorKind::NetworkError
        )
    }
}

impl std::fmt::Display for CompletionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionErrorKind::RateLimited => write!(f, "Rate limited"),
            CompletionErrorKind::ServerError => write!(f, "Server error"),
            CompletionErrorKind::ClientError => write!(f, "Client error"),
            CompletionErrorKind::NetworkError => write!(f, "Network error"),
            CompletionErrorKind::SchemaViolation => write!(f, "Schema violation"),
        }
    }
}

/// Configuration for retry behavior inside the HTTP client.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Maximum total time to spend retrying
    pub max_retry_duration: Duration,
    /// Whether to retry on rate limit errors
    pub retry_rate_limits: bool,
    /// Whether to retry on server errors
    pub retry_server_errors: bool,
    /// Whether to retry on network errors
    pub retry_network_errors: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_retry_duration: Duration::from_secs(120),
            retry_rate_limits: true,
            retry_server_errors: true,
            retry_network_errors: true,
        }
    }
}

impl RetryConfig {
    /// Check if the given error should be retried based on this config.
    pub fn should_retry(&self, error: &CompletionError) -> bool {
        match error.kind {
            CompletionErrorKind::RateLimited => self.retry_rate_limits,
            CompletionErrorKind::ServerError => self.retry_server_errors,
            CompletionErrorKind::NetworkError => self.retry_network_errors,
            // Never retried by the client; repair attempts are the caller's call.
            CompletionErrorKind::ClientError | CompletionErrorKind::SchemaViolation => false,
        }
    }
}

/// Parse HTTP status code into error kind.
pub fn classify_http_status(status: u16) -> CompletionErrorKind {
    match status {
        429 => CompletionErrorKind::RateLimited,
        500 | 502 | 503 | 504 => CompletionErrorKind::ServerError,
        400..=499 => CompletionErrorKind::ClientError,
        _ => CompletionErrorKind::ServerError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CompletionErrorKind::RateLimited.is_transient());
        assert!(CompletionErrorKind::ServerError.is_transient());
        assert!(CompletionErrorKind::NetworkError.is_transient());
        assert!(!CompletionErrorKind::ClientError.is_transient());
        assert!(!CompletionErrorKind::SchemaViolation.is_transient());
    }

    #[test]
    fn test_http_status_classification() {
        assert_eq!(classify_http_status(429), CompletionErrorKind::RateLimited);
        assert_eq!(classify_http_status(500), CompletionErrorKind::ServerError);
        assert_eq!(classify_http_status(503), CompletionErrorKind::ServerError);
        assert_eq!(classify_http_status(400), CompletionErrorKind::ClientError);
        assert_eq!(classify_http_status(401), CompletionErrorKind::ClientError);
    }

    #[test]
    fn test_exponential_backoff() {
        let error = CompletionError::rate_limited("test".to_string(), None);

        let delay_0 = error.suggested_delay(0);
        let delay_1 = error.suggested_delay(1);
        let delay_2 = error.suggested_delay(2);

        assert!(delay_1 > delay_0);
        assert!(delay_2 > delay_1);

        // Should be capped
        let delay_10 = error.suggested_delay(10);
        assert!(delay_10.as_secs() <= 60);
    }

    #[test]
    fn test_retry_after_respected() {
        let error =
            CompletionError::rate_limited("test".to_string(), Some(Duration::from_secs(30)));

        assert_eq!(error.suggested_delay(0), Duration::from_secs(30));
        assert_eq!(error.suggested_delay(5), Duration::from_secs(30));
    }

    #[test]
    fn test_schema_violation_not_retried_by_client() {
        let config = RetryConfig::default();
        let error = CompletionError::schema_violation("not json".to_string());
        assert!(!config.should_retry(&error));
    }
}
