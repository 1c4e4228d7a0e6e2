//! Model gateway trait and supporting types.

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur during model calls.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),

    #[error("Rate limited, retry after {retry_after_secs:?} seconds")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    #[error("Gateway not available: {0}")]
    Unavailable(String),
}

/// Result type for model calls.
pub type LlmResult<T> = Result<T, LlmError>;

/// A text-in, text-out model endpoint shared by every model the classifier uses.
///
/// `generate` returns the model's output text already extracted from whatever
/// envelope the gateway wraps it in.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Sends `prompt` to `model` and returns its output text.
    async fn generate(&self, model: &str, prompt: &str) -> LlmResult<String>;

    /// Whether the gateway is reachable at all.
    async fn health_check(&self) -> bool;
}

#[cfg(test)]
mockall::mock! {
    pub Gateway {}

    #[async_trait]
    impl ModelGateway for Gateway {
        async fn generate(&self, model: &str, prompt: &str) -> LlmResult<String>;
        async fn health_check(&self) -> bool;
    }
}
