//! HTTP model gateway.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::response::extract_output;
use super::traits::{LlmError, LlmResult, ModelGateway};

const DEFAULT_GENERATE_PATH: &str = "/api/generate";
const DEFAULT_HEALTH_PATH: &str = "/api/tags";

/// Gateway request format.
#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

/// Error body some gateways return on failure.
#[derive(Debug, Deserialize)]
struct GatewayError {
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

impl GatewayError {
    fn into_message(self) -> Option<String> {
        match (self.error, self.message) {
            (Some(serde_json::Value::String(s)), _) => Some(s),
            (Some(serde_json::Value::Object(obj)), _) => obj
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string),
            (_, Some(m)) => Some(m),
            _ => None,
        }
    }
}

/// Gateway reached over HTTPS with an API-key header.
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    generate_path: String,
    health_path: String,
    request_timeout: Duration,
    health_timeout: Duration,
}

impl HttpGateway {
    /// Creates a gateway rooted at `base_url`.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            generate_path: DEFAULT_GENERATE_PATH.to_string(),
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            request_timeout: Duration::from_secs(120),
            health_timeout: Duration::from_secs(5),
        }
    }

    /// Overrides the generate and health endpoint paths.
    pub fn with_paths(mut self, generate: impl Into<String>, health: impl Into<String>) -> Self {
        self.generate_path = generate.into();
        self.health_path = health.into();
        self
    }

    pub fn with_timeouts(mut self, request: Duration, health: Duration) -> Self {
        self.request_timeout = request;
        self.health_timeout = health;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            if let Ok(value) = HeaderValue::from_str(key) {
                headers.insert("x-api-key", value);
            }
        }
        headers
    }

    async fn handle_error_response(&self, response: reqwest::Response) -> LlmError {
        let status = response.status().as_u16();

        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());

            return LlmError::RateLimited {
                retry_after_secs: retry_after,
            };
        }

        let message = response
            .json::<GatewayError>()
            .await
            .ok()
            .and_then(GatewayError::into_message)
            .unwrap_or_else(|| format!("HTTP {}", status));

        if status == 401 || status == 403 {
            return LlmError::AuthenticationError(message);
        }

        LlmError::ApiError { status, message }
    }
}

#[async_trait]
impl ModelGateway for HttpGateway {
    async fn generate(&self, model: &str, prompt: &str) -> LlmResult<String> {
        let body = GenerateRequest {
            model,
            prompt,
            stream: false,
        };

        let response = self
            .client
            .post(self.url(&self.generate_path))
            .headers(self.build_headers())
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.handle_error_response(response).await);
        }

        let text = response.text().await?;
        let (output, shape) = extract_output(&text)?;
        tracing::trace!(model, ?shape, "extracted model output");
        Ok(output)
    }

    async fn health_check(&self) -> bool {
        let result = self
            .client
            .get(self.url(&self.health_path))
            .headers(self.build_headers())
            .timeout(self.health_timeout)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::warn!(status = response.status().as_u16(), "gateway health check failed");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "gateway unreachable");
                false
            }
        }
    }
}

impl std::fmt::Debug for HttpGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpGateway")
            .field("base_url", &self.base_url)
            .field("generate_path", &self.generate_path)
            .field("health_path", &self.health_path)
            .finish_non_exhaustive()
    }
}
