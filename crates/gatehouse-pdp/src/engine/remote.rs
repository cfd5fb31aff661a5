//! Evaluation delegated to an external OPA-compatible service.
//!
//! Each evaluation is a `POST {url}{endpoint_path}` carrying
//! `{input, query, policy}`; the response's `result` member is interpreted
//! with the shared result rules. Transport failures are errors, never a
//! silent deny.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::config::{RemoteEngineConfig, join_endpoint};
use crate::engine::{EvaluationOutcome, interpret_result};

/// Errors raised by the remote evaluator client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteEngineError {
    /// The evaluator could not be reached or the request timed out.
    #[error("Failed to evaluate policy with external evaluator: {0}")]
    Network(String),

    /// The evaluator answered with a non-success status.
    #[error("External evaluator returned status {0}")]
    Http(u16),

    /// The response body is not JSON.
    #[error("Failed to decode external evaluator response: {0}")]
    Decode(String),

    /// The client is misconfigured.
    #[error("Invalid external evaluator configuration: {0}")]
    Config(String),
}

#[derive(Serialize)]
struct EvaluationRequest<'a> {
    input: &'a Value,
    query: &'a str,
    policy: &'a str,
}

/// HTTP client for the external evaluator.
pub struct RemoteEngine {
    http_client: reqwest::Client,
    endpoint: String,
}

impl RemoteEngine {
    /// Creates a client posting to `{url}{endpoint_path}`.
    ///
    /// # Errors
    ///
    /// Returns `RemoteEngineError::Config` if the HTTP client cannot be built.
    pub fn new(
        url: &Url,
        endpoint_path: &str,
        request_timeout: Duration,
    ) -> Result<Self, RemoteEngineError> {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RemoteEngineError::Config(e.to_string()))?;

        Ok(Self {
            http_client,
            endpoint: join_endpoint(url, endpoint_path),
        })
    }

    /// Creates a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns `RemoteEngineError::Config` if the URL is missing or the HTTP
    /// client cannot be built.
    pub fn from_config(config: &RemoteEngineConfig) -> Result<Self, RemoteEngineError> {
        let url = config
            .url
            .as_ref()
            .ok_or_else(|| RemoteEngineError::Config("url is not set".to_string()))?;
        Self::new(url, &config.endpoint_path, config.request_timeout)
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Evaluates `query` for `input` on the external service.
    ///
    /// # Errors
    ///
    /// Returns an error on network failure, timeout, non-2xx status or an
    /// undecodable body.
    pub async fn evaluate(
        &self,
        policy: &str,
        input: &Value,
        query: &str,
    ) -> Result<EvaluationOutcome, RemoteEngineError> {
        let request = EvaluationRequest {
            input,
            query,
            policy,
        };

        let response = self
            .http_client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(endpoint = %self.endpoint, error = %e, "External evaluator unreachable");
                RemoteEngineError::Network(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!(endpoint = %self.endpoint, status = status.as_u16(), "External evaluator rejected request");
            return Err(RemoteEngineError::Http(status.as_u16()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| RemoteEngineError::Decode(e.to_string()))?;

        let result = body.get("result").unwrap_or(&Value::Null);
        Ok(interpret_result(result))
    }
}
