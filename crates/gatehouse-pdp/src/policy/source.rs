//! Remote policy source.
//!
//! The policy set lives in an external service that exposes every policy at a
//! single bulk endpoint. The response is either a JSON array of policy records
//! or an object whose `policies` member is that array.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::config::{PolicySourceConfig, join_endpoint};

/// Errors raised while fetching the policy set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The source could not be reached or the request timed out.
    #[error("Network error: {0}")]
    Network(String),

    /// The source answered with a non-success status.
    #[error("HTTP error: status {0}")]
    Http(u16),

    /// The response body is not a policy list.
    #[error("Malformed policy response: {0}")]
    Malformed(String),

    /// The source is misconfigured.
    #[error("Invalid policy source configuration: {0}")]
    Config(String),
}

/// Provider of raw policy records.
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Fetches every policy record, in source order.
    async fn fetch_policies(&self) -> Result<Vec<Value>, SourceError>;
}

/// HTTP client for the bulk policy endpoint.
pub struct HttpPolicySource {
    http_client: reqwest::Client,
    endpoint: String,
}

impl HttpPolicySource {
    /// Creates a source fetching `GET {base_url}{policies_path}`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Config` if the HTTP client cannot be built.
    pub fn new(
        base_url: &Url,
        policies_path: &str,
        request_timeout: Duration,
    ) -> Result<Self, SourceError> {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SourceError::Config(e.to_string()))?;

        Ok(Self {
            http_client,
            endpoint: join_endpoint(base_url, policies_path),
        })
    }

    /// Creates a source from configuration.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Config` if the base URL is missing or the HTTP
    /// client cannot be built.
    pub fn from_config(config: &PolicySourceConfig) -> Result<Self, SourceError> {
        let base_url = config
            .base_url
            .as_ref()
            .ok_or_else(|| SourceError::Config("base_url is not set".to_string()))?;
        Self::new(base_url, &config.policies_path, config.request_timeout)
    }

    /// Full URL of the bulk endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl PolicySource for HttpPolicySource {
    async fn fetch_policies(&self) -> Result<Vec<Value>, SourceError> {
        tracing::debug!(endpoint = %self.endpoint, "Fetching policies");

        let response = self
            .http_client
            .get(&self.endpoint)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(endpoint = %self.endpoint, error = %e, "Policy source unreachable");
                SourceError::Network(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(SourceError::Http(response.status().as_u16()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SourceError::Malformed(e.to_string()))?;

        extract_records(body)
    }
}

/// Accepts a bare array or `{ "policies": [...] }`.
fn extract_records(body: Value) -> Result<Vec<Value>, SourceError> {
    match body {
        Value::Array(records) => Ok(records),
        Value::Object(mut map) => match map.remove("policies") {
            Some(Value::Array(records)) => Ok(records),
            _ => Err(SourceError::Malformed(
                "expected an array of policies or an object with a 'policies' array".to_string(),
            )),
        },
        other => Err(SourceError::Malformed(format!(
            "expected an array of policies, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
