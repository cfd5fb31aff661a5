//! Decision point configuration.
//!
//! All components are assembled once at startup from a [`PdpConfig`]; nothing
//! is re-selected at request time.
//!
//! # Example (TOML)
//!
//! ```toml
//! [pdp.policy_source]
//! base_url = "http://user-management:3000"
//! request_timeout = "5s"
//!
//! [pdp.cache]
//! ttl = "60s"
//!
//! [pdp.circuit_breaker]
//! failure_threshold = 5
//! reset_timeout = "30s"
//!
//! [pdp.engine]
//! kind = "remote"
//!
//! [pdp.engine.remote]
//! url = "http://opa:8181"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Query evaluated when the caller does not supply one.
pub const DEFAULT_QUERY: &str = "data.authz.allow";

/// Upper bound for `cache.ttl`.
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Root decision point configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PdpConfig {
    /// Remote policy source.
    pub policy_source: PolicySourceConfig,

    /// Policy set cache.
    pub cache: CacheConfig,

    /// Circuit breaker guarding the policy source.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Evaluation engine selection and settings.
    pub engine: EngineConfig,
}

/// Remote policy source configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PolicySourceConfig {
    /// Base URL of the service exposing the policy set.
    pub base_url: Option<Url>,

    /// Path of the bulk policy endpoint, relative to `base_url`.
    pub policies_path: String,

    /// HTTP request timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for PolicySourceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            policies_path: "/policies".to_string(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Policy set cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a fetched policy set stays valid.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// How long the circuit stays open before a trial call is allowed.
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,

    /// Upper bound on a single guarded call. Elapsing counts as a failure.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            call_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Which evaluation engine variant to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// In-process WebAssembly sandbox executing compiled policy modules.
    #[default]
    #[serde(alias = "wasm")]
    Embedded,
    /// External evaluation service reached over HTTP.
    #[serde(alias = "external")]
    Remote,
}

/// Evaluation engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine variant selected at startup.
    pub kind: EngineKind,

    /// Query used by permission checks and by policy tests without a query.
    pub default_query: String,

    /// Embedded sandbox settings.
    pub embedded: WasmConfig,

    /// Remote evaluator settings.
    pub remote: RemoteEngineConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::default(),
            default_query: DEFAULT_QUERY.to_string(),
            embedded: WasmConfig::default(),
            remote: RemoteEngineConfig::default(),
        }
    }
}

/// WebAssembly sandbox configuration.
///
/// Controls resource limits for loaded policy modules.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WasmConfig {
    /// Linear memory limit in megabytes.
    pub memory_limit_mb: usize,

    /// Fuel granted to each evaluation. `None` disables fuel metering.
    pub fuel_limit: Option<u64>,
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: 64,
            fuel_limit: None,
        }
    }
}

/// Remote evaluator configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteEngineConfig {
    /// Base URL of the evaluation service.
    pub url: Option<Url>,

    /// Evaluation endpoint path, relative to `url`.
    pub endpoint_path: String,

    /// HTTP request timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for RemoteEngineConfig {
    fn default() -> Self {
        Self {
            url: None,
            endpoint_path: "/v1/data".to_string(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// A required configuration value is missing.
    #[error("Missing required configuration: {0}")]
    Missing(String),
}

impl PdpConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if the policy source URL is absent, or
    /// the remote evaluator URL is absent while the remote engine is selected.
    ///
    /// Returns `ConfigError::InvalidValue` if a threshold or timeout is zero,
    /// or the default query is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.policy_source.base_url.is_none() {
            return Err(ConfigError::Missing("policy_source.base_url".to_string()));
        }
        if self.policy_source.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "policy_source.request_timeout must be > 0".to_string(),
            ));
        }
        if self.cache.ttl.is_zero() {
            return Err(ConfigError::InvalidValue(
                "cache.ttl must be > 0".to_string(),
            ));
        }
        if self.cache.ttl > MAX_CACHE_TTL {
            return Err(ConfigError::InvalidValue(format!(
                "cache.ttl must be at most {}s",
                MAX_CACHE_TTL.as_secs()
            )));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "circuit_breaker.failure_threshold must be > 0".to_string(),
            ));
        }
        if self.circuit_breaker.reset_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "circuit_breaker.reset_timeout must be > 0".to_string(),
            ));
        }
        if self
            .circuit_breaker
            .call_timeout
            .is_some_and(|t| t.is_zero())
        {
            return Err(ConfigError::InvalidValue(
                "circuit_breaker.call_timeout must be > 0 when set".to_string(),
            ));
        }
        if self.engine.default_query.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "engine.default_query cannot be empty".to_string(),
            ));
        }
        match self.engine.kind {
            EngineKind::Embedded => {
                if self.engine.embedded.memory_limit_mb == 0 {
                    return Err(ConfigError::InvalidValue(
                        "engine.embedded.memory_limit_mb must be > 0".to_string(),
                    ));
                }
            }
            EngineKind::Remote => {
                if self.engine.remote.url.is_none() {
                    return Err(ConfigError::Missing("engine.remote.url".to_string()));
                }
                if self.engine.remote.request_timeout.is_zero() {
                    return Err(ConfigError::InvalidValue(
                        "engine.remote.request_timeout must be > 0".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Joins a configured base URL and a path with exactly one `/` between them.
/// An empty path yields the base without a trailing slash.
pub(crate) fn join_endpoint(base_url: &Url, path: &str) -> String {
    let base = base_url.as_str().trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{path}")
    }
}
