//! # gatehouse-pdp
//!
//! Policy decision point for the Gatehouse authorization service.
//!
//! Given a subject, an action and a resource, the decision point fetches the
//! policy set from a remote source, selects the applicable policy and
//! evaluates it, producing an allow/deny decision.
//!
//! ## Modules
//!
//! - [`config`] - Decision point configuration
//! - [`resilience`] - Circuit breaker for remote dependencies
//! - [`policy`] - Policy source client and TTL-cached policy store
//! - [`engine`] - Embedded (Wasm) and remote evaluation engines
//! - [`decision`] - Request validation, policy selection and decisions
//! - [`types`] - Wire types
//! - [`error`] - Error taxonomy
//!
//! ## Example
//!
//! ```ignore
//! use gatehouse_pdp::{Pdp, PdpConfig, PermissionCheck, Resource};
//!
//! let pdp = Pdp::from_config(&config)?;
//! let check = PermissionCheck::new("u1", "read", Resource::typed("document"));
//! let decision = pdp.check_permission(&check).await?;
//! ```

pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod policy;
pub mod resilience;
pub mod types;

use std::sync::Arc;

use serde_json::Value;

pub use config::{ConfigError, EngineKind, PdpConfig};
pub use decision::{DecisionEngine, NO_APPLICABLE_POLICY, select_policy};
pub use engine::{
    EngineError, EvaluationEngine, EvaluationOutcome, PolicyEvaluator, WasmEngineStats,
    interpret_result,
};
pub use error::{ErrorCategory, PdpError};
pub use policy::{HttpPolicySource, PolicySource, PolicyStore, PolicyStoreStats, SourceError};
pub use resilience::{BreakerError, CircuitBreaker, CircuitState};
pub use types::{AuthorizationDecision, PermissionCheck, Policy, Resource, Subject};

/// Type alias for decision point results.
pub type PdpResult<T> = Result<T, PdpError>;

/// Dependency key of the policy source circuit breaker.
pub const POLICY_SOURCE_BREAKER: &str = "policy-source";

/// Errors raised while assembling the decision point.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

// =============================================================================
// Decision Point
// =============================================================================

/// Fully wired decision point.
pub struct Pdp {
    decision: DecisionEngine,
    engine: Arc<EvaluationEngine>,
}

impl Pdp {
    /// Builds every component from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a component cannot
    /// be created.
    pub fn from_config(config: &PdpConfig) -> Result<Self, InitError> {
        config.validate()?;

        let source = Arc::new(HttpPolicySource::from_config(&config.policy_source)?);
        let policy_endpoint = source.endpoint().to_string();
        let breaker = CircuitBreaker::new(POLICY_SOURCE_BREAKER, config.circuit_breaker.clone());
        let store = Arc::new(PolicyStore::new(source, breaker, config.cache.ttl));
        let engine = Arc::new(EvaluationEngine::from_config(&config.engine)?);

        tracing::info!(
            policy_source = %policy_endpoint,
            engine = ?engine.kind(),
            cache_ttl = ?config.cache.ttl,
            "Decision point initialized"
        );

        Ok(Self::from_parts(
            store,
            engine,
            config.engine.default_query.clone(),
        ))
    }

    /// Assembles a decision point from prebuilt components.
    #[must_use]
    pub fn from_parts(
        store: Arc<PolicyStore>,
        engine: Arc<EvaluationEngine>,
        default_query: String,
    ) -> Self {
        let evaluator: Arc<dyn PolicyEvaluator> = engine.clone();
        Self {
            decision: DecisionEngine::new(store, evaluator, default_query),
            engine,
        }
    }

    /// See [`DecisionEngine::check_permission`].
    ///
    /// # Errors
    ///
    /// Returns a `PdpError` for invalid requests, unavailable policies or
    /// evaluation failures.
    pub async fn check_permission(&self, check: &PermissionCheck) -> PdpResult<AuthorizationDecision> {
        self.decision.check_permission(check).await
    }

    /// See [`DecisionEngine::test_policy`].
    ///
    /// # Errors
    ///
    /// Returns a `PdpError` for an empty policy or an evaluation failure.
    pub async fn test_policy(
        &self,
        policy: &str,
        input: &Value,
        query: Option<&str>,
    ) -> PdpResult<EvaluationOutcome> {
        self.decision.test_policy(policy, input, query).await
    }

    pub fn invalidate_cache(&self) {
        self.decision.invalidate_cache();
    }

    /// Fetches the policy set regardless of TTL.
    ///
    /// # Errors
    ///
    /// Returns `PdpError::PolicyLoad` if the source cannot be read.
    pub async fn refresh_policies(&self) -> PdpResult<usize> {
        Ok(self.decision.store().refresh().await?.len())
    }

    /// Statistics across the store and engine.
    #[must_use]
    pub fn stats(&self) -> PdpStats {
        PdpStats {
            store: self.decision.store().stats(),
            engine: self.engine.kind(),
            wasm: match self.engine.as_ref() {
                EvaluationEngine::Embedded(wasm) => Some(wasm.stats()),
                EvaluationEngine::Remote(_) => None,
            },
        }
    }
}

/// Decision point statistics.
#[derive(Debug, Clone)]
pub struct PdpStats {
    pub store: PolicyStoreStats,
    pub engine: EngineKind,
    /// Present when the embedded engine is active.
    pub wasm: Option<WasmEngineStats>,
}
