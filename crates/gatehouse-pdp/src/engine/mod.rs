//! Policy evaluation engines.
//!
//! Two variants evaluate a policy definition against an input document:
//!
//! - [`wasm::WasmEngine`] runs a compiled OPA module in an in-process sandbox
//! - [`remote::RemoteEngine`] delegates to an external evaluation service
//!
//! The variant is chosen once at startup ([`EvaluationEngine::from_config`])
//! and consumed through the [`PolicyEvaluator`] trait.

pub mod remote;
pub mod wasm;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{EngineConfig, EngineKind};

pub use remote::{RemoteEngine, RemoteEngineError};
pub use wasm::{WasmEngine, WasmEngineError, WasmEngineStats};

// =============================================================================
// Evaluation Outcome
// =============================================================================

/// Result of evaluating a policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    pub allow: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obligations: Option<Value>,
}

impl EvaluationOutcome {
    /// A bare deny with no reason.
    #[must_use]
    pub fn deny() -> Self {
        Self::default()
    }
}

/// Interprets a policy result value.
///
/// A boolean is the allow flag. An object with a boolean `allow` yields that
/// flag plus `reason` and `obligations` when present. Anything else denies.
#[must_use]
pub fn interpret_result(value: &Value) -> EvaluationOutcome {
    match value {
        Value::Bool(allow) => EvaluationOutcome {
            allow: *allow,
            ..EvaluationOutcome::default()
        },
        Value::Object(map) => match map.get("allow") {
            Some(Value::Bool(allow)) => EvaluationOutcome {
                allow: *allow,
                reason: map.get("reason").and_then(Value::as_str).map(str::to_string),
                obligations: map.get("obligations").filter(|v| !v.is_null()).cloned(),
            },
            _ => {
                tracing::warn!("Policy result object has no boolean 'allow', denying");
                EvaluationOutcome::deny()
            }
        },
        _ => {
            tracing::warn!(result = %value, "Unrecognised policy result, denying");
            EvaluationOutcome::deny()
        }
    }
}

// =============================================================================
// Evaluator
// =============================================================================

/// Errors raised by either engine variant.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Wasm(#[from] WasmEngineError),

    #[error(transparent)]
    Remote(#[from] RemoteEngineError),
}

/// Evaluates a policy definition against an input document.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    /// Evaluates `policy` for `input`, resolving `query` as the decision rule.
    async fn evaluate(
        &self,
        policy: &str,
        input: &Value,
        query: &str,
    ) -> Result<EvaluationOutcome, EngineError>;
}

/// The configured evaluation engine.
pub enum EvaluationEngine {
    Embedded(WasmEngine),
    Remote(RemoteEngine),
}

impl EvaluationEngine {
    /// Builds the engine variant selected by `config.kind`.
    ///
    /// # Errors
    ///
    /// Returns an error if the sandbox cannot be created or the remote
    /// evaluator is not configured.
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        let engine = match config.kind {
            EngineKind::Embedded => Self::Embedded(WasmEngine::new(&config.embedded)?),
            EngineKind::Remote => {
                let remote = RemoteEngine::from_config(&config.remote)?;
                tracing::debug!(endpoint = %remote.endpoint(), "Remote evaluator configured");
                Self::Remote(remote)
            }
        };
        tracing::info!(kind = ?config.kind, "Evaluation engine ready");
        Ok(engine)
    }

    #[must_use]
    pub fn kind(&self) -> EngineKind {
        match self {
            Self::Embedded(_) => EngineKind::Embedded,
            Self::Remote(_) => EngineKind::Remote,
        }
    }
}

#[async_trait]
impl PolicyEvaluator for EvaluationEngine {
    async fn evaluate(
        &self,
        policy: &str,
        input: &Value,
        query: &str,
    ) -> Result<EvaluationOutcome, EngineError> {
        match self {
            Self::Embedded(engine) => Ok(engine.evaluate(policy, input, query)?),
            Self::Remote(engine) => Ok(engine.evaluate(policy, input, query).await?),
        }
    }
}
