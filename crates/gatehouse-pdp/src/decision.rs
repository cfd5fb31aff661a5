//! Decision engine: validation, policy selection and evaluation.
//!
//! ```text
//! check_permission(request)
//!   → validate
//!   → PolicyStore::get_policies()      (cached, breaker-guarded)
//!   → select(policies, resource name)  (name, policy.<name>, default, main, policy.main)
//!   → PolicyEvaluator::evaluate(definition, input, query)
//!   → AuthorizationDecision
//! ```

use std::sync::Arc;

use serde_json::Value;

use crate::PdpResult;
use crate::engine::{EvaluationOutcome, PolicyEvaluator};
use crate::error::PdpError;
use crate::policy::PolicyStore;
use crate::types::{AuthorizationDecision, PermissionCheck, Policy};

/// Names tried, in order, when no policy matches the resource.
const FALLBACK_POLICY_NAMES: [&str; 3] = ["default", "main", "policy.main"];

pub const NO_APPLICABLE_POLICY: &str = "No applicable policy found";
const ALLOWED_BY_POLICY: &str = "Allowed by policy";
const DENIED_BY_POLICY: &str = "Denied by policy";

/// Stateless decision pipeline shared across requests.
pub struct DecisionEngine {
    store: Arc<PolicyStore>,
    evaluator: Arc<dyn PolicyEvaluator>,
    default_query: String,
}

impl DecisionEngine {
    #[must_use]
    pub fn new(
        store: Arc<PolicyStore>,
        evaluator: Arc<dyn PolicyEvaluator>,
        default_query: impl Into<String>,
    ) -> Self {
        Self {
            store,
            evaluator,
            default_query: default_query.into(),
        }
    }

    /// Decides a permission check.
    ///
    /// # Errors
    ///
    /// - `PdpError::Validation` if the request is incomplete
    /// - `PdpError::PolicyLoad` if the policy set is unavailable or empty
    /// - `PdpError::PolicyEvaluation` if the engine fails
    pub async fn check_permission(&self, check: &PermissionCheck) -> PdpResult<AuthorizationDecision> {
        let resource = check.validate()?;
        let resource_name = resource.name();

        let policies = self.store.get_policies().await?;
        if policies.is_empty() {
            return Err(PdpError::policy_load("No policies found."));
        }

        let Some(policy) = select_policy(&policies, resource_name) else {
            tracing::info!(
                subject = %check.subject.id,
                action = %check.action,
                resource = %resource_name,
                "No applicable policy, denying"
            );
            return Ok(AuthorizationDecision::deny(NO_APPLICABLE_POLICY));
        };

        tracing::debug!(
            policy = %policy.policy_name,
            policy_id = %policy.id,
            version = policy.version,
            resource = %resource_name,
            "Selected policy"
        );

        let input = check.to_input();
        let outcome = self
            .evaluator
            .evaluate(&policy.policy_definition, &input, &self.default_query)
            .await
            .map_err(|e| {
                tracing::error!(policy = %policy.policy_name, error = %e, "Policy evaluation failed");
                PdpError::policy_evaluation(format!("Failed to evaluate permission: {e}"))
            })?;

        let reason = outcome.reason.unwrap_or_else(|| {
            if outcome.allow {
                ALLOWED_BY_POLICY.to_string()
            } else {
                DENIED_BY_POLICY.to_string()
            }
        });

        tracing::info!(
            subject = %check.subject.id,
            tenant = check.tenant_id.as_deref().unwrap_or("-"),
            action = %check.action,
            resource = %resource_name,
            policy = %policy.policy_name,
            allowed = outcome.allow,
            "Authorization decision"
        );

        Ok(AuthorizationDecision {
            allowed: outcome.allow,
            reason: Some(reason),
            obligations: outcome.obligations,
        })
    }

    /// Evaluates an ad-hoc policy without touching the cache.
    ///
    /// # Errors
    ///
    /// Returns `PdpError::Validation` for an empty policy and
    /// `PdpError::PolicyEvaluation` if the engine fails.
    pub async fn test_policy(
        &self,
        policy: &str,
        input: &Value,
        query: Option<&str>,
    ) -> PdpResult<EvaluationOutcome> {
        if policy.trim().is_empty() {
            return Err(PdpError::validation(
                "Policy string cannot be empty for testing.",
            ));
        }

        let query = query
            .filter(|q| !q.trim().is_empty())
            .unwrap_or(&self.default_query);

        self.evaluator
            .evaluate(policy, input, query)
            .await
            .map_err(|e| {
                tracing::warn!(query, error = %e, "Policy test failed");
                PdpError::policy_evaluation(format!("Failed to test policy: {e}"))
            })
    }

    /// Drops the cached policy set.
    pub fn invalidate_cache(&self) {
        self.store.invalidate();
    }

    #[must_use]
    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    #[must_use]
    pub fn default_query(&self) -> &str {
        &self.default_query
    }
}

/// Picks the policy governing `resource_name`.
///
/// Candidates are policies named `resource_name` or `policy.<resource_name>`,
/// then the fallback names one at a time. Among candidates the highest
/// `version` wins; equal versions keep source order.
#[must_use]
pub fn select_policy<'a>(policies: &'a [Policy], resource_name: &str) -> Option<&'a Policy> {
    let prefixed = format!("policy.{resource_name}");
    best_named(policies, &[resource_name, prefixed.as_str()]).or_else(|| {
        FALLBACK_POLICY_NAMES
            .iter()
            .find_map(|name| best_named(policies, &[name]))
    })
}

fn best_named<'a>(policies: &'a [Policy], names: &[&str]) -> Option<&'a Policy> {
    policies
        .iter()
        .filter(|policy| names.contains(&policy.policy_name.as_str()))
        .fold(None, |best: Option<&Policy>, candidate| match best {
            Some(current) if current.version >= candidate.version => Some(current),
            _ => Some(candidate),
        })
}
