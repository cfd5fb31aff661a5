use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use gatehouse_pdp::{AuthorizationDecision, CircuitState, EvaluationOutcome, PermissionCheck};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::server::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn root() -> impl IntoResponse {
    let body = json!({
        "service": "Gatehouse",
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(body))
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// Not ready while the policy source breaker is open.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.pdp.stats();
    let breaker = stats.store.breaker_state;

    let (status, label) = match breaker {
        CircuitState::Open => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        _ => (StatusCode::OK, "ready"),
    };

    let mut body = json!({
        "status": label,
        "engine": stats.engine,
        "policySource": breaker,
        "policySourceStateSeconds": stats.store.breaker_state_age.as_secs(),
        "policies": {
            "count": stats.store.policy_count,
            "version": stats.store.version,
            "cached": stats.store.cached,
        },
    });
    if let Some(wasm) = stats.wasm {
        body["wasm"] = json!({
            "moduleLoads": wasm.module_loads,
            "evaluations": wasm.evaluations,
            "loadedDigest": wasm.loaded_digest,
        });
    }

    (status, Json(body))
}

pub async fn authorize(
    State(state): State<AppState>,
    payload: Result<Json<PermissionCheck>, JsonRejection>,
) -> Result<Json<AuthorizationDecision>, ApiError> {
    let Json(check) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let decision = state.pdp.check_permission(&check).await?;
    Ok(Json(decision))
}

#[derive(Debug, Deserialize)]
pub struct TestPolicyRequest {
    #[serde(default)]
    pub policy: String,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub query: Option<String>,
}

pub async fn test_policy(
    State(state): State<AppState>,
    payload: Result<Json<TestPolicyRequest>, JsonRejection>,
) -> Result<Json<EvaluationOutcome>, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let input = req.input.unwrap_or_else(|| json!({}));
    let outcome = state
        .pdp
        .test_policy(&req.policy, &input, req.query.as_deref())
        .await?;
    Ok(Json(outcome))
}

pub async fn invalidate_cache(State(state): State<AppState>) -> impl IntoResponse {
    state.pdp.invalidate_cache();
    tracing::info!("Policy cache invalidated via API");
    (
        StatusCode::OK,
        Json(json!({ "message": "Policy cache invalidated successfully." })),
    )
}
