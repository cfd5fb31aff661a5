use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::ApiError;
use crate::server::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const API_KEY_HEADER: &str = "x-api-key";
pub const SHARED_SECRET_HEADER: &str = "x-shared-secret";

/// Compares a configured credential with the presented header in constant time.
fn credentials_match(expected: &str, provided: Option<&str>) -> bool {
    provided.is_some_and(|provided| expected.as_bytes().ct_eq(provided.as_bytes()).into())
}

pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let header_name = HeaderName::from_static(REQUEST_ID_HEADER);

    // Preserve an incoming id, otherwise generate one
    let req_id_value = match req.headers().get(&header_name) {
        Some(value) => value.clone(),
        None => HeaderValue::from_str(&Uuid::new_v4().to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("unknown")),
    };

    req.extensions_mut().insert(req_id_value.clone());

    let mut res = next.run(req).await;
    res.headers_mut().insert(header_name, req_id_value);
    res
}

/// Guards cache administration. Without a configured key every request is refused.
pub async fn require_api_key(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let provided = req.headers().get(API_KEY_HEADER).and_then(|v| v.to_str().ok());

    match (state.security.api_key.as_deref(), provided) {
        (Some(expected), provided) if credentials_match(expected, provided) => next.run(req).await,
        (None, _) => {
            tracing::warn!(path = %req.uri().path(), "Cache administration called but no API key is configured");
            ApiError::Unauthorized("Invalid or missing API Key".into()).into_response()
        }
        _ => {
            tracing::warn!(path = %req.uri().path(), "Invalid or missing API key");
            ApiError::Unauthorized("Invalid or missing API Key".into()).into_response()
        }
    }
}

/// Guards decision routes when a shared secret is configured.
pub async fn require_shared_secret(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.security.shared_secret.as_deref() else {
        return next.run(req).await;
    };

    let provided = req
        .headers()
        .get(SHARED_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());

    if credentials_match(expected, provided) {
        next.run(req).await
    } else {
        tracing::warn!(path = %req.uri().path(), "Unauthorized access attempt to shared secret protected endpoint");
        ApiError::Unauthorized("Unauthorized: Invalid shared secret.".into()).into_response()
    }
}
