use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router, middleware,
    routing::{get, post},
};
use gatehouse_pdp::{InitError, Pdp};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::{config::AppConfig, config::SecurityConfig, handlers, middleware as app_middleware};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub pdp: Arc<Pdp>,
    pub security: Arc<SecurityConfig>,
}

pub struct GatehouseServer {
    addr: SocketAddr,
    app: Router,
}

/// Builds the decision point from `cfg.pdp` and wires the router around it.
///
/// # Errors
///
/// Returns an error when the decision point cannot be assembled.
pub fn build_app(cfg: &AppConfig) -> Result<Router, InitError> {
    let pdp = Arc::new(Pdp::from_config(&cfg.pdp)?);
    Ok(build_app_with_pdp(cfg, pdp))
}

pub fn build_app_with_pdp(cfg: &AppConfig, pdp: Arc<Pdp>) -> Router {
    let state = AppState {
        pdp,
        security: Arc::new(cfg.security.clone()),
    };
    build_router(state, cfg.server.body_limit_bytes)
}

pub fn build_router(state: AppState, body_limit: usize) -> Router {
    let decision_routes = Router::new()
        .route("/authorize", post(handlers::authorize))
        .route("/test-policy", post(handlers::test_policy))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::require_shared_secret,
        ));

    let admin_routes = Router::new()
        .route("/invalidate-cache", post(handlers::invalidate_cache))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::require_api_key,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .merge(decision_routes)
        .merge(admin_routes)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .extensions()
                        .get::<axum::http::HeaderValue>()
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        // Wraps the trace layer so the span sees the request id
        .layer(middleware::from_fn(app_middleware::request_id))
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
    pdp: Option<Arc<Pdp>>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
            pdp: None,
        }
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    /// Uses an already assembled decision point instead of building one from config.
    pub fn with_pdp(mut self, pdp: Arc<Pdp>) -> Self {
        self.pdp = Some(pdp);
        self
    }

    pub fn build(self) -> Result<GatehouseServer, InitError> {
        let app = match self.pdp {
            Some(pdp) => build_app_with_pdp(&self.config, pdp),
            None => build_app(&self.config)?,
        };

        Ok(GatehouseServer {
            addr: self.addr,
            app,
        })
    }
}

impl GatehouseServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
