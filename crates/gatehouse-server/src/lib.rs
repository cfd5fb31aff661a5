pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod observability;
pub mod server;

pub use config::AppConfig;
pub use error::ApiError;
pub use server::{AppState, GatehouseServer, ServerBuilder, build_app, build_app_with_pdp, build_router};
