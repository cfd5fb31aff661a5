use std::{env, sync::Arc};

use anyhow::Context;
use gatehouse_pdp::Pdp;
use gatehouse_server::ServerBuilder;
use gatehouse_server::config::loader::load_config;

/// How the configuration path was determined.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    /// From --config CLI argument
    CliArgument,
    /// From GATEHOUSE_CONFIG environment variable
    EnvironmentVariable,
    /// Default path (gatehouse.toml)
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliArgument => write!(f, "CLI argument (--config)"),
            Self::EnvironmentVariable => write!(f, "environment variable (GATEHOUSE_CONFIG)"),
            Self::Default => write!(f, "default"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    let (config_path, source) = resolve_config_path();

    let cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    gatehouse_server::observability::init_tracing(&cfg.logging.level);
    tracing::info!(path = %config_path, source = %source, "Configuration loaded");

    let pdp = match Pdp::from_config(&cfg.pdp) {
        Ok(pdp) => Arc::new(pdp),
        Err(e) => {
            eprintln!("Decision point initialization failed: {e}");
            std::process::exit(2);
        }
    };

    // Warm the cache; a failure here is not fatal, requests retry through the breaker
    match pdp.refresh_policies().await {
        Ok(count) => tracing::info!(count, "Initial policy set loaded"),
        Err(e) => tracing::warn!(error = %e, "Initial policy load failed"),
    }

    let server = ServerBuilder::new()
        .with_config(cfg)
        .with_pdp(pdp)
        .build()
        .context("failed to build server")?;

    server.run().await
}

fn resolve_config_path() -> (String, ConfigSource) {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return (path, ConfigSource::CliArgument);
            }
        }
    }

    if let Ok(path) = env::var("GATEHOUSE_CONFIG") {
        if !path.is_empty() {
            return (path, ConfigSource::EnvironmentVariable);
        }
    }

    ("gatehouse.toml".to_string(), ConfigSource::Default)
}
