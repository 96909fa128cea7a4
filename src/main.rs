//! db-request-scope - Main entry point.
//!
//! Serves a small notes API where every request borrows one database
//! connection and the response status decides whether its writes are kept.

use clap::Parser;
use db_request_scope::config::Config;
use db_request_scope::transport::{HttpTransport, Transport};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(&config);

    info!(
        commit_mode = %config.commit_mode,
        pooling = !config.no_pooling,
        "Starting db-request-scope v{}",
        env!("CARGO_PKG_VERSION")
    );

    let db_config = Arc::new(config.database_config()?);
    let transport = HttpTransport::new(db_config, &config.http_host, config.http_port);

    info!(transport = transport.name(), "Using HTTP transport");
    if let Err(e) = transport.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
