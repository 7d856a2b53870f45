//! mcdb - Main entry point.
//!
//! Registers the databases listed in the configuration file, keeps their pools
//! alive until interrupted, then shuts every pool down.

use clap::Parser;
use mcdb::config::Config;
use mcdb::db::{DatabaseRegistry, MemoryBackend, MySqlBackend, PoolBackend};
use mcdb::driver::{Driver, ensure_verified};
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

async fn run<B: PoolBackend>(
    config: &Config,
    backend: Arc<B>,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = Arc::new(DatabaseRegistry::new(backend, config.pool_options()));
    let driver = Driver::new(registry, config.startup_policy);

    let Some(report) = driver.on_start(&config.config).await? else {
        // Template written; nothing to serve yet.
        return Ok(());
    };

    info!(
        registered = ?report.registered,
        pools = driver.registry().pool_count().await,
        "Startup complete"
    );

    if config.verify {
        if let Err(e) = ensure_verified(driver.verify().await) {
            driver.on_stop().await;
            return Err(e.into());
        }
    }

    driver
        .serve_until(tokio::signal::ctrl_c())
        .await
        .map_err(Into::into)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    if let Err(message) = config.pool_options().validate() {
        error!(error = %message, "Invalid pool options");
        return Err(message.into());
    }

    info!(
        config = %config.config.display(),
        policy = %config.startup_policy,
        dry_run = config.dry_run,
        "Starting mcdb v{}",
        env!("CARGO_PKG_VERSION")
    );

    let result = if config.dry_run {
        run(&config, Arc::new(MemoryBackend::new())).await
    } else {
        run(&config, Arc::new(MySqlBackend::new())).await
    };

    if let Err(e) = &result {
        error!(error = %e, "Startup failed");
    }
    result
}
