//! Connection pool providers.
//!
//! The registry never implements pooling itself. A [`PoolBackend`] opens a pool
//! for a [`ConnectionDescriptor`], leases connections from it and closes it.
//! [`MySqlBackend`] is the production provider built on `sqlx`.

use crate::config::PoolOptions;
use crate::error::{DbError, DbResult};
use crate::models::ConnectionDescriptor;
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::{MySql, MySqlPool};
use std::str::FromStr;
use tracing::debug;

/// Session timezone applied to every MySQL connection.
const SESSION_TIMEZONE: &str = "+00:00";

/// A provider of connection pools.
///
/// Pools must be cheap to clone and internally thread-safe: the registry
/// clones the handle out of its lock before awaiting `acquire`.
#[async_trait]
pub trait PoolBackend: Send + Sync + 'static {
    type Pool: Clone + Send + Sync + 'static;
    type Connection: Send + 'static;

    /// Open a pool for `descriptor`, establishing at least one connection.
    async fn open(
        &self,
        descriptor: &ConnectionDescriptor,
        options: &PoolOptions,
    ) -> DbResult<Self::Pool>;

    /// Lease one connection, waiting up to the pool's acquire timeout.
    async fn acquire(&self, pool: &Self::Pool) -> DbResult<Self::Connection>;

    /// Close the pool, waiting for leased connections to be returned.
    async fn close(&self, pool: &Self::Pool);
}

/// MySQL pools via `sqlx`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlBackend;

impl MySqlBackend {
    pub fn new() -> Self {
        Self
    }

    /// Build driver connect options for a descriptor.
    pub fn connect_options(
        descriptor: &ConnectionDescriptor,
        options: &PoolOptions,
    ) -> DbResult<MySqlConnectOptions> {
        let url = descriptor.connection_url()?;
        let connect = MySqlConnectOptions::from_str(url.as_str())
            .map_err(|e| {
                DbError::configuration(format!(
                    "Invalid MySQL connection string {}: {}",
                    descriptor.masked_url(),
                    e
                ))
            })?
            .charset("utf8mb4")
            .timezone(Some(SESSION_TIMEZONE.to_string()))
            .statement_cache_capacity(options.statement_cache_capacity_or_default());
        Ok(connect)
    }

    /// Generate a helpful suggestion for connection errors.
    fn connection_suggestion(error: &sqlx::Error) -> String {
        let error_str = error.to_string().to_lowercase();

        if error_str.contains("connection refused") {
            return "Check that the MySQL server is running and accessible".to_string();
        }

        if error_str.contains("access denied") || error_str.contains("password") {
            return "Verify the username and password for this database".to_string();
        }

        if error_str.contains("unknown database") {
            return "Check that the database name in the location exists".to_string();
        }

        if error_str.contains("tls") || error_str.contains("ssl") {
            return "Check TLS/SSL configuration or set isSecure to false".to_string();
        }

        "Verify the location format: host:port/database".to_string()
    }
}

#[async_trait]
impl PoolBackend for MySqlBackend {
    type Pool = MySqlPool;
    type Connection = PoolConnection<MySql>;

    async fn open(
        &self,
        descriptor: &ConnectionDescriptor,
        options: &PoolOptions,
    ) -> DbResult<MySqlPool> {
        let connect = Self::connect_options(descriptor, options)?;

        debug!(database = %descriptor, "Opening MySQL pool");
        MySqlPoolOptions::new()
            .min_connections(options.min_connections_or_default())
            .max_connections(options.max_connections_or_default())
            .acquire_timeout(options.acquire_timeout())
            .idle_timeout(Some(options.idle_timeout()))
            .max_lifetime(Some(options.max_lifetime()))
            .test_before_acquire(options.test_before_acquire_or_default())
            .connect_with(connect)
            .await
            .map_err(|e| {
                DbError::connection(
                    format!("Failed to connect to {}: {}", descriptor, e),
                    Self::connection_suggestion(&e),
                )
            })
    }

    async fn acquire(&self, pool: &MySqlPool) -> DbResult<PoolConnection<MySql>> {
        pool.acquire().await.map_err(|e| match e {
            sqlx::Error::PoolTimedOut => DbError::timeout(
                "connection pool acquire",
                pool.options().get_acquire_timeout(),
            ),
            other => DbError::from(other),
        })
    }

    async fn close(&self, pool: &MySqlPool) {
        pool.close().await;
    }
}
