//! A connection pool bound to one physical database.
//!
//! # Lifecycle
//!
//! `Uninitialized → Live → Closed`. The pool handle only exists while `Live`;
//! `Closed` is terminal and every later acquire fails with
//! [`DbError::PoolClosed`] instead of touching a dead pool.
//!
//! The lifecycle sits behind a `std::sync::Mutex` that is never held across
//! an await point: the pool handle is cloned out before acquiring or closing.

use crate::config::PoolOptions;
use crate::db::backend::PoolBackend;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionDescriptor, PoolState};
use chrono::{DateTime, Utc};
use std::hash::{Hash, Hasher};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

enum Lifecycle<P> {
    Uninitialized,
    Live(P),
    Closed,
}

impl<P> Lifecycle<P> {
    fn state(&self) -> PoolState {
        match self {
            Lifecycle::Uninitialized => PoolState::Uninitialized,
            Lifecycle::Live(_) => PoolState::Live,
            Lifecycle::Closed => PoolState::Closed,
        }
    }
}

/// One physical database and its pool.
///
/// Equality and hashing use the descriptor only, so two instances built from
/// the same configuration compare equal.
pub struct PooledDatabase<B: PoolBackend> {
    descriptor: ConnectionDescriptor,
    backend: Arc<B>,
    options: PoolOptions,
    lifecycle: Mutex<Lifecycle<B::Pool>>,
    created_at: DateTime<Utc>,
}

impl<B: PoolBackend> PooledDatabase<B> {
    /// Create an uninitialized database. Opens nothing.
    pub fn new(descriptor: ConnectionDescriptor, backend: Arc<B>, options: PoolOptions) -> Self {
        Self {
            descriptor,
            backend,
            options,
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
            created_at: Utc::now(),
        }
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// Name of the schema this pool connects to.
    pub fn schema(&self) -> &str {
        &self.descriptor.schema
    }

    pub fn state(&self) -> PoolState {
        self.lifecycle().state()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle<B::Pool>> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the pool.
    ///
    /// Only valid once, on an uninitialized database.
    pub async fn initialize(&self) -> DbResult<()> {
        match self.state() {
            PoolState::Uninitialized => {}
            state => {
                return Err(DbError::internal(format!(
                    "Cannot initialize pool for '{}' in state {}",
                    self.schema(),
                    state
                )));
            }
        }

        let pool = self.backend.open(&self.descriptor, &self.options).await?;

        let rejected = {
            let mut lifecycle = self.lifecycle();
            if matches!(*lifecycle, Lifecycle::Uninitialized) {
                *lifecycle = Lifecycle::Live(pool);
                None
            } else {
                Some(pool)
            }
        };

        // Torn down or initialized by someone else while opening.
        if let Some(pool) = rejected {
            self.backend.close(&pool).await;
            return Err(DbError::internal(format!(
                "Pool for '{}' changed state during initialization",
                self.schema()
            )));
        }

        info!(database = %self.descriptor, "Connection pool initialized");
        Ok(())
    }

    fn live_pool(&self) -> DbResult<B::Pool> {
        match &*self.lifecycle() {
            Lifecycle::Live(pool) => Ok(pool.clone()),
            Lifecycle::Uninitialized => Err(DbError::pool_not_initialized(self.schema())),
            Lifecycle::Closed => Err(DbError::pool_closed(self.schema())),
        }
    }

    /// Lease a connection, waiting up to the pool's acquire timeout.
    pub async fn acquire(&self) -> DbResult<Lease<B::Connection>> {
        let pool = self.live_pool()?;
        let connection = self.backend.acquire(&pool).await?;
        debug!(schema = %self.schema(), "Connection leased");
        Ok(Lease::new(
            connection,
            self.schema().to_string(),
            self.options.leak_detection_threshold(),
        ))
    }

    /// Lease a connection, giving up after `deadline`.
    pub async fn acquire_within(&self, deadline: Duration) -> DbResult<Lease<B::Connection>> {
        tokio::time::timeout(deadline, self.acquire())
            .await
            .map_err(|_| DbError::timeout("connection acquire", deadline))?
    }

    /// Move to `Closed` without awaiting, handing back the pool if it was live.
    ///
    /// Acquires fail with [`DbError::PoolClosed`] from here on. The caller
    /// finishes the job with [`PooledDatabase::drain`].
    pub(crate) fn retire(&self) -> Option<B::Pool> {
        let previous = std::mem::replace(&mut *self.lifecycle(), Lifecycle::Closed);
        match previous {
            Lifecycle::Live(pool) => Some(pool),
            _ => None,
        }
    }

    /// Close a retired pool, waiting at most `deadline` for leases to return.
    pub(crate) async fn drain(&self, pool: B::Pool, deadline: Duration) {
        match tokio::time::timeout(deadline, self.backend.close(&pool)).await {
            Ok(()) => info!(database = %self.descriptor, "Connection pool closed"),
            Err(_) => warn!(
                database = %self.descriptor,
                deadline_ms = deadline.as_millis() as u64,
                "Connection pool did not drain before the deadline"
            ),
        }
    }

    /// Close the pool. Safe to call repeatedly; a no-op unless live.
    ///
    /// Waits for every leased connection to be returned.
    pub async fn teardown(&self) {
        if let Some(pool) = self.retire() {
            self.backend.close(&pool).await;
            info!(database = %self.descriptor, "Connection pool closed");
        }
    }

    /// Close the pool, waiting at most `deadline` for leases to drain.
    ///
    /// The database is closed to new acquires either way.
    pub async fn teardown_within(&self, deadline: Duration) {
        if let Some(pool) = self.retire() {
            self.drain(pool, deadline).await;
        }
    }
}

impl<B: PoolBackend> PartialEq for PooledDatabase<B> {
    fn eq(&self, other: &Self) -> bool {
        self.descriptor == other.descriptor
    }
}

impl<B: PoolBackend> Eq for PooledDatabase<B> {}

impl<B: PoolBackend> Hash for PooledDatabase<B> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.descriptor.hash(state);
    }
}

impl<B: PoolBackend> std::fmt::Debug for PooledDatabase<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledDatabase")
            .field("descriptor", &self.descriptor)
            .field("state", &self.state())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// A leased connection.
///
/// Dereferences to the backend's connection type; for MySQL that is
/// `sqlx::pool::PoolConnection<MySql>`, so `&mut **lease` is an executor.
/// The connection returns to its pool when the lease is dropped. Leases held
/// past the leak detection threshold are reported on drop.
pub struct Lease<C> {
    connection: C,
    schema: String,
    acquired_at: Instant,
    leak_threshold: Duration,
}

impl<C> Lease<C> {
    fn new(connection: C, schema: String, leak_threshold: Duration) -> Self {
        Self {
            connection,
            schema,
            acquired_at: Instant::now(),
            leak_threshold,
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Time since the connection was leased.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl<C> Deref for Lease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.connection
    }
}

impl<C> DerefMut for Lease<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.connection
    }
}

impl<C> Drop for Lease<C> {
    fn drop(&mut self) {
        let held = self.held_for();
        if !self.leak_threshold.is_zero() && held > self.leak_threshold {
            warn!(
                schema = %self.schema,
                held_ms = held.as_millis() as u64,
                threshold_ms = self.leak_threshold.as_millis() as u64,
                "Connection held longer than the leak detection threshold"
            );
        }
    }
}

impl<C> std::fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("schema", &self.schema)
            .field("held_for", &self.held_for())
            .finish_non_exhaustive()
    }
}
