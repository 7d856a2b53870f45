//! In-process pool backend.
//!
//! Pools opened here never touch the network. Like an sqlx pool, acquire waits
//! up to the acquire timeout for a free slot and close waits for every leased
//! connection to come back. Counters let callers observe how the registry
//! shares pools. Used by `--dry-run` and throughout the test suite.

use crate::config::PoolOptions;
use crate::db::backend::PoolBackend;
use crate::error::{DbError, DbResult};
use crate::models::ConnectionDescriptor;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Debug)]
struct MemoryPoolInner {
    id: usize,
    descriptor: ConnectionDescriptor,
    acquire_timeout: Duration,
    permits: Arc<Semaphore>,
    /// Signalled whenever a leased connection is returned.
    returned: Notify,
    leased: AtomicUsize,
    acquired_total: AtomicUsize,
    closed: AtomicBool,
}

/// Handle to an in-memory pool.
#[derive(Debug, Clone)]
pub struct MemoryPool {
    inner: Arc<MemoryPoolInner>,
}

impl MemoryPool {
    /// Order in which the backend opened this pool, starting at 0.
    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.inner.descriptor
    }

    /// Connections currently leased out.
    pub fn leased(&self) -> usize {
        self.inner.leased.load(Ordering::Acquire)
    }

    /// Connections handed out over the pool's lifetime.
    pub fn acquired_total(&self) -> usize {
        self.inner.acquired_total.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// A leased in-memory connection. Returns its slot when dropped.
#[derive(Debug)]
pub struct MemoryConnection {
    pool: Arc<MemoryPoolInner>,
    permit: Option<OwnedSemaphorePermit>,
}

impl MemoryConnection {
    /// Id of the pool this connection was leased from.
    pub fn pool_id(&self) -> usize {
        self.pool.id
    }

    pub fn schema(&self) -> &str {
        &self.pool.descriptor.schema
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        // Free the slot before waking a closer that counts leases.
        drop(self.permit.take());
        self.pool.leased.fetch_sub(1, Ordering::AcqRel);
        self.pool.returned.notify_one();
    }
}

/// Backend whose pools live entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    pools: Mutex<Vec<MemoryPool>>,
    unreachable_hosts: Mutex<HashSet<String>>,
    open_delay: Option<Duration>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every `open`, simulating the first connection handshake.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    /// Make `open` fail for every descriptor on `host`.
    pub fn set_unreachable(&self, host: impl Into<String>) {
        self.unreachable_hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host.into());
    }

    /// Every pool opened so far, in opening order.
    pub fn pools(&self) -> Vec<MemoryPool> {
        self.pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of pools opened so far, closed ones included.
    pub fn opened_count(&self) -> usize {
        self.pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of pools opened and not yet closed.
    pub fn live_count(&self) -> usize {
        self.pools().iter().filter(|p| !p.is_closed()).count()
    }
}

#[async_trait]
impl PoolBackend for MemoryBackend {
    type Pool = MemoryPool;
    type Connection = MemoryConnection;

    async fn open(
        &self,
        descriptor: &ConnectionDescriptor,
        options: &PoolOptions,
    ) -> DbResult<MemoryPool> {
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }

        let unreachable = self
            .unreachable_hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&descriptor.host);
        if unreachable {
            return Err(DbError::connection(
                format!("Failed to connect to {}: connection refused", descriptor),
                "Check that the MySQL server is running and accessible",
            ));
        }

        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        let pool = MemoryPool {
            inner: Arc::new(MemoryPoolInner {
                id: pools.len(),
                descriptor: descriptor.clone(),
                acquire_timeout: options.acquire_timeout(),
                permits: Arc::new(Semaphore::new(
                    options.max_connections_or_default() as usize,
                )),
                returned: Notify::new(),
                leased: AtomicUsize::new(0),
                acquired_total: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        };
        pools.push(pool.clone());
        debug!(database = %descriptor, pool_id = pool.id(), "Opened in-memory pool");
        Ok(pool)
    }

    async fn acquire(&self, pool: &MemoryPool) -> DbResult<MemoryConnection> {
        let inner = &pool.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(DbError::pool_closed(&inner.descriptor.schema));
        }

        let permit = tokio::time::timeout(
            inner.acquire_timeout,
            Arc::clone(&inner.permits).acquire_owned(),
        )
        .await
        .map_err(|_| DbError::timeout("connection pool acquire", inner.acquire_timeout))?
        // The semaphore is only closed by `close`.
        .map_err(|_| DbError::pool_closed(&inner.descriptor.schema))?;

        inner.leased.fetch_add(1, Ordering::AcqRel);
        inner.acquired_total.fetch_add(1, Ordering::AcqRel);

        Ok(MemoryConnection {
            pool: Arc::clone(inner),
            permit: Some(permit),
        })
    }

    async fn close(&self, pool: &MemoryPool) {
        let inner = &pool.inner;
        inner.closed.store(true, Ordering::Release);
        inner.permits.close();

        // `notify_one` stores a wakeup, so a return between the load and
        // `notified()` is not lost.
        while inner.leased.load(Ordering::Acquire) > 0 {
            inner.returned.notified().await;
        }
        debug!(database = %inner.descriptor, pool_id = inner.id, "Closed in-memory pool");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(host: &str) -> ConnectionDescriptor {
        ConnectionDescriptor::parse(&format!("{host}:3306/db"), "u", "p", false).unwrap()
    }

    #[tokio::test]
    async fn test_open_assigns_sequential_ids() {
        let backend = MemoryBackend::new();
        let a = backend
            .open(&descriptor("a"), &PoolOptions::default())
            .await
            .unwrap();
        let b = backend
            .open(&descriptor("b"), &PoolOptions::default())
            .await
            .unwrap();
        assert_eq!(a.id(), 0);
        assert_eq!(b.id(), 1);
        assert_eq!(backend.opened_count(), 2);
    }

    #[tokio::test]
    async fn test_lease_is_returned_on_drop() {
        let backend = MemoryBackend::new();
        let pool = backend
            .open(&descriptor("a"), &PoolOptions::default())
            .await
            .unwrap();

        let conn = backend.acquire(&pool).await.unwrap();
        assert_eq!(pool.leased(), 1);
        drop(conn);
        assert_eq!(pool.leased(), 0);
        assert_eq!(pool.acquired_total(), 1);
    }

    fn single_slot() -> PoolOptions {
        PoolOptions {
            max_connections: Some(1),
            min_connections: Some(1),
            acquire_timeout_secs: Some(1),
            ..PoolOptions::default()
        }
    }

    #[tokio::test]
    async fn test_acquire_respects_max_connections() {
        let backend = MemoryBackend::new();
        let pool = backend.open(&descriptor("a"), &single_slot()).await.unwrap();

        let _held = backend.acquire(&pool).await.unwrap();
        let started = std::time::Instant::now();
        let result = backend.acquire(&pool).await;
        assert!(matches!(
            result,
            Err(DbError::Timeout {
                elapsed_ms: 1000,
                ..
            })
        ));
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_acquire_waits_for_returned_connection() {
        let backend = MemoryBackend::new();
        let pool = backend.open(&descriptor("a"), &single_slot()).await.unwrap();

        let held = backend.acquire(&pool).await.unwrap();
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(held);
        });

        let conn = backend.acquire(&pool).await.unwrap();
        releaser.await.unwrap();
        assert_eq!(pool.leased(), 1);
        assert_eq!(pool.acquired_total(), 2);
        drop(conn);
    }

    #[tokio::test]
    async fn test_close_waits_for_leases() {
        let backend = Arc::new(MemoryBackend::new());
        let pool = backend
            .open(&descriptor("a"), &PoolOptions::default())
            .await
            .unwrap();
        let held = backend.acquire(&pool).await.unwrap();

        let closing = {
            let backend = Arc::clone(&backend);
            let pool = pool.clone();
            tokio::spawn(async move { backend.close(&pool).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!closing.is_finished());
        assert!(pool.is_closed());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), closing)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pool.leased(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_pending_acquire() {
        let backend = Arc::new(MemoryBackend::new());
        let options = PoolOptions {
            acquire_timeout_secs: Some(5),
            ..single_slot()
        };
        let pool = backend.open(&descriptor("a"), &options).await.unwrap();
        let held = backend.acquire(&pool).await.unwrap();

        let waiter = {
            let backend = Arc::clone(&backend);
            let pool = pool.clone();
            tokio::spawn(async move { backend.acquire(&pool).await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let closing = {
            let backend = Arc::clone(&backend);
            let pool = pool.clone();
            tokio::spawn(async move { backend.close(&pool).await })
        };
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(DbError::PoolClosed { .. })));

        drop(held);
        closing.await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_after_close_fails() {
        let backend = MemoryBackend::new();
        let pool = backend
            .open(&descriptor("a"), &PoolOptions::default())
            .await
            .unwrap();
        backend.close(&pool).await;

        assert!(pool.is_closed());
        assert_eq!(backend.live_count(), 0);
        let result = backend.acquire(&pool).await;
        assert!(matches!(result, Err(DbError::PoolClosed { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let backend = MemoryBackend::new();
        backend.set_unreachable("down");
        let result = backend.open(&descriptor("down"), &PoolOptions::default()).await;
        assert!(matches!(result, Err(DbError::Connection { .. })));
        assert_eq!(backend.opened_count(), 0);
    }
}
