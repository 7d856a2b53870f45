//! Label registry with pool deduplication.
//!
//! Labels map to pooled databases; labels whose descriptors are equal share
//! one pool. Each pool keeps the set of labels pointing at it and is torn down
//! when the last one is removed.
//!
//! # Concurrency
//!
//! Both maps and the closed flag live in one [`RegistryState`] behind a single
//! `tokio::sync::RwLock`, so they are always observed and mutated together.
//!
//! - `add`, `remove` and `shutdown` take the write lock. `add` keeps it while
//!   a new pool initializes, so concurrent adds of one descriptor open exactly
//!   one pool.
//! - `remove` and `shutdown` update both maps and retire the affected pools
//!   under the lock, then release it before waiting for leased connections to
//!   drain. A held connection never blocks other labels, and dropping either
//!   future midway leaves the maps consistent.
//! - Draining is bounded by [`PoolOptions::close_timeout`].
//! - Lookups take the read lock and clone the `Arc<PooledDatabase>` out; the
//!   lock is released before awaiting a connection.
//! - An acquire racing a removal or shutdown fails with `PoolClosed` rather
//!   than hanging.

use crate::config::PoolOptions;
use crate::db::backend::{MySqlBackend, PoolBackend};
use crate::db::pooled::{Lease, PooledDatabase};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionDescriptor, DatabaseSummary};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

struct AliasEntry<B: PoolBackend> {
    database: Arc<PooledDatabase<B>>,
    /// Never empty while the entry exists.
    labels: HashSet<String>,
}

struct RegistryState<B: PoolBackend> {
    labels: HashMap<String, Arc<PooledDatabase<B>>>,
    aliases: HashMap<ConnectionDescriptor, AliasEntry<B>>,
    closed: bool,
}

impl<B: PoolBackend> Default for RegistryState<B> {
    fn default() -> Self {
        Self {
            labels: HashMap::new(),
            aliases: HashMap::new(),
            closed: false,
        }
    }
}

/// Maps labels to pooled databases.
pub struct DatabaseRegistry<B: PoolBackend = MySqlBackend> {
    backend: Arc<B>,
    options: PoolOptions,
    state: RwLock<RegistryState<B>>,
}

impl DatabaseRegistry<MySqlBackend> {
    /// Create a registry that opens MySQL pools.
    pub fn mysql(options: PoolOptions) -> Self {
        Self::new(Arc::new(MySqlBackend::new()), options)
    }
}

impl<B: PoolBackend> DatabaseRegistry<B> {
    /// Create an empty registry over `backend`.
    pub fn new(backend: Arc<B>, options: PoolOptions) -> Self {
        Self {
            backend,
            options,
            state: RwLock::new(RegistryState::default()),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn pool_options(&self) -> &PoolOptions {
        &self.options
    }

    /// Register `label` for the database at `location` (`host:port/database`).
    ///
    /// Returns `Ok(false)` without changing anything if the label is taken.
    /// Fails with [`DbError::Configuration`] for a malformed location and
    /// [`DbError::Connection`] if a new pool cannot be opened; in both cases
    /// the registry is left untouched.
    pub async fn add_database(
        &self,
        label: &str,
        location: &str,
        username: &str,
        password: &str,
        secure: bool,
    ) -> DbResult<bool> {
        let descriptor = ConnectionDescriptor::parse(location, username, password, secure)?;
        self.add_descriptor(label, descriptor).await
    }

    /// Register `label` for an already parsed descriptor.
    pub async fn add_descriptor(
        &self,
        label: &str,
        descriptor: ConnectionDescriptor,
    ) -> DbResult<bool> {
        if label.is_empty() {
            return Err(DbError::configuration("Database label cannot be empty"));
        }

        let mut guard = self.state.write().await;
        let state = &mut *guard;

        if state.closed {
            return Err(DbError::RegistryClosed);
        }

        if state.labels.contains_key(label) {
            warn!(label = %label, "Database label already registered");
            return Ok(false);
        }

        if let Some(entry) = state.aliases.get_mut(&descriptor) {
            info!(
                label = %label,
                database = %descriptor,
                "Database was already known, applying additional label"
            );
            entry.labels.insert(label.to_string());
            state
                .labels
                .insert(label.to_string(), Arc::clone(&entry.database));
            return Ok(true);
        }

        info!(
            label = %label,
            database = %descriptor,
            "Database was not previously known, instantiating pool"
        );
        let database = Arc::new(PooledDatabase::new(
            descriptor.clone(),
            Arc::clone(&self.backend),
            self.options.clone(),
        ));
        database.initialize().await?;

        state.aliases.insert(
            descriptor,
            AliasEntry {
                database: Arc::clone(&database),
                labels: HashSet::from([label.to_string()]),
            },
        );
        state.labels.insert(label.to_string(), database);
        Ok(true)
    }

    /// Unregister `label`.
    ///
    /// Returns `false` if the label is not registered. Removing the last label
    /// of a pool tears the pool down; the label is gone from the registry
    /// before any leased connections are waited on.
    pub async fn remove_database(&self, label: &str) -> bool {
        let retired = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;

            let Some(database) = state.labels.remove(label) else {
                debug!(label = %label, "Database label not registered, nothing to remove");
                return false;
            };
            let descriptor = database.descriptor();

            let last_label = match state.aliases.get_mut(descriptor) {
                Some(entry) if entry.labels.len() > 1 => {
                    info!(
                        label = %label,
                        "Database has additional labels, only this label will be disassociated"
                    );
                    entry.labels.remove(label);
                    false
                }
                _ => true,
            };

            if last_label {
                info!(label = %label, database = %descriptor, "Database is set to be terminated");
                state.aliases.remove(descriptor);
                database.retire().map(|pool| (database, pool))
            } else {
                None
            }
        }; // Write lock released here

        if let Some((database, pool)) = retired {
            database.drain(pool, self.options.close_timeout()).await;
        }
        true
    }

    /// Schema name behind `label`, for templating scripts against it.
    pub async fn database_name(&self, label: &str) -> Option<String> {
        let state = self.state.read().await;
        if state.closed {
            return None;
        }
        state
            .labels
            .get(label)
            .map(|database| database.schema().to_string())
    }

    fn resolve(state: &RegistryState<B>, label: &str) -> DbResult<Arc<PooledDatabase<B>>> {
        if state.closed {
            return Err(DbError::RegistryClosed);
        }
        state
            .labels
            .get(label)
            .cloned()
            .ok_or_else(|| DbError::label_not_found(label))
    }

    /// Lease a connection from the pool behind `label`.
    ///
    /// The caller releases the connection by dropping the lease.
    pub async fn connect(&self, label: &str) -> DbResult<Lease<B::Connection>> {
        let database = {
            let state = self.state.read().await;
            Self::resolve(&state, label)?
        }; // Read lock released here

        database.acquire().await
    }

    /// Lease a connection from the pool behind `label`, giving up after `deadline`.
    pub async fn connect_within(
        &self,
        label: &str,
        deadline: Duration,
    ) -> DbResult<Lease<B::Connection>> {
        let database = {
            let state = self.state.read().await;
            Self::resolve(&state, label)?
        };

        database.acquire_within(deadline).await
    }

    /// Tear down every pool and clear the registry.
    ///
    /// Each pool is closed once regardless of how many labels it has. Later
    /// calls are no-ops; every other operation fails or reports not-found.
    pub async fn shutdown(&self) {
        let retired: Vec<_> = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;

            if state.closed {
                debug!("Database registry already shut down");
                return;
            }
            state.closed = true;
            state.labels.clear();

            state
                .aliases
                .drain()
                .filter_map(|(descriptor, entry)| {
                    let mut labels: Vec<_> = entry.labels.into_iter().collect();
                    labels.sort();
                    info!(database = %descriptor, labels = ?labels, "Disabling database");
                    let database = entry.database;
                    database.retire().map(|pool| (database, pool))
                })
                .collect()
        };

        let deadline = self.options.close_timeout();
        let mut drains = JoinSet::new();
        for (database, pool) in retired {
            drains.spawn(async move { database.drain(pool, deadline).await });
        }
        while let Some(result) = drains.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Pool drain task failed");
            }
        }
        info!("All databases closed");
    }

    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }

    pub async fn contains(&self, label: &str) -> bool {
        self.state.read().await.labels.contains_key(label)
    }

    /// All registered labels, sorted.
    pub async fn labels(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut labels: Vec<String> = state.labels.keys().cloned().collect();
        labels.sort();
        labels
    }

    /// Number of registered labels.
    pub async fn label_count(&self) -> usize {
        self.state.read().await.labels.len()
    }

    /// Number of distinct live pools.
    pub async fn pool_count(&self) -> usize {
        self.state.read().await.aliases.len()
    }

    /// Describe every physical database, sorted by schema then host.
    pub async fn databases(&self) -> Vec<DatabaseSummary> {
        let state = self.state.read().await;
        let mut summaries: Vec<DatabaseSummary> = state
            .aliases
            .iter()
            .map(|(descriptor, entry)| {
                let mut labels: Vec<String> = entry.labels.iter().cloned().collect();
                labels.sort();
                DatabaseSummary {
                    schema: descriptor.schema.clone(),
                    host: descriptor.host.clone(),
                    port: descriptor.port,
                    username: descriptor.username.clone(),
                    secure: descriptor.secure,
                    labels,
                    state: entry.database.state(),
                    created_at: entry.database.created_at(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| (&a.schema, &a.host, a.port).cmp(&(&b.schema, &b.host, b.port)));
        summaries
    }
}

impl<B: PoolBackend> std::fmt::Debug for DatabaseRegistry<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseRegistry")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryBackend;
    use crate::models::PoolState;

    fn registry() -> (Arc<MemoryBackend>, DatabaseRegistry<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let registry = DatabaseRegistry::new(Arc::clone(&backend), PoolOptions::default());
        (backend, registry)
    }

    #[tokio::test]
    async fn test_registry_creation() {
        let (_, registry) = registry();
        assert_eq!(registry.label_count().await, 0);
        assert_eq!(registry.pool_count().await, 0);
        assert!(!registry.is_closed().await);
    }

    #[tokio::test]
    async fn test_label_not_found() {
        let (_, registry) = registry();
        let result = registry.connect("nonexistent").await;
        assert!(matches!(result, Err(DbError::LabelNotFound { .. })));
        assert_eq!(registry.database_name("nonexistent").await, None);
    }

    #[tokio::test]
    async fn test_remove_absent_label_returns_false() {
        let (_, registry) = registry();
        assert!(!registry.remove_database("ghost").await);

        registry
            .add_database("lobby", "h:3306/lobby_db", "u", "p", false)
            .await
            .unwrap();
        assert!(!registry.remove_database("ghost").await);
        assert_eq!(registry.labels().await, vec!["lobby".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_label_rejected() {
        let (backend, registry) = registry();
        let result = registry.add_database("", "h:3306/db", "u", "p", false).await;
        assert!(matches!(result, Err(DbError::Configuration { .. })));
        assert_eq!(backend.opened_count(), 0);
    }

    #[tokio::test]
    async fn test_alias_reuses_pool() {
        let (backend, registry) = registry();
        assert!(
            registry
                .add_database("a", "h:3306/db", "u", "p", false)
                .await
                .unwrap()
        );
        assert!(
            registry
                .add_database("b", "h/db", "u", "p", false)
                .await
                .unwrap()
        );

        assert_eq!(backend.opened_count(), 1);
        assert_eq!(registry.pool_count().await, 1);
        assert_eq!(registry.label_count().await, 2);

        let summaries = registry.databases().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].labels, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(summaries[0].state, PoolState::Live);
    }

    #[tokio::test]
    async fn test_initialize_failure_leaves_no_state() {
        let (backend, registry) = registry();
        backend.set_unreachable("down");

        let result = registry
            .add_database("broken", "down:3306/db", "u", "p", false)
            .await;
        assert!(matches!(result, Err(DbError::Connection { .. })));
        assert!(!registry.contains("broken").await);
        assert_eq!(registry.pool_count().await, 0);

        // The label is still free afterwards.
        assert!(
            registry
                .add_database("broken", "up:3306/db", "u", "p", false)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_remove_tears_down_last_alias_only() {
        let (backend, registry) = registry();
        registry
            .add_database("a", "h:3306/db", "u", "p", false)
            .await
            .unwrap();
        registry
            .add_database("b", "h:3306/db", "u", "p", false)
            .await
            .unwrap();

        assert!(registry.remove_database("a").await);
        assert!(!backend.pools()[0].is_closed());
        assert_eq!(registry.databases().await[0].labels, vec!["b".to_string()]);

        assert!(registry.remove_database("b").await);
        assert!(backend.pools()[0].is_closed());
        assert_eq!(registry.pool_count().await, 0);
    }

    #[tokio::test]
    async fn test_readd_after_teardown_opens_new_pool() {
        let (backend, registry) = registry();
        registry
            .add_database("a", "h:3306/db", "u", "p", false)
            .await
            .unwrap();
        registry.remove_database("a").await;
        registry
            .add_database("a", "h:3306/db", "u", "p", false)
            .await
            .unwrap();

        assert_eq!(backend.opened_count(), 2);
        let lease = registry.connect("a").await.unwrap();
        assert_eq!(lease.pool_id(), 1);
    }

    #[tokio::test]
    async fn test_operations_after_shutdown() {
        let (backend, registry) = registry();
        registry
            .add_database("a", "h:3306/db", "u", "p", false)
            .await
            .unwrap();
        registry.shutdown().await;

        assert!(registry.is_closed().await);
        assert_eq!(backend.live_count(), 0);
        assert!(matches!(
            registry.add_database("b", "h:3306/db", "u", "p", false).await,
            Err(DbError::RegistryClosed)
        ));
        assert!(matches!(
            registry.connect("a").await,
            Err(DbError::RegistryClosed)
        ));
        assert!(!registry.remove_database("a").await);
        assert_eq!(registry.database_name("a").await, None);
    }

    #[tokio::test]
    async fn test_connect_within_deadline() {
        let (_, registry) = registry();
        registry
            .add_database("a", "h:3306/db", "u", "p", false)
            .await
            .unwrap();
        let lease = registry
            .connect_within("a", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(lease.schema(), "db");
    }
}
