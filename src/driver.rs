//! Process lifecycle hooks around the registry.
//!
//! `on_start` registers every database listed in the configuration file and
//! `on_stop` shuts the registry down. What happens when an entry fails is
//! governed by [`StartupPolicy`].

use crate::config::{ConfigFile, StartupPolicy};
use crate::db::{DatabaseRegistry, PoolBackend};
use crate::error::{DbError, DbResult};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Outcome of registering the configured databases.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartupReport {
    /// Labels registered, in configuration order.
    pub registered: Vec<String>,
    /// Labels skipped because they were already registered.
    pub duplicates: Vec<String>,
    /// Labels that failed under the best-effort policy, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Owns the registry for the lifetime of the host process.
#[derive(Debug)]
pub struct Driver<B: PoolBackend> {
    registry: Arc<DatabaseRegistry<B>>,
    policy: StartupPolicy,
}

impl<B: PoolBackend> Driver<B> {
    pub fn new(registry: Arc<DatabaseRegistry<B>>, policy: StartupPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn registry(&self) -> &Arc<DatabaseRegistry<B>> {
        &self.registry
    }

    pub fn policy(&self) -> StartupPolicy {
        self.policy
    }

    /// Bootstrap from the configuration file at `path`.
    ///
    /// If the file does not exist a template is written and `Ok(None)` is
    /// returned; the caller should stop and let the operator fill it in.
    pub async fn on_start(&self, path: &Path) -> DbResult<Option<StartupReport>> {
        if !path.exists() {
            ConfigFile::write_template(path)?;
            warn!(
                path = %path.display(),
                "A new config file was generated. Please update it and restart."
            );
            return Ok(None);
        }

        let file = match ConfigFile::load(path) {
            Ok(file) => file,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Could not load configuration");
                return Err(e);
            }
        };

        self.register_all(&file).await.map(Some)
    }

    /// Register every entry of `file`.
    ///
    /// Duplicate labels are logged and skipped. Under the strict policy the
    /// first failing entry aborts startup and the registry is shut down.
    pub async fn register_all(&self, file: &ConfigFile) -> DbResult<StartupReport> {
        let mut report = StartupReport::default();

        for entry in &file.databases {
            let result = self
                .registry
                .add_database(
                    &entry.label,
                    &entry.location,
                    &entry.username,
                    &entry.password,
                    entry.is_secure,
                )
                .await;

            match result {
                Ok(true) => report.registered.push(entry.label.clone()),
                Ok(false) => {
                    error!(label = %entry.label, "Skipping duplicate database entry");
                    report.duplicates.push(entry.label.clone());
                }
                Err(e) => match self.policy {
                    StartupPolicy::Strict => {
                        error!(
                            label = %entry.label,
                            error = %e,
                            "Database could not be registered, aborting startup"
                        );
                        self.registry.shutdown().await;
                        return Err(e);
                    }
                    StartupPolicy::BestEffort => {
                        warn!(
                            label = %entry.label,
                            error = %e,
                            "Database could not be registered, continuing"
                        );
                        report.failed.push((entry.label.clone(), e.to_string()));
                    }
                },
            }
        }

        info!(
            registered = report.registered.len(),
            duplicates = report.duplicates.len(),
            failed = report.failed.len(),
            pools = self.registry.pool_count().await,
            "Databases registered"
        );
        Ok(report)
    }

    /// Lease and return one connection per label.
    pub async fn verify(&self) -> Vec<(String, DbResult<()>)> {
        let mut results = Vec::new();
        for label in self.registry.labels().await {
            let outcome = self.registry.connect(&label).await.map(drop);
            match &outcome {
                Ok(()) => info!(label = %label, "Connection verified"),
                Err(e) => error!(label = %label, error = %e, "Connection failed"),
            }
            results.push((label, outcome));
        }
        results
    }

    /// Wait for `shutdown`, then stop.
    ///
    /// The registry is shut down even if `shutdown` resolves to an error,
    /// which is then returned.
    pub async fn serve_until<F>(&self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = std::io::Result<()>>,
    {
        let signal = shutdown.await;
        match &signal {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => error!(error = %e, "Could not listen for interrupt, shutting down"),
        }

        self.on_stop().await;
        signal
    }

    /// Shut the registry down.
    pub async fn on_stop(&self) {
        self.registry.shutdown().await;
        info!("So long, and thanks for all the fish!");
    }
}

/// Fail if any verification result is an error.
pub fn ensure_verified(results: Vec<(String, DbResult<()>)>) -> DbResult<()> {
    let failed: Vec<String> = results
        .into_iter()
        .filter_map(|(label, outcome)| outcome.err().map(|e| format!("{label}: {e}")))
        .collect();

    if failed.is_empty() {
        Ok(())
    } else {
        Err(DbError::connection(
            format!("Could not connect to {}", failed.join(", ")),
            "Check the failing entries in the configuration file",
        ))
    }
}
