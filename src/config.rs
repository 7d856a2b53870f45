//! Configuration handling for the registry host.
//!
//! This module provides configuration management via CLI arguments, environment
//! variables and the JSON file that lists the databases to register at startup.

use crate::error::{DbError, DbResult};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config.json";

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_LIFETIME_SECS: u64 = 180;
pub const DEFAULT_STATEMENT_CACHE_CAPACITY: usize = 250;
pub const DEFAULT_LEAK_DETECTION_THRESHOLD_MS: u64 = 5000;
pub const DEFAULT_CLOSE_TIMEOUT_SECS: u64 = 10;

/// Connection pool tuning applied to every pool the registry opens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolOptions {
    /// Maximum connections in pool (default: 10)
    pub max_connections: Option<u32>,
    /// Minimum connections in pool (default: 1)
    pub min_connections: Option<u32>,
    /// Connection acquire timeout in seconds (default: 30)
    pub acquire_timeout_secs: Option<u64>,
    /// Idle timeout in seconds (default: 30)
    pub idle_timeout_secs: Option<u64>,
    /// Maximum connection lifetime in seconds (default: 180)
    pub max_lifetime_secs: Option<u64>,
    /// Prepared statements cached per connection (default: 250)
    pub statement_cache_capacity: Option<usize>,
    /// Leases held longer than this are reported (default: 5000ms)
    pub leak_detection_threshold_ms: Option<u64>,
    /// Whether to test connections before use (default: true)
    pub test_before_acquire: Option<bool>,
    /// How long closing a pool waits for leased connections (default: 10)
    pub close_timeout_secs: Option<u64>,
}

impl PoolOptions {
    /// Get max_connections with default value.
    pub fn max_connections_or_default(&self) -> u32 {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    /// Get min_connections with default value.
    pub fn min_connections_or_default(&self) -> u32 {
        self.min_connections.unwrap_or(DEFAULT_MIN_CONNECTIONS)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(
            self.acquire_timeout_secs
                .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        )
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS))
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs.unwrap_or(DEFAULT_MAX_LIFETIME_SECS))
    }

    /// Get statement_cache_capacity with default value.
    pub fn statement_cache_capacity_or_default(&self) -> usize {
        self.statement_cache_capacity
            .unwrap_or(DEFAULT_STATEMENT_CACHE_CAPACITY)
    }

    pub fn leak_detection_threshold(&self) -> Duration {
        Duration::from_millis(
            self.leak_detection_threshold_ms
                .unwrap_or(DEFAULT_LEAK_DETECTION_THRESHOLD_MS),
        )
    }

    /// Upper bound on waiting for leases to return when a pool closes.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs.unwrap_or(DEFAULT_CLOSE_TIMEOUT_SECS))
    }

    /// Get test_before_acquire with default value.
    pub fn test_before_acquire_or_default(&self) -> bool {
        self.test_before_acquire.unwrap_or(true)
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_connections {
            if max == 0 {
                return Err("max_connections must be greater than 0".to_string());
            }
        }
        if let Some(min) = self.min_connections {
            if min > self.max_connections_or_default() {
                return Err(format!(
                    "min_connections ({}) cannot exceed max_connections ({})",
                    min,
                    self.max_connections_or_default()
                ));
            }
        }
        if self.acquire_timeout_secs == Some(0) {
            return Err("acquire_timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// What to do when a configured database cannot be registered at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum StartupPolicy {
    /// Abort startup and release everything registered so far
    #[default]
    Strict,
    /// Log the failing entry and keep going
    BestEffort,
}

impl std::fmt::Display for StartupPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::BestEffort => write!(f, "best-effort"),
        }
    }
}

/// One database entry from the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseEntry {
    pub label: String,
    /// `host:port/database`
    pub location: String,
    pub username: String,
    pub password: String,
    #[serde(rename = "isSecure")]
    pub is_secure: bool,
}

/// Contents of the JSON configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub databases: Vec<DatabaseEntry>,
}

impl ConfigFile {
    /// Parse configuration file contents.
    pub fn from_json(contents: &str) -> DbResult<Self> {
        serde_json::from_str(contents).map_err(|e| {
            DbError::configuration(format!("Could not parse the configuration file: {e}"))
        })
    }

    /// Read and parse the configuration file at `path`.
    pub fn load(path: &Path) -> DbResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            DbError::configuration(format!(
                "Could not read configuration file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_json(&contents)
    }

    /// Example configuration written when no file exists yet.
    pub fn template() -> Self {
        Self {
            databases: vec![DatabaseEntry {
                label: "example".to_string(),
                location: "localhost:3306/example".to_string(),
                username: "user".to_string(),
                password: "password".to_string(),
                is_secure: false,
            }],
        }
    }

    /// Write the template to `path`, creating parent directories.
    pub fn write_template(path: &Path) -> DbResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DbError::configuration(format!(
                    "Could not create data folder {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let contents = serde_json::to_string_pretty(&Self::template())
            .map_err(|e| DbError::internal(format!("Could not render template: {e}")))?;
        std::fs::write(path, contents).map_err(|e| {
            DbError::configuration(format!(
                "Could not write configuration file {}: {e}",
                path.display()
            ))
        })
    }
}

/// Configuration for the registry host process.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "mcdb",
    about = "Labelled MySQL connection pools with alias deduplication",
    version,
    author
)]
pub struct Config {
    /// Path to the JSON file listing the databases to register.
    /// A template is written there if it does not exist.
    #[arg(
        short,
        long,
        value_name = "PATH",
        default_value = DEFAULT_CONFIG_PATH,
        env = "MCDB_CONFIG"
    )]
    pub config: PathBuf,

    /// What to do when a configured database fails to register
    #[arg(
        long,
        value_enum,
        default_value = "strict",
        env = "MCDB_STARTUP_POLICY"
    )]
    pub startup_policy: StartupPolicy,

    /// Maximum connections per pool
    #[arg(long, env = "MCDB_MAX_CONNECTIONS")]
    pub max_connections: Option<u32>,

    /// Minimum connections per pool
    #[arg(long, env = "MCDB_MIN_CONNECTIONS")]
    pub min_connections: Option<u32>,

    /// Connection acquire timeout in seconds
    #[arg(long, env = "MCDB_ACQUIRE_TIMEOUT")]
    pub acquire_timeout: Option<u64>,

    /// Idle connection timeout in seconds
    #[arg(long, env = "MCDB_IDLE_TIMEOUT")]
    pub idle_timeout: Option<u64>,

    /// Maximum connection lifetime in seconds
    #[arg(long, env = "MCDB_MAX_LIFETIME")]
    pub max_lifetime: Option<u64>,

    /// Prepared statements cached per connection
    #[arg(long, env = "MCDB_STATEMENT_CACHE_CAPACITY")]
    pub statement_cache_capacity: Option<usize>,

    /// Report connections held longer than this many milliseconds
    #[arg(long, env = "MCDB_LEAK_DETECTION_THRESHOLD_MS")]
    pub leak_detection_threshold_ms: Option<u64>,

    /// Seconds a closing pool waits for leased connections to return
    #[arg(long, env = "MCDB_CLOSE_TIMEOUT")]
    pub close_timeout: Option<u64>,

    /// Acquire one connection per label after startup
    #[arg(long, env = "MCDB_VERIFY")]
    pub verify: bool,

    /// Register against in-memory pools instead of MySQL
    #[arg(long, env = "MCDB_DRY_RUN")]
    pub dry_run: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "MCDB_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "MCDB_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            config: PathBuf::from(DEFAULT_CONFIG_PATH),
            startup_policy: StartupPolicy::Strict,
            max_connections: None,
            min_connections: None,
            acquire_timeout: None,
            idle_timeout: None,
            max_lifetime: None,
            statement_cache_capacity: None,
            leak_detection_threshold_ms: None,
            close_timeout: None,
            verify: false,
            dry_run: false,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    /// Collect the pool tuning flags.
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_connections: self.max_connections,
            min_connections: self.min_connections,
            acquire_timeout_secs: self.acquire_timeout,
            idle_timeout_secs: self.idle_timeout,
            max_lifetime_secs: self.max_lifetime,
            statement_cache_capacity: self.statement_cache_capacity,
            leak_detection_threshold_ms: self.leak_detection_threshold_ms,
            test_before_acquire: None,
            close_timeout_secs: self.close_timeout,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(config.startup_policy, StartupPolicy::Strict);
        assert_eq!(config.pool_options(), PoolOptions::default());
    }

    #[test]
    fn test_parse_cli_flags() {
        let config = Config::try_parse_from([
            "mcdb",
            "--config",
            "plugins/mcdb/config.json",
            "--startup-policy",
            "best-effort",
            "--max-connections",
            "20",
            "--acquire-timeout",
            "5",
            "--close-timeout",
            "2",
        ])
        .unwrap();
        assert_eq!(config.config, PathBuf::from("plugins/mcdb/config.json"));
        assert_eq!(config.startup_policy, StartupPolicy::BestEffort);

        let opts = config.pool_options();
        assert_eq!(opts.max_connections_or_default(), 20);
        assert_eq!(opts.acquire_timeout(), Duration::from_secs(5));
        assert_eq!(opts.close_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_pool_options_defaults() {
        let opts = PoolOptions::default();
        assert_eq!(opts.max_connections_or_default(), 10);
        assert_eq!(opts.min_connections_or_default(), 1);
        assert_eq!(opts.acquire_timeout(), Duration::from_secs(30));
        assert_eq!(opts.idle_timeout(), Duration::from_secs(30));
        assert_eq!(opts.max_lifetime(), Duration::from_secs(180));
        assert_eq!(opts.statement_cache_capacity_or_default(), 250);
        assert_eq!(opts.leak_detection_threshold(), Duration::from_millis(5000));
        assert!(opts.test_before_acquire_or_default());
        assert_eq!(opts.close_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_pool_options_validation() {
        let opts = PoolOptions {
            max_connections: Some(0),
            ..PoolOptions::default()
        };
        assert!(opts.validate().unwrap_err().contains("max_connections"));

        let opts = PoolOptions {
            min_connections: Some(11),
            ..PoolOptions::default()
        };
        assert!(opts.validate().unwrap_err().contains("cannot exceed"));

        let opts = PoolOptions {
            acquire_timeout_secs: Some(0),
            ..PoolOptions::default()
        };
        assert!(opts.validate().is_err());

        assert!(PoolOptions::default().validate().is_ok());
    }

    #[test]
    fn test_config_file_parse() {
        let file = ConfigFile::from_json(
            r#"{
                "databases": [
                    {
                        "label": "lobby",
                        "location": "db.example.com:3306/lobby_db",
                        "username": "u",
                        "password": "p",
                        "isSecure": true
                    },
                    {
                        "label": "stats",
                        "location": "db.example.com:3306/stats",
                        "username": "u",
                        "password": "p",
                        "isSecure": false
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(file.databases.len(), 2);
        assert_eq!(file.databases[0].label, "lobby");
        assert!(file.databases[0].is_secure);
        assert!(!file.databases[1].is_secure);
    }

    #[test]
    fn test_config_file_requires_is_secure() {
        let result = ConfigFile::from_json(
            r#"{
                "databases": [
                    {
                        "label": "lobby",
                        "location": "db.example.com:3306/lobby_db",
                        "username": "u",
                        "password": "p"
                    }
                ]
            }"#,
        );
        let err = result.unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
        assert!(err.to_string().contains("isSecure"));
    }

    #[test]
    fn test_config_file_rejects_bad_json() {
        let result = ConfigFile::from_json(r#"{"databases": [{"label": 5}]}"#);
        assert!(matches!(result, Err(DbError::Configuration { .. })));
    }

    #[test]
    fn test_template_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin").join("config.json");

        ConfigFile::write_template(&path).unwrap();
        let loaded = ConfigFile::load(&path).unwrap();
        assert_eq!(loaded, ConfigFile::template());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = ConfigFile::load(&dir.path().join("absent.json"));
        assert!(matches!(result, Err(DbError::Configuration { .. })));
    }
}
