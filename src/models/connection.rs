//! Connection-related data models.
//!
//! This module defines the connection descriptor that identifies one physical
//! database, and the summaries reported to operators.

use crate::error::{DbError, DbResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use url::Url;

/// Port used when a location omits one.
pub const DEFAULT_MYSQL_PORT: u16 = 3306;

/// Identifies one physical database.
///
/// Two descriptors describe the same database iff every component is equal.
/// Credentials take part in that comparison, so the same schema reached with
/// different users yields two distinct pools.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub port: u16,
    pub schema: String,
    pub username: String,
    /// Contains sensitive data - never log
    pub password: String,
    pub secure: bool,
}

impl ConnectionDescriptor {
    /// Parse a descriptor from a `host[:port]/schema` location and credentials.
    ///
    /// # Examples
    ///
    /// ```text
    /// db.example.com:3306/lobby_db   # explicit port
    /// db.example.com/lobby_db        # port 3306
    /// ```
    pub fn parse(
        location: &str,
        username: impl Into<String>,
        password: impl Into<String>,
        secure: bool,
    ) -> DbResult<Self> {
        let segments: Vec<&str> = location.split('/').collect();
        let [address, schema] = segments.as_slice() else {
            return Err(DbError::configuration(format!(
                "Database location '{}' must be in the form host:port/database",
                location
            )));
        };

        if schema.is_empty() {
            return Err(DbError::configuration(format!(
                "Database location '{}' is missing the database name",
                location
            )));
        }

        let (host, port) = Self::split_address(address)?;

        Ok(Self {
            host: host.to_string(),
            port,
            schema: schema.to_string(),
            username: username.into(),
            password: password.into(),
            secure,
        })
    }

    fn split_address(address: &str) -> DbResult<(&str, u16)> {
        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    DbError::configuration(format!(
                        "Invalid port '{}' in database location",
                        port
                    ))
                })?;
                (host, port)
            }
            None => (address, DEFAULT_MYSQL_PORT),
        };

        if host.is_empty() {
            return Err(DbError::configuration(
                "Database location is missing the host name",
            ));
        }
        Ok((host, port))
    }

    /// The `host:port` part of the location.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Build the driver URL, credentials included.
    pub fn connection_url(&self) -> DbResult<Url> {
        let mut url = Url::parse(&format!("mysql://{}/{}", self.address(), self.schema))
            .map_err(|e| DbError::configuration(format!("Invalid database location: {e}")))?;

        url.set_username(&self.username)
            .and_then(|_| url.set_password(Some(&self.password)))
            .map_err(|_| DbError::configuration("Database location cannot carry credentials"))?;

        let ssl_mode = if self.secure { "REQUIRED" } else { "DISABLED" };
        url.query_pairs_mut().append_pair("ssl-mode", ssl_mode);
        Ok(url)
    }

    /// Get a display-safe version of the driver URL (password masked).
    pub fn masked_url(&self) -> String {
        format!(
            "mysql://{}:****@{}/{}?ssl-mode={}",
            self.username,
            self.address(),
            self.schema,
            if self.secure { "REQUIRED" } else { "DISABLED" }
        )
    }
}

impl std::fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("schema", &self.schema)
            .field("username", &self.username)
            .field("password", &"****")
            .field("secure", &self.secure)
            .finish()
    }
}

impl std::fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}/{}", self.username, self.address(), self.schema)
    }
}

/// Lifecycle of a pooled database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Uninitialized,
    Live,
    /// Terminal; a closed pool is never reopened.
    Closed,
}

impl PoolState {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Live => write!(f, "live"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// One physical database as reported to operators (no secrets exposed).
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseSummary {
    pub schema: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secure: bool,
    /// Labels currently pointing at this pool, sorted.
    pub labels: Vec<String>,
    pub state: PoolState,
    pub created_at: DateTime<Utc>,
}
