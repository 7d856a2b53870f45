//! Data models for the registry.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;

// Re-export commonly used types
pub use connection::{ConnectionDescriptor, DEFAULT_MYSQL_PORT, DatabaseSummary, PoolState};
