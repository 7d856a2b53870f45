//! Database layer for the registry.
//!
//! This module provides the pool provider seam, the pooled database lifecycle,
//! and the label registry built on top of them.

pub mod backend;
pub mod memory;
pub mod pooled;
pub mod registry;

pub use backend::{MySqlBackend, PoolBackend};
pub use memory::{MemoryBackend, MemoryConnection, MemoryPool};
pub use pooled::{Lease, PooledDatabase};
pub use registry::DatabaseRegistry;
