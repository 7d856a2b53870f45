//! Labelled MySQL connection pools.
//!
//! This library maps operator-assigned labels to pooled MySQL connections,
//! shares one pool between labels that describe the same database, and tears
//! a pool down once its last label is removed.

pub mod config;
pub mod db;
pub mod driver;
pub mod error;
pub mod models;

pub use config::Config;
pub use db::DatabaseRegistry;
pub use driver::Driver;
pub use error::DbError;
