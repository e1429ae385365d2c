//! Core library for wikimirror (storage, fetch protocol, sync stages, aggregation).

/// Post-sync rating, ranking and series aggregation.
pub mod aggregate;
/// Durable crawl checkpoints.
pub mod checkpoint;
/// Configuration loading and defaults.
pub mod config;
/// Shared defaults and storage names.
pub mod constants;
/// Database access layer and transactions.
pub mod db;
/// Application error types (storage/domain).
pub mod error;
/// Rate-limit-safe fetch protocol.
pub mod fetch;
/// Persisted data models.
pub mod models;
/// Discovery, content and reconciliation stages.
pub mod sync;
/// Upstream query interface consumed by the sync stages.
pub mod upstream;
/// Vote-history reconciliation.
pub mod votes;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use constants::*;
pub use db::Database;
pub use error::AppError;
