//! # Warden Database Layer
//!
//! SQLite-based persistence sink with sqlx for worker records and quota
//! snapshots. Implements the `warden-core` store traits; the core stays
//! authoritative, this crate only makes its state durable.
//!
//! ## Modules
//!
//! - [`pool`] - Database connection pool
//! - [`models`] - Database row models and conversions
//! - [`repo`] - Repository layer for CRUD operations
//! - [`error`] - Database error types

#![warn(missing_docs)]

/// Module version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Core modules
pub mod error;
pub mod models;
pub mod pool;
pub mod repo;

// Re-exports
pub use error::DbError;
pub use models::{QuotaSnapshotRow, WorkerRow};
pub use pool::DbPool;
pub use repo::Repository;

/// Result type alias
pub type Result<T> = std::result::Result<T, DbError>;
