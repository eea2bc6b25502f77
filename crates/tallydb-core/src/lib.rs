//! Core types and traits for TallyDB storage backends.
//!
//! This crate provides the `StorageBackend` trait and all associated types,
//! enabling pluggable storage implementations in separate crates.

pub mod calendar;
pub mod models;
pub mod storage;

// Re-export key types at crate root for convenience
pub use calendar::{current_month_year, day_key, month_year_key, MonthYear};
pub use models::{Budget, Category, Table, Transaction, TransactionType};
pub use models::read::{CategoryTotal, DailyTotal};
pub use models::write::{CommitReceipt, WriteOp};
pub use storage::{StorageBackend, StorageError, SCHEMA_VERSION};
