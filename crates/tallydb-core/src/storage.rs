use thiserror::Error;

use crate::models::{
    write::{CommitReceipt, WriteOp},
    Budget, Category, Transaction, TransactionType,
};

/// The only schema layout this crate knows how to read and write.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    /// A constraint was violated; the whole batch was rolled back.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The underlying medium failed; the whole batch was rolled back.
    #[error("IO failure: {0}")]
    IoFailure(String),
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: u32, found: u32 },
    #[error("storage is closed")]
    Closed,
}

/// Durable table storage.
///
/// `execute` applies a batch atomically and is the only way rows change.
/// Reads never mutate and see only committed state.
pub trait StorageBackend: Send + Sync {
    fn execute(&self, ops: &[WriteOp]) -> Result<CommitReceipt, StorageError>;

    /// Transactions in id order, optionally restricted to one type.
    fn transactions(&self, kind: Option<TransactionType>) -> Result<Vec<Transaction>, StorageError>;
    /// Categories in id order.
    fn categories(&self) -> Result<Vec<Category>, StorageError>;
    /// Budgets in id order, optionally restricted to an exact `monthYear` value.
    fn budgets(&self, month_year: Option<&str>) -> Result<Vec<Budget>, StorageError>;

    fn schema_version(&self) -> u32;
    fn close(&self) -> Result<(), StorageError>;
}

/// Rejects values the schema cannot hold. SQLite stores NaN as NULL, which
/// the NOT NULL columns refuse, so both backends treat it as a conflict.
pub fn check_row(op: &WriteOp) -> Result<(), StorageError> {
    let (column, value) = match op {
        WriteOp::UpsertTransaction(t) => ("transactions.amount", t.amount),
        WriteOp::UpsertCategory(c) => ("categories.budgetLimit", c.budget_limit),
        WriteOp::UpsertBudget(b) => ("budgets.monthlyLimit", b.monthly_limit),
        WriteOp::Delete { .. } | WriteOp::DeleteAll(_) => return Ok(()),
    };
    if value.is_nan() {
        return Err(StorageError::Conflict(format!("NOT NULL constraint failed: {}", column)));
    }
    Ok(())
}
