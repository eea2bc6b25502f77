use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use tallydb_core::{
    storage::check_row, Budget, Category, CommitReceipt, Table, Transaction, TransactionType,
    WriteOp, SCHEMA_VERSION,
};

// Both backends are reachable through this module.
pub use tallydb_core::storage::{StorageBackend, StorageError};
pub use tallydb_sqlite::SqliteStorage;

#[derive(Clone)]
struct TableData<T> {
    rows: BTreeMap<i64, T>,
    /// Highest id ever written; autogenerated ids start above it.
    last_id: i64,
}

impl<T> TableData<T> {
    fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            last_id: 0,
        }
    }

    /// Id 0 allocates the next id; any other id replaces or inserts that row.
    fn upsert(&mut self, requested: i64, row: impl FnOnce(i64) -> T) -> Result<i64, StorageError> {
        let id = if requested != 0 {
            requested
        } else {
            self.last_id
                .checked_add(1)
                .ok_or_else(|| StorageError::IoFailure("database or disk is full".to_string()))?
        };
        self.last_id = self.last_id.max(id);
        self.rows.insert(id, row(id));
        Ok(id)
    }
}

/// One committed snapshot. Tables are shared between snapshots until a
/// commit writes to them.
#[derive(Clone)]
struct Tables {
    transactions: Arc<TableData<Transaction>>,
    categories: Arc<TableData<Category>>,
    budgets: Arc<TableData<Budget>>,
}

impl Tables {
    fn new() -> Self {
        Self {
            transactions: Arc::new(TableData::new()),
            categories: Arc::new(TableData::new()),
            budgets: Arc::new(TableData::new()),
        }
    }

    fn apply(&mut self, op: &WriteOp) -> Result<i64, StorageError> {
        check_row(op)?;
        match op {
            WriteOp::UpsertTransaction(t) => {
                Arc::make_mut(&mut self.transactions).upsert(t.id, |id| Transaction { id, ..t.clone() })
            }
            WriteOp::UpsertCategory(c) => {
                Arc::make_mut(&mut self.categories).upsert(c.id, |id| Category { id, ..c.clone() })
            }
            WriteOp::UpsertBudget(b) => Arc::make_mut(&mut self.budgets).upsert(b.id, |id| Budget { id, ..b.clone() }),
            WriteOp::Delete { table, id } => {
                match table {
                    Table::Transactions => {
                        Arc::make_mut(&mut self.transactions).rows.remove(id);
                    }
                    Table::Categories => {
                        Arc::make_mut(&mut self.categories).rows.remove(id);
                    }
                    Table::Budgets => {
                        Arc::make_mut(&mut self.budgets).rows.remove(id);
                    }
                }
                Ok(*id)
            }
            WriteOp::DeleteAll(table) => {
                match table {
                    Table::Transactions => Arc::make_mut(&mut self.transactions).rows.clear(),
                    Table::Categories => Arc::make_mut(&mut self.categories).rows.clear(),
                    Table::Budgets => Arc::make_mut(&mut self.budgets).rows.clear(),
                }
                Ok(0)
            }
        }
    }
}

/// Volatile backend. Readers see an immutable snapshot; a commit copies only
/// the tables it writes and publishes the result only if every op succeeded.
pub struct InMemoryStorage {
    tables: RwLock<Arc<Tables>>,
    commit_lock: Mutex<()>,
    tx_counter: AtomicU64,
    closed: AtomicBool,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Arc::new(Tables::new())),
            commit_lock: Mutex::new(()),
            tx_counter: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn open(schema_version: u32) -> Result<Self, StorageError> {
        if schema_version != SCHEMA_VERSION {
            return Err(StorageError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                found: schema_version,
            });
        }
        Ok(Self::new())
    }

    fn snapshot(&self) -> Result<Arc<Tables>, StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        let tables = self
            .tables
            .read()
            .map_err(|_| StorageError::IoFailure("table lock poisoned".to_string()))?;
        Ok(tables.clone())
    }
}

impl StorageBackend for InMemoryStorage {
    fn execute(&self, ops: &[WriteOp]) -> Result<CommitReceipt, StorageError> {
        let _commit = self
            .commit_lock
            .lock()
            .map_err(|_| StorageError::IoFailure("commit lock poisoned".to_string()))?;

        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        let mut next = Tables::clone(&*self.snapshot()?);
        tracing::debug!(tx_id, ops = ops.len(), "Transaction started");

        let mut receipt = CommitReceipt::default();
        for op in ops {
            match next.apply(op) {
                Ok(id) => receipt.record(op.table(), id),
                Err(e) => {
                    tracing::debug!(tx_id, error = %e, "Transaction rolled back");
                    return Err(e);
                }
            }
        }

        *self
            .tables
            .write()
            .map_err(|_| StorageError::IoFailure("table lock poisoned".to_string()))? = Arc::new(next);
        tracing::debug!(tx_id, tables = ?receipt.tables, "Transaction committed");
        Ok(receipt)
    }

    fn transactions(&self, kind: Option<TransactionType>) -> Result<Vec<Transaction>, StorageError> {
        let tables = self.snapshot()?;
        Ok(tables
            .transactions
            .rows
            .values()
            .filter(|t| kind.map_or(true, |k| t.kind == k))
            .cloned()
            .collect())
    }

    fn categories(&self) -> Result<Vec<Category>, StorageError> {
        Ok(self.snapshot()?.categories.rows.values().cloned().collect())
    }

    fn budgets(&self, month_year: Option<&str>) -> Result<Vec<Budget>, StorageError> {
        let tables = self.snapshot()?;
        Ok(tables
            .budgets
            .rows
            .values()
            .filter(|b| month_year.map_or(true, |m| b.month_year == m))
            .cloned()
            .collect())
    }

    fn schema_version(&self) -> u32 {
        SCHEMA_VERSION
    }

    fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expense(amount: f64) -> Transaction {
        Transaction::new(amount, 1_707_568_200_000, 1, "lunch", TransactionType::Expense)
    }

    #[test]
    fn test_autogenerated_ids_are_unique() {
        let storage = InMemoryStorage::new();
        let ops: Vec<WriteOp> = (0..10).map(|i| WriteOp::UpsertTransaction(expense(i as f64))).collect();
        let mut ids = storage.execute(&ops).unwrap().ids;
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 10);
        assert_eq!(storage.transactions(None).unwrap().len(), 10);
    }

    #[test]
    fn test_explicit_id_moves_sequence_forward() {
        let storage = InMemoryStorage::new();
        let mut t = expense(1.0);
        t.id = 40;
        storage.execute(&[WriteOp::UpsertTransaction(t)]).unwrap();
        let next = storage.execute(&[WriteOp::UpsertTransaction(expense(2.0))]).unwrap().ids[0];
        assert_eq!(next, 41);

        storage.execute(&[WriteOp::DeleteAll(Table::Transactions)]).unwrap();
        let after_clear = storage.execute(&[WriteOp::UpsertTransaction(expense(3.0))]).unwrap().ids[0];
        assert_eq!(after_clear, 42, "ids are never reused");
    }

    #[test]
    fn test_transaction_rollback() {
        let storage = InMemoryStorage::new();
        storage.execute(&[WriteOp::UpsertCategory(Category::new("Food", "", 0.0))]).unwrap();

        let err = storage
            .execute(&[
                WriteOp::DeleteAll(Table::Categories),
                WriteOp::UpsertBudget(Budget::new(1, f64::NAN, "02-2024")),
            ])
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
        assert_eq!(storage.categories().unwrap().len(), 1, "Delete should be undone after rollback");
        assert!(storage.budgets(None).unwrap().is_empty());
    }

    #[test]
    fn test_negative_id_is_stored_as_given() {
        let storage = InMemoryStorage::new();
        let mut t = expense(1.0);
        t.id = -5;
        assert_eq!(storage.execute(&[WriteOp::UpsertTransaction(t.clone())]).unwrap().ids, vec![-5]);

        t.amount = 2.0;
        storage.execute(&[WriteOp::UpsertTransaction(t.clone())]).unwrap();
        assert_eq!(storage.transactions(None).unwrap(), vec![t]);

        let next = storage.execute(&[WriteOp::UpsertTransaction(expense(3.0))]).unwrap().ids[0];
        assert_eq!(next, 1);
    }

    #[test]
    fn test_commit_copies_only_written_tables() {
        let storage = InMemoryStorage::new();
        storage.execute(&[WriteOp::UpsertCategory(Category::new("Food", "", 0.0))]).unwrap();
        let before = storage.snapshot().unwrap();

        storage.execute(&[WriteOp::UpsertTransaction(expense(1.0))]).unwrap();
        let after = storage.snapshot().unwrap();
        assert!(Arc::ptr_eq(&before.categories, &after.categories));
        assert!(Arc::ptr_eq(&before.budgets, &after.budgets));
        assert!(!Arc::ptr_eq(&before.transactions, &after.transactions));
        assert!(before.transactions.rows.is_empty(), "published snapshots never change");
    }

    #[test]
    fn test_closed_storage_rejects_calls() {
        let storage = InMemoryStorage::new();
        storage.close().unwrap();
        assert_eq!(storage.categories().unwrap_err(), StorageError::Closed);
        assert_eq!(storage.execute(&[]).unwrap_err(), StorageError::Closed);
    }

    #[test]
    fn test_schema_version_is_checked() {
        assert!(InMemoryStorage::open(SCHEMA_VERSION).is_ok());
        assert!(matches!(
            InMemoryStorage::open(SCHEMA_VERSION + 1),
            Err(StorageError::SchemaMismatch { .. })
        ));
    }
}
