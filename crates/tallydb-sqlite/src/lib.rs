//! SQLite storage backend for TallyDB.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

use rusqlite::{params, Connection, ErrorCode, TransactionBehavior};

use tallydb_core::{
    storage::check_row, Budget, Category, CommitReceipt, StorageBackend, StorageError, Transaction,
    TransactionType, WriteOp, SCHEMA_VERSION,
};

pub struct SqliteStorage {
    conn: Mutex<Option<Connection>>,
    tx_counter: AtomicU64,
    schema_version: u32,
}

fn storage_error(e: rusqlite::Error) -> StorageError {
    match e.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => StorageError::Conflict(e.to_string()),
        _ => StorageError::IoFailure(e.to_string()),
    }
}

impl SqliteStorage {
    /// Opens (creating if needed) the database at `path`. `":memory:"` opens a
    /// private in-memory database.
    pub fn open(path: &str, schema_version: u32) -> Result<Self, StorageError> {
        if schema_version != SCHEMA_VERSION {
            return Err(StorageError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                found: schema_version,
            });
        }

        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(storage_error)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(storage_error)?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(storage_error)?;

        Self::init_schema(&conn, schema_version)?;
        tracing::debug!(path, schema_version, "SQLite storage opened");

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            tx_counter: AtomicU64::new(1),
            schema_version,
        })
    }

    fn init_schema(conn: &Connection, schema_version: u32) -> Result<(), StorageError> {
        let found: u32 = conn
            .query_row("PRAGMA user_version", [], |r| r.get(0))
            .map_err(storage_error)?;
        if found == schema_version {
            return Ok(());
        }
        if found != 0 {
            return Err(StorageError::SchemaMismatch {
                expected: schema_version,
                found,
            });
        }

        conn.execute_batch(&format!(
            "
            BEGIN;

            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                amount REAL NOT NULL,
                timestamp INTEGER NOT NULL,
                categoryId INTEGER NOT NULL,
                note TEXT NOT NULL,
                type TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                iconMetadata TEXT NOT NULL,
                budgetLimit REAL NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS budgets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                categoryId INTEGER NOT NULL,
                monthlyLimit REAL NOT NULL,
                monthYear TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS index_transactions_categoryId
                ON transactions(categoryId);

            CREATE INDEX IF NOT EXISTS index_budgets_categoryId
                ON budgets(categoryId);

            PRAGMA user_version = {};

            COMMIT;
            ",
            schema_version
        ))
        .map_err(storage_error)?;
        Ok(())
    }

    fn connection(&self) -> Result<MutexGuard<'_, Option<Connection>>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::IoFailure("connection lock poisoned".to_string()))
    }

    fn apply(tx: &rusqlite::Transaction<'_>, ops: &[WriteOp]) -> Result<CommitReceipt, StorageError> {
        let mut receipt = CommitReceipt::default();
        for op in ops {
            check_row(op)?;
            let id = match op {
                WriteOp::UpsertTransaction(t) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO transactions (id, amount, timestamp, categoryId, note, type)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![explicit_id(t.id), t.amount, t.timestamp, t.category_id, t.note, t.kind.as_str()],
                    )
                    .map_err(storage_error)?;
                    tx.last_insert_rowid()
                }
                WriteOp::UpsertCategory(c) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO categories (id, name, iconMetadata, budgetLimit)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![explicit_id(c.id), c.name, c.icon_metadata, c.budget_limit],
                    )
                    .map_err(storage_error)?;
                    tx.last_insert_rowid()
                }
                WriteOp::UpsertBudget(b) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO budgets (id, categoryId, monthlyLimit, monthYear)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![explicit_id(b.id), b.category_id, b.monthly_limit, b.month_year],
                    )
                    .map_err(storage_error)?;
                    tx.last_insert_rowid()
                }
                WriteOp::Delete { table, id } => {
                    tx.execute(&format!("DELETE FROM {} WHERE id = ?1", table.name()), params![id])
                        .map_err(storage_error)?;
                    *id
                }
                WriteOp::DeleteAll(table) => {
                    tx.execute(&format!("DELETE FROM {}", table.name()), [])
                        .map_err(storage_error)?;
                    0
                }
            };
            receipt.record(op.table(), id);
        }
        Ok(receipt)
    }
}

/// Id 0 asks SQLite to allocate the next one; any other id is stored as given.
fn explicit_id(id: i64) -> Option<i64> {
    (id != 0).then_some(id)
}

impl StorageBackend for SqliteStorage {
    fn execute(&self, ops: &[WriteOp]) -> Result<CommitReceipt, StorageError> {
        let mut guard = self.connection()?;
        let conn = guard.as_mut().ok_or(StorageError::Closed)?;

        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_error)?;
        tracing::debug!(tx_id, ops = ops.len(), "SQLite transaction started");

        match Self::apply(&tx, ops) {
            Ok(receipt) => {
                tx.commit().map_err(storage_error)?;
                tracing::debug!(tx_id, tables = ?receipt.tables, "SQLite transaction committed");
                Ok(receipt)
            }
            Err(e) => {
                tx.rollback().map_err(storage_error)?;
                tracing::debug!(tx_id, error = %e, "SQLite transaction rolled back");
                Err(e)
            }
        }
    }

    fn transactions(&self, kind: Option<TransactionType>) -> Result<Vec<Transaction>, StorageError> {
        let guard = self.connection()?;
        let conn = guard.as_ref().ok_or(StorageError::Closed)?;

        let mut stmt = conn
            .prepare_cached(
                "SELECT id, amount, timestamp, categoryId, note, type
                 FROM transactions
                 WHERE ?1 IS NULL OR type = ?1
                 ORDER BY id",
            )
            .map_err(storage_error)?;

        let rows = stmt
            .query_map(params![kind.map(|k| k.as_str())], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(storage_error)?;

        let mut result = Vec::new();
        for row in rows {
            let (id, amount, timestamp, category_id, note, kind) = row.map_err(storage_error)?;
            let kind = kind.parse::<TransactionType>().map_err(StorageError::IoFailure)?;
            result.push(Transaction {
                id,
                amount,
                timestamp,
                category_id,
                note,
                kind,
            });
        }
        Ok(result)
    }

    fn categories(&self) -> Result<Vec<Category>, StorageError> {
        let guard = self.connection()?;
        let conn = guard.as_ref().ok_or(StorageError::Closed)?;

        let mut stmt = conn
            .prepare_cached("SELECT id, name, iconMetadata, budgetLimit FROM categories ORDER BY id")
            .map_err(storage_error)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Category {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    icon_metadata: row.get(2)?,
                    budget_limit: row.get(3)?,
                })
            })
            .map_err(storage_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(storage_error)
    }

    fn budgets(&self, month_year: Option<&str>) -> Result<Vec<Budget>, StorageError> {
        let guard = self.connection()?;
        let conn = guard.as_ref().ok_or(StorageError::Closed)?;

        let mut stmt = conn
            .prepare_cached(
                "SELECT id, categoryId, monthlyLimit, monthYear
                 FROM budgets
                 WHERE ?1 IS NULL OR monthYear = ?1
                 ORDER BY id",
            )
            .map_err(storage_error)?;
        let rows = stmt
            .query_map(params![month_year], |row| {
                Ok(Budget {
                    id: row.get(0)?,
                    category_id: row.get(1)?,
                    monthly_limit: row.get(2)?,
                    month_year: row.get(3)?,
                })
            })
            .map_err(storage_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(storage_error)
    }

    fn schema_version(&self) -> u32 {
        self.schema_version
    }

    fn close(&self) -> Result<(), StorageError> {
        let mut guard = self.connection()?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| storage_error(e))?;
            tracing::debug!("SQLite storage closed");
        }
        Ok(())
    }
}
