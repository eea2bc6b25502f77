use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock, PoisonError, Weak,
    },
};

use thiserror::Error;
use tokio::runtime::Handle;

use tallydb_core::{
    Budget, Category, CategoryTotal, CommitReceipt, DailyTotal, Table, Transaction, TransactionType, WriteOp,
};

use crate::{
    config::{BackendKind, DatabaseConfig},
    query::{FromQueryResult, QueryError, QueryExecutor, QueryResult, QuerySpec},
    recurring::{find_recurring, RecurringCharge},
    sms::parse_sms,
    storage::{InMemoryStorage, SqliteStorage, StorageBackend, StorageError},
    subscription::{LiveQuery, Observer, SubscriptionError, SubscriptionHandle, SubscriptionManager},
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error("a tokio runtime is required to open a store")]
    NoRuntime,
    #[error("query returned an unexpected result shape")]
    UnexpectedResult,
}

type StoreKey = (BackendKind, String);

/// Stores currently open in this process, so opening the same database twice
/// hands back the same handle.
fn open_stores() -> &'static Mutex<HashMap<StoreKey, Weak<StoreInner>>> {
    static OPEN_STORES: OnceLock<Mutex<HashMap<StoreKey, Weak<StoreInner>>>> = OnceLock::new();
    OPEN_STORES.get_or_init(|| Mutex::new(HashMap::new()))
}

struct StoreInner {
    key: Option<StoreKey>,
    storage: Arc<dyn StorageBackend>,
    executor: Arc<QueryExecutor>,
    subscriptions: SubscriptionManager,
    closed: AtomicBool,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        self.subscriptions.shutdown();
    }
}

/// Handle to an open ledger. Cheap to clone; all clones share one store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Opens the database described by `config`, or returns the handle that is
    /// already open for it. Must be called from within a tokio runtime, which
    /// then runs the store's subscriptions.
    pub fn open(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let runtime = Handle::try_current().map_err(|_| StoreError::NoRuntime)?;
        let key = (config.path != ":memory:").then(|| (config.backend, config.path.clone()));

        let mut open = open_stores().lock().unwrap_or_else(PoisonError::into_inner);
        open.retain(|_, store| store.strong_count() > 0);

        if let Some(inner) = key.as_ref().and_then(|k| open.get(k)).and_then(Weak::upgrade) {
            if !inner.closed.load(Ordering::SeqCst) {
                let found = inner.storage.schema_version();
                if found != config.schema_version {
                    return Err(StorageError::SchemaMismatch {
                        expected: config.schema_version,
                        found,
                    }
                    .into());
                }
                tracing::debug!(path = %config.path, "Reusing open store");
                return Ok(Self { inner });
            }
        }

        let storage: Arc<dyn StorageBackend> = match config.backend {
            BackendKind::Sqlite => Arc::new(SqliteStorage::open(&config.path, config.schema_version)?),
            BackendKind::Memory => Arc::new(InMemoryStorage::open(config.schema_version)?),
        };
        let executor = Arc::new(QueryExecutor::new(storage.clone()));
        let subscriptions = SubscriptionManager::new(executor.clone(), runtime);

        let inner = Arc::new(StoreInner {
            key: key.clone(),
            storage,
            executor,
            subscriptions,
            closed: AtomicBool::new(false),
        });
        if let Some(key) = key {
            open.insert(key, Arc::downgrade(&inner));
        }

        tracing::info!(path = %config.path, backend = ?config.backend, "Store opened");
        Ok(Self { inner })
    }

    /// Ends every subscription and releases the storage. Affects every clone
    /// of this handle; later calls fail with [`StorageError::Closed`].
    pub fn close(&self) -> Result<(), StoreError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.subscriptions.shutdown();

        if let Some(key) = &self.inner.key {
            let mut open = open_stores().lock().unwrap_or_else(PoisonError::into_inner);
            if open.get(key).is_some_and(|w| w.as_ptr() == Arc::as_ptr(&self.inner)) {
                open.remove(key);
            }
        }

        self.inner.storage.close()?;
        tracing::info!("Store closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StorageError::Closed.into());
        }
        Ok(())
    }

    // Writes

    /// Commits `ops` atomically, then schedules re-runs of the subscriptions
    /// reading the touched tables.
    pub fn execute(&self, ops: &[WriteOp]) -> Result<CommitReceipt, StoreError> {
        self.ensure_open()?;
        let receipt = self.inner.storage.execute(ops)?;
        self.inner.subscriptions.notify_tables(&receipt.tables);
        Ok(receipt)
    }

    fn execute_one(&self, op: WriteOp) -> Result<i64, StoreError> {
        let receipt = self.execute(std::slice::from_ref(&op))?;
        Ok(receipt.ids.first().copied().unwrap_or_default())
    }

    /// Inserts, or replaces the row with the same nonzero id. Returns the id.
    pub fn insert_transaction(&self, transaction: Transaction) -> Result<i64, StoreError> {
        self.execute_one(WriteOp::UpsertTransaction(transaction))
    }

    pub fn insert_category(&self, category: Category) -> Result<i64, StoreError> {
        self.execute_one(WriteOp::UpsertCategory(category))
    }

    pub fn insert_budget(&self, budget: Budget) -> Result<i64, StoreError> {
        self.execute_one(WriteOp::UpsertBudget(budget))
    }

    /// Transactions and budgets that reference the category are left in place.
    pub fn delete_category(&self, id: i64) -> Result<(), StoreError> {
        self.execute_one(WriteOp::Delete { table: Table::Categories, id }).map(|_| ())
    }

    pub fn delete_transaction(&self, id: i64) -> Result<(), StoreError> {
        self.execute_one(WriteOp::Delete { table: Table::Transactions, id }).map(|_| ())
    }

    pub fn delete_budget(&self, id: i64) -> Result<(), StoreError> {
        self.execute_one(WriteOp::Delete { table: Table::Budgets, id }).map(|_| ())
    }

    pub fn delete_all_transactions(&self) -> Result<(), StoreError> {
        self.execute_one(WriteOp::DeleteAll(Table::Transactions)).map(|_| ())
    }

    /// Records the transaction described by a bank SMS alert under the first
    /// category (or category 1 when there is none). Returns `None` for
    /// messages that are not alerts and for unpaid payment requests.
    pub fn import_sms(&self, message: &str, timestamp: i64) -> Result<Option<i64>, StoreError> {
        let Some(parsed) = parse_sms(message) else {
            tracing::debug!("SMS is not a transaction alert");
            return Ok(None);
        };
        if parsed.pending {
            tracing::debug!(vendor = %parsed.vendor, "Skipping pending payment request");
            return Ok(None);
        }

        let categories: Vec<Category> = self.fetch(&QuerySpec::AllCategories)?;
        let category_id = categories.first().map_or(1, |c| c.id);
        let id = self.insert_transaction(parsed.to_transaction(timestamp, category_id))?;
        tracing::info!(id, vendor = %parsed.vendor, kind = %parsed.kind, "Imported SMS transaction");
        Ok(Some(id))
    }

    // Reads

    /// One-shot read that bypasses the subscription pipeline.
    pub fn query(&self, spec: &QuerySpec) -> Result<QueryResult, StoreError> {
        self.ensure_open()?;
        Ok(self.inner.executor.execute(spec)?)
    }

    pub fn fetch<T: FromQueryResult>(&self, spec: &QuerySpec) -> Result<T, StoreError> {
        T::from_result(self.query(spec)?).ok_or(StoreError::UnexpectedResult)
    }

    pub fn subscribe(&self, spec: QuerySpec, observer: Arc<dyn Observer>) -> Result<SubscriptionHandle, StoreError> {
        self.ensure_open()?;
        Ok(self.inner.subscriptions.subscribe(spec, observer)?)
    }

    pub fn live<T: FromQueryResult>(&self, spec: QuerySpec) -> Result<LiveQuery<T>, StoreError> {
        self.ensure_open()?;
        Ok(LiveQuery::subscribe(&self.inner.subscriptions, spec)?)
    }

    /// Monthly repeating expenses found in the whole ledger.
    pub fn recurring_charges(&self) -> Result<Vec<RecurringCharge>, StoreError> {
        let transactions: Vec<Transaction> = self.fetch(&QuerySpec::AllTransactions)?;
        Ok(find_recurring(&transactions))
    }

    pub fn active_subscriptions(&self) -> usize {
        self.inner.subscriptions.active_count()
    }

    pub fn all_transactions(&self) -> Result<LiveQuery<Vec<Transaction>>, StoreError> {
        self.live(QuerySpec::AllTransactions)
    }

    pub fn monthly_total(&self, kind: TransactionType, month_year: &str) -> Result<LiveQuery<Option<f64>>, StoreError> {
        self.live(QuerySpec::MonthlyTotal {
            kind,
            month_year: month_year.to_string(),
        })
    }

    pub fn category_totals_by_month(&self, month_year: &str) -> Result<LiveQuery<Vec<CategoryTotal>>, StoreError> {
        self.live(QuerySpec::CategoryTotalsByMonth {
            month_year: month_year.to_string(),
        })
    }

    pub fn daily_totals_by_month(&self, month_year: &str) -> Result<LiveQuery<Vec<DailyTotal>>, StoreError> {
        self.live(QuerySpec::DailyTotalsByMonth {
            month_year: month_year.to_string(),
        })
    }

    pub fn all_categories(&self) -> Result<LiveQuery<Vec<Category>>, StoreError> {
        self.live(QuerySpec::AllCategories)
    }

    pub fn budgets_by_month(&self, month_year: &str) -> Result<LiveQuery<Vec<Budget>>, StoreError> {
        self.live(QuerySpec::BudgetsByMonth {
            month_year: month_year.to_string(),
        })
    }
}
