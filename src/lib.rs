//! TallyDB: an embedded ledger of transactions, categories and budgets whose
//! queries stay live, re-running whenever a table they read is written.

pub mod config;
pub mod invalidation;
pub mod query;
pub mod recurring;
pub mod sms;
pub mod storage;
pub mod store;
pub mod subscription;

pub use tallydb_core::{
    current_month_year, day_key, month_year_key, Budget, Category, CategoryTotal, CommitReceipt, DailyTotal,
    MonthYear, Table, Transaction, TransactionType, WriteOp, SCHEMA_VERSION,
};

pub use config::{BackendKind, DatabaseConfig};
pub use query::{QueryError, QueryExecutor, QueryResult, QuerySpec};
pub use recurring::{find_recurring, RecurringCharge};
pub use sms::{parse_sms, ParsedSms};
pub use store::{Store, StoreError};
pub use subscription::{LiveQuery, Observer, SubscriptionError, SubscriptionHandle, SubscriptionState};
