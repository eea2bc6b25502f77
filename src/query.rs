//! Fixed-shape read queries over the storage backend.
//!
//! Calendar keys are derived here rather than in the backends so that every
//! backend buckets rows identically.

use std::{collections::BTreeMap, fmt::Display, sync::Arc};

use prettytable::{row, Table as TextTable};
use serde::Serialize;
use thiserror::Error;

use tallydb_core::{
    day_key, Budget, Category, CategoryTotal, DailyTotal, MonthYear, Table, Transaction, TransactionType,
};

use crate::storage::{StorageBackend, StorageError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error("malformed month-year parameter: {0}")]
    MalformedMonthYear(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QuerySpec {
    /// Every transaction, newest first.
    AllTransactions,
    /// `SUM(amount)` of one type in one month; absent when nothing matches.
    MonthlyTotal { kind: TransactionType, month_year: String },
    /// Expenses per existing category in one month.
    CategoryTotalsByMonth { month_year: String },
    /// Expenses per day in one month, oldest day first.
    DailyTotalsByMonth { month_year: String },
    AllCategories,
    /// Budgets whose stored `monthYear` equals the parameter exactly.
    BudgetsByMonth { month_year: String },
}

impl QuerySpec {
    /// Tables whose writes can change this query's result.
    pub fn tables(&self) -> &'static [Table] {
        match self {
            QuerySpec::AllTransactions
            | QuerySpec::MonthlyTotal { .. }
            | QuerySpec::DailyTotalsByMonth { .. } => &[Table::Transactions],
            QuerySpec::CategoryTotalsByMonth { .. } => &[Table::Transactions, Table::Categories],
            QuerySpec::AllCategories => &[Table::Categories],
            QuerySpec::BudgetsByMonth { .. } => &[Table::Budgets],
        }
    }

    /// Checks the month-year parameter of calendar-bucketed queries.
    pub fn validate(&self) -> Result<(), QueryError> {
        match self {
            QuerySpec::MonthlyTotal { month_year, .. }
            | QuerySpec::CategoryTotalsByMonth { month_year }
            | QuerySpec::DailyTotalsByMonth { month_year } => parse_month_year(month_year).map(|_| ()),
            _ => Ok(()),
        }
    }

    fn empty_result(&self) -> QueryResult {
        match self {
            QuerySpec::AllTransactions => QueryResult::Transactions(Vec::new()),
            QuerySpec::MonthlyTotal { .. } => QueryResult::Total(None),
            QuerySpec::CategoryTotalsByMonth { .. } => QueryResult::CategoryTotals(Vec::new()),
            QuerySpec::DailyTotalsByMonth { .. } => QueryResult::DailyTotals(Vec::new()),
            QuerySpec::AllCategories => QueryResult::Categories(Vec::new()),
            QuerySpec::BudgetsByMonth { .. } => QueryResult::Budgets(Vec::new()),
        }
    }
}

fn parse_month_year(month_year: &str) -> Result<MonthYear, QueryError> {
    month_year
        .parse()
        .map_err(|_| QueryError::MalformedMonthYear(month_year.to_string()))
}

/// Materialized rows of one query. Equality is what subscriptions use to
/// suppress repeated emissions.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryResult {
    Transactions(Vec<Transaction>),
    Total(Option<f64>),
    CategoryTotals(Vec<CategoryTotal>),
    DailyTotals(Vec<DailyTotal>),
    Categories(Vec<Category>),
    Budgets(Vec<Budget>),
}

/// Typed view of a [`QueryResult`] variant.
pub trait FromQueryResult: Sized {
    fn from_result(result: QueryResult) -> Option<Self>;
}

macro_rules! from_query_result {
    ($ty:ty, $variant:ident) => {
        impl FromQueryResult for $ty {
            fn from_result(result: QueryResult) -> Option<Self> {
                match result {
                    QueryResult::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

from_query_result!(Vec<Transaction>, Transactions);
from_query_result!(Option<f64>, Total);
from_query_result!(Vec<CategoryTotal>, CategoryTotals);
from_query_result!(Vec<DailyTotal>, DailyTotals);
from_query_result!(Vec<Category>, Categories);
from_query_result!(Vec<Budget>, Budgets);

impl FromQueryResult for QueryResult {
    fn from_result(result: QueryResult) -> Option<Self> {
        Some(result)
    }
}

impl Display for QueryResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut table = TextTable::new();
        match self {
            QueryResult::Total(total) => {
                return match total {
                    Some(t) => write!(f, "{}", t),
                    None => f.write_str("null"),
                };
            }
            QueryResult::Transactions(rows) => {
                table.add_row(row!["Id", "Date", "Type", "Amount", "Category", "Note"]);
                table.add_empty_row();
                for t in rows {
                    let date = day_key(t.timestamp).unwrap_or_default();
                    table.add_row(row![t.id, date, t.kind, t.amount, t.category_id, t.note]);
                }
            }
            QueryResult::CategoryTotals(rows) => {
                table.add_row(row!["Category", "Name", "Total"]);
                table.add_empty_row();
                for c in rows {
                    table.add_row(row![c.category_id, c.category_name, c.total_amount]);
                }
            }
            QueryResult::DailyTotals(rows) => {
                table.add_row(row!["Date", "Total"]);
                table.add_empty_row();
                for d in rows {
                    table.add_row(row![d.date, d.total_amount]);
                }
            }
            QueryResult::Categories(rows) => {
                table.add_row(row!["Id", "Name", "Icon", "Budget Limit"]);
                table.add_empty_row();
                for c in rows {
                    table.add_row(row![c.id, c.name, c.icon_metadata, c.budget_limit]);
                }
            }
            QueryResult::Budgets(rows) => {
                table.add_row(row!["Id", "Category", "Monthly Limit", "Month"]);
                table.add_empty_row();
                for b in rows {
                    table.add_row(row![b.id, b.category_id, b.monthly_limit, b.month_year]);
                }
            }
        }
        write!(f, "\n{}\n", table)
    }
}

pub struct QueryExecutor {
    storage: Arc<dyn StorageBackend>,
}

impl QueryExecutor {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Runs `spec` against committed state. A malformed month-year yields the
    /// empty result for that shape instead of an error.
    pub fn execute(&self, spec: &QuerySpec) -> Result<QueryResult, QueryError> {
        match self.run(spec) {
            Err(QueryError::MalformedMonthYear(month_year)) => {
                tracing::debug!(%month_year, "Malformed month-year, returning empty result");
                Ok(spec.empty_result())
            }
            other => other,
        }
    }

    fn run(&self, spec: &QuerySpec) -> Result<QueryResult, QueryError> {
        match spec {
            QuerySpec::AllTransactions => {
                let mut rows = self.storage.transactions(None)?;
                rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
                Ok(QueryResult::Transactions(rows))
            }
            QuerySpec::MonthlyTotal { kind, month_year } => {
                let month = parse_month_year(month_year)?;
                let total = self
                    .storage
                    .transactions(Some(*kind))?
                    .iter()
                    .filter(|t| month.contains(t.timestamp))
                    .fold(None, |acc: Option<f64>, t| Some(acc.unwrap_or(0.0) + t.amount));
                Ok(QueryResult::Total(total))
            }
            QuerySpec::CategoryTotalsByMonth { month_year } => {
                let month = parse_month_year(month_year)?;
                let names: BTreeMap<i64, String> = self
                    .storage
                    .categories()?
                    .into_iter()
                    .map(|c| (c.id, c.name))
                    .collect();

                let mut groups: BTreeMap<i64, CategoryTotal> = BTreeMap::new();
                for t in self.storage.transactions(Some(TransactionType::Expense))? {
                    if !month.contains(t.timestamp) {
                        continue;
                    }
                    // Inner join: orphaned category ids drop out of the report.
                    let Some(name) = names.get(&t.category_id) else {
                        continue;
                    };
                    groups
                        .entry(t.category_id)
                        .or_insert_with(|| CategoryTotal {
                            category_id: t.category_id,
                            category_name: name.clone(),
                            total_amount: 0.0,
                        })
                        .total_amount += t.amount;
                }
                Ok(QueryResult::CategoryTotals(groups.into_values().collect()))
            }
            QuerySpec::DailyTotalsByMonth { month_year } => {
                let month = parse_month_year(month_year)?;
                let mut days: BTreeMap<String, f64> = BTreeMap::new();
                for t in self.storage.transactions(Some(TransactionType::Expense))? {
                    if !month.contains(t.timestamp) {
                        continue;
                    }
                    if let Some(day) = day_key(t.timestamp) {
                        *days.entry(day).or_insert(0.0) += t.amount;
                    }
                }
                Ok(QueryResult::DailyTotals(
                    days.into_iter()
                        .map(|(date, total_amount)| DailyTotal { date, total_amount })
                        .collect(),
                ))
            }
            QuerySpec::AllCategories => Ok(QueryResult::Categories(self.storage.categories()?)),
            QuerySpec::BudgetsByMonth { month_year } => {
                Ok(QueryResult::Budgets(self.storage.budgets(Some(month_year))?))
            }
        }
    }
}
