use std::collections::BTreeSet;

use super::{Budget, Category, Table, Transaction};

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    UpsertTransaction(Transaction),
    UpsertCategory(Category),
    UpsertBudget(Budget),
    Delete { table: Table, id: i64 },
    DeleteAll(Table),
}

impl WriteOp {
    pub fn table(&self) -> Table {
        match self {
            WriteOp::UpsertTransaction(_) => Table::Transactions,
            WriteOp::UpsertCategory(_) => Table::Categories,
            WriteOp::UpsertBudget(_) => Table::Budgets,
            WriteOp::Delete { table, .. } => *table,
            WriteOp::DeleteAll(table) => *table,
        }
    }
}

/// Outcome of a committed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReceipt {
    /// One entry per op: the row id written or deleted, 0 for `DeleteAll`.
    pub ids: Vec<i64>,
    pub tables: BTreeSet<Table>,
}

impl CommitReceipt {
    pub fn record(&mut self, table: Table, id: i64) {
        self.ids.push(id);
        self.tables.insert(table);
    }
}
