use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

pub mod read;
pub mod write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Income,
    Expense,
}

impl TransactionType {
    /// Name persisted in the `type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Income => "INCOME",
            TransactionType::Expense => "EXPENSE",
        }
    }
}

impl Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INCOME" => Ok(TransactionType::Income),
            "EXPENSE" => Ok(TransactionType::Expense),
            other => Err(format!("unknown transaction type: {}", other)),
        }
    }
}

/// The unit of invalidation. Every committed write names the tables it touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Transactions,
    Categories,
    Budgets,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Transactions => "transactions",
            Table::Categories => "categories",
            Table::Budgets => "budgets",
        }
    }
}

impl Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub amount: f64,
    /// Milliseconds since the Unix epoch, UTC.
    pub timestamp: i64,
    /// Not enforced: may name a category that does not exist.
    pub category_id: i64,
    pub note: String,
    #[serde(rename = "type")]
    pub kind: TransactionType,
}

impl Transaction {
    pub fn new(amount: f64, timestamp: i64, category_id: i64, note: impl Into<String>, kind: TransactionType) -> Self {
        Self {
            id: 0,
            amount,
            timestamp,
            category_id,
            note: note.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub icon_metadata: String,
    #[serde(default)]
    pub budget_limit: f64,
}

impl Category {
    pub fn new(name: impl Into<String>, icon_metadata: impl Into<String>, budget_limit: f64) -> Self {
        Self {
            id: 0,
            name: name.into(),
            icon_metadata: icon_metadata.into(),
            budget_limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub id: i64,
    pub category_id: i64,
    pub monthly_limit: f64,
    /// `MM-yyyy`, stored as given.
    pub month_year: String,
}

impl Budget {
    pub fn new(category_id: i64, monthly_limit: f64, month_year: impl Into<String>) -> Self {
        Self {
            id: 0,
            category_id,
            monthly_limit,
            month_year: month_year.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_type_names() {
        assert_eq!(TransactionType::Income.as_str(), "INCOME");
        assert_eq!("EXPENSE".parse::<TransactionType>(), Ok(TransactionType::Expense));
        assert!("expense".parse::<TransactionType>().is_err());
    }
}
