use serde::{Deserialize, Serialize};

/// Expense total for one category in one month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryTotal {
    pub category_id: i64,
    pub category_name: String,
    pub total_amount: f64,
}

/// Expense total for one calendar day, keyed `yyyy-MM-dd`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyTotal {
    pub date: String,
    pub total_amount: f64,
}
