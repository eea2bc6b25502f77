//! Detection of charges that repeat about once a month.

use std::{collections::BTreeMap, ops::RangeInclusive};

use serde::Serialize;

use tallydb_core::{Transaction, TransactionType};

const MS_PER_DAY: i64 = 86_400_000;

/// Whole days between two charges that count as a monthly cycle.
const MONTHLY_GAP_DAYS: RangeInclusive<i64> = 25..=35;

/// Payment rails rather than merchants.
const GENERIC_MERCHANTS: [&str; 2] = ["UPI", "Cash"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecurringCharge {
    pub merchant: String,
    pub amount: f64,
    /// Timestamp of the charge that completed the first monthly gap.
    pub detected_at: i64,
    pub cycle_days: u32,
}

/// Flags each (merchant, exact amount) pair of expenses with two consecutive
/// charges 25 to 35 whole days apart. The merchant is the trimmed note.
/// Results are ordered by merchant, then detection time.
pub fn find_recurring(transactions: &[Transaction]) -> Vec<RecurringCharge> {
    let mut groups: BTreeMap<(&str, u64), Vec<&Transaction>> = BTreeMap::new();
    for t in transactions {
        if t.kind != TransactionType::Expense {
            continue;
        }
        let merchant = t.note.trim();
        if merchant.is_empty() || GENERIC_MERCHANTS.iter().any(|g| merchant.eq_ignore_ascii_case(g)) {
            continue;
        }
        groups.entry((merchant, t.amount.to_bits())).or_default().push(t);
    }

    let mut found = Vec::new();
    for ((merchant, _), mut charges) in groups {
        if charges.len() < 2 {
            continue;
        }
        charges.sort_by_key(|t| t.timestamp);
        let hit = charges
            .windows(2)
            .find(|pair| MONTHLY_GAP_DAYS.contains(&((pair[1].timestamp - pair[0].timestamp) / MS_PER_DAY)));
        if let Some(pair) = hit {
            found.push(RecurringCharge {
                merchant: merchant.to_string(),
                amount: pair[1].amount,
                detected_at: pair[1].timestamp,
                cycle_days: 30,
            });
        }
    }

    found.sort_by(|a, b| a.merchant.cmp(&b.merchant).then(a.detected_at.cmp(&b.detected_at)));
    found
}
