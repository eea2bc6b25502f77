//! Bank SMS alerts turned into ledger transactions.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use tallydb_core::{Transaction, TransactionType};

// Compile regexes once
static DEBIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)debited by (?:Rs\.?\s?)?([\d,.]+)").expect("valid debit regex"));
static CREDIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)credited by (?:Rs\.?\s?)?([\d,.]+)").expect("valid credit regex"));
static REQUESTED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)requested (?:Rs\.?\s?)?([\d,.]+)").expect("valid request regex"));

static TRF_TO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)trf to ([\s\w]+?)(?: on|\.|$)").expect("valid payee regex"));
static TRANSFER_FROM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)transfer from ([\s\w]+?)(?: on|\.|$)").expect("valid payer regex"));
static REQUESTED_BY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)requested by ([\s\w]+?)(?: on|\.|$)").expect("valid requester regex"));
static FRM_U_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)frm u on ([\s\w]+?)(?: on|\.|$)").expect("valid requester regex"));

/// A transaction recognised in an SMS alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedSms {
    pub amount: f64,
    pub kind: TransactionType,
    pub vendor: String,
    /// A payment request that has not been paid yet.
    pub pending: bool,
}

impl ParsedSms {
    /// Note stored on imported transactions.
    pub fn note(&self) -> String {
        format!("{} (SMS)", self.vendor)
    }

    pub fn to_transaction(&self, timestamp: i64, category_id: i64) -> Transaction {
        Transaction::new(self.amount, timestamp, category_id, self.note(), self.kind)
    }
}

/// `1,250.00` and `1250.` both read as 1250; anything unreadable as 0.
fn parse_amount(raw: &str) -> f64 {
    raw.replace(',', "")
        .trim_end_matches('.')
        .parse()
        .unwrap_or(0.0)
}

fn capture(re: &Regex, message: &str) -> Option<String> {
    re.captures(message)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Recognises debit, credit and payment-request alerts. Debits win over
/// credits, and both over requests, when a message mentions several.
pub fn parse_sms(message: &str) -> Option<ParsedSms> {
    if let Some(amount) = capture(&DEBIT_RE, message) {
        return Some(ParsedSms {
            amount: parse_amount(&amount),
            kind: TransactionType::Expense,
            vendor: capture(&TRF_TO_RE, message).unwrap_or_else(|| "Unknown".to_string()),
            pending: false,
        });
    }

    if let Some(amount) = capture(&CREDIT_RE, message) {
        return Some(ParsedSms {
            amount: parse_amount(&amount),
            kind: TransactionType::Income,
            vendor: capture(&TRANSFER_FROM_RE, message).unwrap_or_else(|| "Unknown".to_string()),
            pending: false,
        });
    }

    let amount = capture(&REQUESTED_RE, message)?;
    let vendor = capture(&REQUESTED_BY_RE, message)
        .or_else(|| capture(&FRM_U_RE, message))
        .unwrap_or_else(|| "External Request".to_string());
    Some(ParsedSms {
        amount: parse_amount(&amount),
        kind: TransactionType::Expense,
        vendor,
        pending: true,
    })
}
