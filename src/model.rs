//! Budget domain records shared by the ledger, the oracle and the bot.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One row of the budget tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryBudget {
    #[serde(rename = "קטגוריה")]
    pub name: String,
    #[serde(rename = "תקציב")]
    pub allocated: f64,
    #[serde(rename = "כמה יצא")]
    pub spent: f64,
    #[serde(rename = "כמה נשאר")]
    pub remaining: f64,
}

impl CategoryBudget {
    /// Fresh category for a new period: nothing spent yet.
    pub fn new(name: impl Into<String>, allocated: f64) -> Self {
        Self { name: name.into(), allocated, spent: 0.0, remaining: allocated }
    }
}

/// One row of the transaction tab. Never updated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "קטגוריה")]
    pub category: String,
    #[serde(rename = "פירוט")]
    pub description: String,
    #[serde(rename = "מחיר")]
    pub amount: f64,
    #[serde(rename = "תאריך")]
    pub date: NaiveDate,
}

/// A category name with the amount budgeted for it, as entered during
/// budget setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryAllocation {
    #[serde(rename = "קטגוריה")]
    pub name: String,
    #[serde(rename = "תקציב")]
    pub amount: f64,
}

impl CategoryAllocation {
    pub fn new(name: impl Into<String>, amount: f64) -> Self {
        Self { name: name.into(), amount }
    }
}

/// Format a shekel amount the way it is shown to users: no decimals for
/// whole numbers, at most two otherwise.
pub fn format_amount(amount: f64) -> String {
    if amount.fract() == 0.0 && amount.abs() < 1e15 {
        format!("{}", amount as i64)
    } else {
        let s = format!("{amount:.2}");
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// Sum of allocations, for setup summaries.
pub fn total_allocated(categories: &[CategoryAllocation]) -> f64 {
    categories.iter().map(|c| c.amount).sum()
}
