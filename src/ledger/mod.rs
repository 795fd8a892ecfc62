//! Ledger store: the budget and transaction tabs of the current period,
//! plus the `__configs` key/value area.
//!
//! All access goes through [`Spreadsheet`], a thin cell-level boundary
//! implemented by [`sheets::GoogleSheets`] for production and
//! [`memory::MemorySheets`] for tests. The ledger never caches: every call
//! reads what it needs, so two instances over one spreadsheet agree.

pub mod memory;
mod range;
pub mod sheets;

use chrono::{Duration, NaiveDate};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use tracing::{debug, info, warn};

use crate::model::{CategoryAllocation, CategoryBudget, Transaction};
use crate::retry::Transient;

pub use range::{CellRange, column_letter};

pub const CONFIG_SHEET: &str = "__configs";
pub const WORKING_SHEET_KEY: &str = "working_sheet";
pub const LAST_REFRESH_KEY: &str = "last_refresh";

pub const COL_CATEGORY: &str = "קטגוריה";
pub const COL_ALLOCATED: &str = "תקציב";
pub const COL_SPENT: &str = "כמה יצא";
pub const COL_REMAINING: &str = "כמה נשאר";
pub const COL_DESCRIPTION: &str = "פירוט";
pub const COL_AMOUNT: &str = "מחיר";
pub const COL_DATE: &str = "תאריך";

pub const BUDGET_HEADERS: [&str; 4] = [COL_CATEGORY, COL_ALLOCATED, COL_SPENT, COL_REMAINING];
pub const TRACKER_HEADERS: [&str; 4] = [COL_CATEGORY, COL_DESCRIPTION, COL_AMOUNT, COL_DATE];

/// Widest column read from a period tab.
const LAST_COL: u32 = 25;

/// Which of the two spreadsheets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Book {
    /// Budget tabs and `__configs`.
    Budget,
    /// Transaction tabs.
    Tracker,
}

impl fmt::Display for Book {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Book::Budget => f.write_str("budget"),
            Book::Tracker => f.write_str("tracker"),
        }
    }
}

pub type Row = Vec<Value>;

#[derive(Debug, thiserror::Error)]
pub enum SheetsError {
    /// The request never reached the server.
    #[error("connection failed: {0}")]
    Connect(String),
    /// The request may or may not have been applied.
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("sheets API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("auth failed: {0}")]
    Auth(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl Transient for SheetsError {
    fn is_transient(&self) -> bool {
        match self {
            SheetsError::Connect(_) | SheetsError::Http(_) => true,
            SheetsError::Api { status, .. } => *status == 429 || *status >= 500,
            SheetsError::Auth(_) | SheetsError::Decode(_) => false,
        }
    }
}

impl SheetsError {
    /// Whether the server certainly did not apply the request.
    pub fn not_applied(&self) -> bool {
        matches!(self, SheetsError::Connect(_) | SheetsError::Api { status: 429, .. })
    }
}

/// Cell-level access to the two spreadsheets.
pub trait Spreadsheet: Send + Sync {
    /// Rows of `range`, relative to its top-left corner. Trailing empty rows
    /// and cells may be absent.
    fn read(&self, book: Book, range: &CellRange) -> impl Future<Output = Result<Vec<Row>, SheetsError>> + Send;

    /// Overwrite cells starting at the top-left of `range`.
    fn write(&self, book: Book, range: &CellRange, rows: Vec<Row>) -> impl Future<Output = Result<(), SheetsError>> + Send;

    /// Add rows after the last non-empty row of the tab.
    fn append(&self, book: Book, range: &CellRange, rows: Vec<Row>) -> impl Future<Output = Result<(), SheetsError>> + Send;

    /// Several writes in one request; applied together or not at all.
    fn batch_write(
        &self,
        book: Book,
        updates: Vec<(CellRange, Vec<Row>)>,
    ) -> impl Future<Output = Result<(), SheetsError>> + Send;

    fn sheet_exists(&self, book: Book, title: &str) -> impl Future<Output = Result<bool, SheetsError>> + Send;

    /// Create an empty right-to-left tab.
    fn add_sheet(&self, book: Book, title: &str) -> impl Future<Output = Result<(), SheetsError>> + Send;
}

impl<T: Spreadsheet + ?Sized> Spreadsheet for std::sync::Arc<T> {
    fn read(&self, book: Book, range: &CellRange) -> impl Future<Output = Result<Vec<Row>, SheetsError>> + Send {
        (**self).read(book, range)
    }

    fn write(&self, book: Book, range: &CellRange, rows: Vec<Row>) -> impl Future<Output = Result<(), SheetsError>> + Send {
        (**self).write(book, range, rows)
    }

    fn append(&self, book: Book, range: &CellRange, rows: Vec<Row>) -> impl Future<Output = Result<(), SheetsError>> + Send {
        (**self).append(book, range, rows)
    }

    fn batch_write(
        &self,
        book: Book,
        updates: Vec<(CellRange, Vec<Row>)>,
    ) -> impl Future<Output = Result<(), SheetsError>> + Send {
        (**self).batch_write(book, updates)
    }

    fn sheet_exists(&self, book: Book, title: &str) -> impl Future<Output = Result<bool, SheetsError>> + Send {
        (**self).sheet_exists(book, title)
    }

    fn add_sheet(&self, book: Book, title: &str) -> impl Future<Output = Result<(), SheetsError>> + Send {
        (**self).add_sheet(book, title)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error(transparent)]
    Transport(#[from] SheetsError),
    #[error("configuration key '{0}' not found")]
    MissingConfigKey(String),
    #[error("category '{0}' not found in the budget tab")]
    MissingCategory(String),
    #[error("column '{column}' missing from {book} tab '{sheet}'")]
    MissingColumn { book: Book, sheet: String, column: String },
    #[error("{book} tab '{sheet}' has no header row")]
    EmptyPeriod { book: Book, sheet: String },
    #[error("period '{0}' is the working period and holds live balances")]
    ActivePeriod(String),
}

impl LedgerError {
    pub fn is_transport(&self) -> bool {
        matches!(self, LedgerError::Transport(_))
    }
}

/// Stage of [`Ledger::provision_period`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    CreateSheets,
    WriteCategories,
    MovePointer,
}

impl ProvisionStep {
    /// How the step is named to users.
    pub fn describe(&self) -> &'static str {
        match self {
            ProvisionStep::CreateSheets => "יצירת הגליונות",
            ProvisionStep::WriteCategories => "כתיבת הקטגוריות",
            ProvisionStep::MovePointer => "עדכון החודש הפעיל",
        }
    }
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionStep::CreateSheets => f.write_str("create sheets"),
            ProvisionStep::WriteCategories => f.write_str("write categories"),
            ProvisionStep::MovePointer => f.write_str("move working-sheet pointer"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("provisioning failed at '{step}': {source}")]
pub struct ProvisionError {
    pub step: ProvisionStep,
    #[source]
    pub source: LedgerError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionReport {
    pub label: String,
    pub categories: usize,
    pub created_budget_tab: bool,
    pub created_tracker_tab: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecomputeSummary {
    pub updated: usize,
    /// Categories with transactions but no row in the budget tab.
    pub failed: Vec<String>,
}

/// Cell as trimmed text. Numbers print without a trailing `.0`.
pub fn cell_str(row: &[Value], idx: usize) -> String {
    match row.get(idx) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// Cell as a number. Text like "1,200 ₪" parses; blanks and words do not.
pub fn cell_f64(row: &[Value], idx: usize) -> Option<f64> {
    match row.get(idx)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s.chars().filter(|c| !matches!(c, '₪' | ',' | ' ')).collect();
            if cleaned.is_empty() { None } else { cleaned.parse().ok() }
        }
        _ => None,
    }
}

fn is_blank_row(row: &[Value]) -> bool {
    (0..row.len()).all(|i| cell_str(row, i).is_empty())
}

/// Dates come back as `YYYY-MM-DD` text, or as spreadsheet serial days when
/// the cell was formatted as a date.
fn cell_date(row: &[Value], idx: usize) -> Option<NaiveDate> {
    match row.get(idx)? {
        Value::String(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .or_else(|_| NaiveDate::parse_from_str(s.trim(), "%d/%m/%Y"))
            .ok(),
        Value::Number(n) => {
            let serial = n.as_f64()?;
            let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
            epoch.checked_add_signed(Duration::days(serial.trunc() as i64))
        }
        _ => None,
    }
}

/// A tab read in full: header row plus data rows.
struct Table {
    book: Book,
    sheet: String,
    headers: Vec<String>,
    rows: Vec<Row>,
}

impl Table {
    fn from_rows(book: Book, sheet: &str, mut rows: Vec<Row>) -> Result<Self, LedgerError> {
        if rows.is_empty() {
            return Err(LedgerError::EmptyPeriod { book, sheet: sheet.to_string() });
        }
        let header_row = rows.remove(0);
        let headers: Vec<String> = (0..header_row.len()).map(|i| cell_str(&header_row, i)).collect();
        if headers.iter().all(|h| h.is_empty()) {
            return Err(LedgerError::EmptyPeriod { book, sheet: sheet.to_string() });
        }
        Ok(Self { book, sheet: sheet.to_string(), headers, rows })
    }

    fn column(&self, name: &str) -> Result<usize, LedgerError> {
        self.headers.iter().position(|h| h == name).ok_or_else(|| LedgerError::MissingColumn {
            book: self.book,
            sheet: self.sheet.clone(),
            column: name.to_string(),
        })
    }
}

pub struct Ledger<S> {
    sheets: S,
}

impl<S: Spreadsheet> Ledger<S> {
    pub fn new(sheets: S) -> Self {
        Self { sheets }
    }

    pub fn sheets(&self) -> &S {
        &self.sheets
    }

    // Configuration

    async fn config_rows(&self) -> Result<Vec<Row>, LedgerError> {
        Ok(self.sheets.read(Book::Budget, &CellRange::columns(CONFIG_SHEET, 0, 1)).await?)
    }

    /// Value stored under `key`. A missing key is [`LedgerError::MissingConfigKey`],
    /// distinct from a failed read.
    pub async fn get_config(&self, key: &str) -> Result<String, LedgerError> {
        let rows = self.config_rows().await?;
        rows.iter()
            .find(|row| cell_str(row, 0) == key)
            .map(|row| cell_str(row, 1))
            .ok_or_else(|| LedgerError::MissingConfigKey(key.to_string()))
    }

    /// Update the row holding `key`, or add one below the last row.
    pub async fn set_config(&self, key: &str, value: &str) -> Result<(), LedgerError> {
        let rows = self.config_rows().await?;
        let values = vec![vec![json!(key), json!(value)]];

        match rows.iter().position(|row| cell_str(row, 0) == key) {
            Some(idx) => {
                let row = idx as u32 + 1;
                self.sheets.write(Book::Budget, &CellRange::row(CONFIG_SHEET, row, 0, 1), values).await?;
                debug!("Config {} updated in row {}", key, row);
            }
            None => {
                let row = rows.len() as u32 + 1;
                self.sheets.write(Book::Budget, &CellRange::row(CONFIG_SHEET, row, 0, 1), values).await?;
                debug!("Config {} added in row {}", key, row);
            }
        }
        Ok(())
    }

    /// Label of the active period. Fails closed: a missing or blank pointer
    /// is an error, never a guess.
    pub async fn current_period(&self) -> Result<String, LedgerError> {
        let label = self.get_config(WORKING_SHEET_KEY).await?;
        if label.is_empty() {
            return Err(LedgerError::MissingConfigKey(WORKING_SHEET_KEY.to_string()));
        }
        Ok(label)
    }

    // Reads

    async fn table(&self, book: Book, period: &str) -> Result<Table, LedgerError> {
        let rows = self.sheets.read(book, &CellRange::columns(period, 0, LAST_COL)).await?;
        Table::from_rows(book, period, rows)
    }

    /// Category names of the current period, in sheet order.
    pub async fn list_categories(&self) -> Result<Vec<String>, LedgerError> {
        let period = self.current_period().await?;
        let rows = self.sheets.read(Book::Budget, &CellRange::columns(&period, 0, 0)).await?;
        Ok(rows.iter().skip(1).map(|row| cell_str(row, 0)).filter(|name| !name.is_empty()).collect())
    }

    pub async fn get_summary(&self) -> Result<Vec<CategoryBudget>, LedgerError> {
        let period = self.current_period().await?;
        let table = self.table(Book::Budget, &period).await?;
        budget_records(&table)
    }

    pub async fn get_category(&self, name: &str) -> Result<Option<CategoryBudget>, LedgerError> {
        Ok(self.get_summary().await?.into_iter().find(|c| c.name == name))
    }

    /// Last `limit` transactions in append order. Rows without a readable
    /// date are skipped.
    pub async fn get_recent_transactions(&self, limit: usize) -> Result<Vec<Transaction>, LedgerError> {
        let period = self.current_period().await?;
        let table = self.table(Book::Tracker, &period).await?;
        let category = table.column(COL_CATEGORY)?;
        let amount = table.column(COL_AMOUNT)?;
        let date = table.column(COL_DATE)?;
        let description = table.column(COL_DESCRIPTION).ok();

        let all: Vec<Transaction> = table
            .rows
            .iter()
            .filter(|row| !is_blank_row(row))
            .filter_map(|row| {
                let Some(parsed_date) = cell_date(row, date) else {
                    debug!("Skipping transaction row without a date: {:?}", row);
                    return None;
                };
                Some(Transaction {
                    category: cell_str(row, category),
                    description: description.map(|i| cell_str(row, i)).unwrap_or_default(),
                    amount: cell_f64(row, amount).unwrap_or(0.0),
                    date: parsed_date,
                })
            })
            .collect();

        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }

    /// Categories of the current period with a positive allocation, used as
    /// the template for the next one.
    pub async fn previous_categories(&self) -> Result<Vec<CategoryAllocation>, LedgerError> {
        Ok(self
            .get_summary()
            .await?
            .into_iter()
            .filter(|c| !c.name.is_empty() && c.allocated > 0.0)
            .map(|c| CategoryAllocation::new(c.name, c.allocated))
            .collect())
    }

    // Mutations

    /// Append one transaction, laid out by the tracker tab's header row.
    /// Headers with no matching field get an empty cell. Does not touch the
    /// budget tab.
    pub async fn append_transaction(&self, tx: &Transaction) -> Result<(), LedgerError> {
        let period = self.current_period().await?;
        let header_rows = self.sheets.read(Book::Tracker, &CellRange::row(&period, 1, 0, LAST_COL)).await?;
        let Some(header_row) = header_rows.first().filter(|r| !r.is_empty()) else {
            return Err(LedgerError::EmptyPeriod { book: Book::Tracker, sheet: period });
        };

        let row: Row = (0..header_row.len())
            .map(|i| match cell_str(header_row, i).as_str() {
                COL_CATEGORY => json!(tx.category),
                COL_DESCRIPTION => json!(tx.description),
                COL_AMOUNT => json!(tx.amount),
                COL_DATE => json!(tx.date.format("%Y-%m-%d").to_string()),
                _ => json!(""),
            })
            .collect();

        self.sheets
            .append(Book::Tracker, &CellRange::columns(&period, 0, LAST_COL), vec![row])
            .await?;
        info!("Appended transaction to '{}': {} {} ({})", period, tx.category, tx.amount, tx.description);
        Ok(())
    }

    /// Recompute spent/remaining for one category from the full transaction
    /// history. `Ok(false)` when the category has no budget row.
    pub async fn recompute_category(&self, name: &str) -> Result<bool, LedgerError> {
        let period = self.current_period().await?;
        let tracker = self.table(Book::Tracker, &period).await?;
        let spent = spent_by_category(&tracker)?.get(name).copied().unwrap_or(0.0);

        let budget = self.table(Book::Budget, &period).await?;
        let columns = BudgetColumns::of(&budget)?;
        let Some(idx) = budget.rows.iter().position(|row| cell_str(row, columns.category) == name) else {
            warn!("Category '{}' not in budget tab '{}'", name, period);
            return Ok(false);
        };

        let allocated = cell_f64(&budget.rows[idx], columns.allocated).unwrap_or(0.0);
        let sheet_row = idx as u32 + 2;
        self.sheets
            .batch_write(Book::Budget, columns.updates(&period, sheet_row, spent, allocated - spent))
            .await?;
        debug!("Recomputed {}: spent={} remaining={}", name, spent, allocated - spent);
        Ok(true)
    }

    /// Recompute every category with one read per tab and a single batched
    /// write.
    pub async fn recompute_all(&self) -> Result<RecomputeSummary, LedgerError> {
        let period = self.current_period().await?;
        let budget = self.table(Book::Budget, &period).await?;
        let tracker = self.table(Book::Tracker, &period).await?;

        let columns = BudgetColumns::of(&budget)?;
        let mut spent = spent_by_category(&tracker)?;

        let mut updates = Vec::new();
        let mut updated = 0;
        for (idx, row) in budget.rows.iter().enumerate() {
            let name = cell_str(row, columns.category);
            if name.is_empty() {
                continue;
            }
            let total = spent.remove(&name).unwrap_or(0.0);
            let allocated = cell_f64(row, columns.allocated).unwrap_or(0.0);
            updates.extend(columns.updates(&period, idx as u32 + 2, total, allocated - total));
            updated += 1;
        }

        let mut failed: Vec<String> = spent.into_keys().filter(|name| !name.is_empty()).collect();
        failed.sort();

        if !updates.is_empty() {
            self.sheets.batch_write(Book::Budget, updates).await?;
        }
        info!("Recomputed {} categories in '{}' ({} orphaned)", updated, period, failed.len());
        Ok(RecomputeSummary { updated, failed })
    }

    /// Create the period's tabs, write its categories, then make it current.
    /// Safe to re-run: existing tabs are reused, their category rows are
    /// replaced and leftover rows blanked. The working period itself is
    /// refused, since rewriting it would zero its spending.
    pub async fn provision_period(
        &self,
        label: &str,
        categories: &[CategoryAllocation],
    ) -> Result<ProvisionReport, ProvisionError> {
        match self.current_period().await {
            Ok(current) if current == label => {
                return Err(ProvisionError {
                    step: ProvisionStep::CreateSheets,
                    source: LedgerError::ActivePeriod(current),
                });
            }
            Ok(_) | Err(LedgerError::MissingConfigKey(_)) => {}
            Err(source) => return Err(ProvisionError { step: ProvisionStep::CreateSheets, source }),
        }

        let created_budget_tab = self
            .ensure_tab(Book::Budget, label, &BUDGET_HEADERS)
            .await
            .map_err(|source| ProvisionError { step: ProvisionStep::CreateSheets, source })?;
        let created_tracker_tab = self
            .ensure_tab(Book::Tracker, label, &TRACKER_HEADERS)
            .await
            .map_err(|source| ProvisionError { step: ProvisionStep::CreateSheets, source })?;

        self.write_categories(label, categories, created_budget_tab)
            .await
            .map_err(|source| ProvisionError { step: ProvisionStep::WriteCategories, source })?;

        self.set_config(WORKING_SHEET_KEY, label)
            .await
            .map_err(|source| ProvisionError { step: ProvisionStep::MovePointer, source })?;

        info!(
            "Provisioned period '{}' with {} categories (new tabs: budget={}, tracker={})",
            label,
            categories.len(),
            created_budget_tab,
            created_tracker_tab
        );
        Ok(ProvisionReport {
            label: label.to_string(),
            categories: categories.len(),
            created_budget_tab,
            created_tracker_tab,
        })
    }

    /// Category rows from row 2 down. Rows an earlier run left below them
    /// are overwritten with blanks.
    async fn write_categories(
        &self,
        label: &str,
        categories: &[CategoryAllocation],
        fresh_tab: bool,
    ) -> Result<(), LedgerError> {
        let existing = if fresh_tab {
            0
        } else {
            let rows = self.sheets.read(Book::Budget, &CellRange::columns(label, 0, LAST_COL)).await?;
            rows.len().saturating_sub(1)
        };

        let mut rows: Vec<Row> = categories
            .iter()
            .map(|c| vec![json!(c.name), json!(c.amount), json!(0.0), json!(c.amount)])
            .collect();
        let width = BUDGET_HEADERS.len();
        while rows.len() < existing {
            rows.push(vec![json!(""); width]);
        }
        if rows.is_empty() {
            return Ok(());
        }

        let range = CellRange::rows(label, 2, rows.len() as u32 + 1, 0, width as u32 - 1);
        self.sheets.write(Book::Budget, &range, rows).await?;
        Ok(())
    }

    /// Make sure `title` exists in `book` with a header row. Returns whether
    /// the tab was created.
    async fn ensure_tab(&self, book: Book, title: &str, headers: &[&str]) -> Result<bool, LedgerError> {
        let created = if self.sheets.sheet_exists(book, title).await? {
            false
        } else {
            self.sheets.add_sheet(book, title).await?;
            true
        };

        let header_range = CellRange::row(title, 1, 0, headers.len() as u32 - 1);
        let existing = if created { Vec::new() } else { self.sheets.read(book, &header_range).await? };
        if existing.first().is_none_or(|row| row.is_empty()) {
            let row: Row = headers.iter().map(|h| json!(h)).collect();
            self.sheets.write(book, &header_range, vec![row]).await?;
        }
        Ok(created)
    }
}

struct BudgetColumns {
    category: usize,
    allocated: usize,
    spent: usize,
    remaining: usize,
}

impl BudgetColumns {
    fn of(table: &Table) -> Result<Self, LedgerError> {
        Ok(Self {
            category: table.column(COL_CATEGORY)?,
            allocated: table.column(COL_ALLOCATED)?,
            spent: table.column(COL_SPENT)?,
            remaining: table.column(COL_REMAINING)?,
        })
    }

    fn updates(&self, sheet: &str, row: u32, spent: f64, remaining: f64) -> Vec<(CellRange, Vec<Row>)> {
        vec![
            (CellRange::cell(sheet, row, self.spent as u32), vec![vec![json!(spent)]]),
            (CellRange::cell(sheet, row, self.remaining as u32), vec![vec![json!(remaining)]]),
        ]
    }
}

/// Sum of amounts per category. Unparsable amounts count as zero.
fn spent_by_category(tracker: &Table) -> Result<HashMap<String, f64>, LedgerError> {
    let category = tracker.column(COL_CATEGORY)?;
    let amount = tracker.column(COL_AMOUNT)?;

    let mut sums: HashMap<String, f64> = HashMap::new();
    for row in &tracker.rows {
        let name = cell_str(row, category);
        if name.is_empty() {
            continue;
        }
        *sums.entry(name).or_default() += cell_f64(row, amount).unwrap_or(0.0);
    }
    Ok(sums)
}

fn budget_records(table: &Table) -> Result<Vec<CategoryBudget>, LedgerError> {
    let columns = BudgetColumns::of(table)?;
    Ok(table
        .rows
        .iter()
        .filter_map(|row| {
            let name = cell_str(row, columns.category);
            if name.is_empty() {
                return None;
            }
            Some(CategoryBudget {
                name,
                allocated: cell_f64(row, columns.allocated).unwrap_or(0.0),
                spent: cell_f64(row, columns.spent).unwrap_or(0.0),
                remaining: cell_f64(row, columns.remaining).unwrap_or(0.0),
            })
        })
        .collect())
}
