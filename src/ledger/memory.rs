//! In-memory [`Spreadsheet`] with per-operation failure injection and call
//! counting. Used by the unit tests and the HTTP-level tests.

use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::{BUDGET_HEADERS, Book, CONFIG_SHEET, CellRange, Row, SheetsError, Spreadsheet, TRACKER_HEADERS, WORKING_SHEET_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SheetOp {
    Read,
    Write,
    Append,
    BatchWrite,
    SheetExists,
    AddSheet,
}

#[derive(Default)]
struct State {
    tabs: HashMap<(Book, String), Vec<Row>>,
    failing: HashSet<(SheetOp, Book)>,
    counts: HashMap<(SheetOp, Book), usize>,
}

#[derive(Default)]
pub struct MemorySheets {
    state: Mutex<State>,
}

impl MemorySheets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Both books seeded with one period whose budget rows are `categories`,
    /// and `__configs` pointing at it.
    pub fn with_period(label: &str, categories: &[(&str, f64)]) -> Self {
        let sheets = Self::new();
        let mut budget: Vec<Row> = vec![BUDGET_HEADERS.iter().map(|h| json!(h)).collect()];
        budget.extend(
            categories
                .iter()
                .map(|(name, amount)| vec![json!(name), json!(amount), json!(0.0), json!(amount)]),
        );
        {
            let mut state = sheets.lock();
            state.tabs.insert((Book::Budget, label.to_string()), budget);
            state.tabs.insert(
                (Book::Tracker, label.to_string()),
                vec![TRACKER_HEADERS.iter().map(|h| json!(h)).collect()],
            );
            state.tabs.insert(
                (Book::Budget, CONFIG_SHEET.to_string()),
                vec![vec![json!(WORKING_SHEET_KEY), json!(label)]],
            );
        }
        sheets
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_tab(&self, book: Book, title: &str) {
        self.lock().tabs.entry((book, title.to_string())).or_default();
    }

    /// Replace row `row` (1-based) of a tab, creating the tab if needed.
    pub fn put_row(&self, book: Book, title: &str, row: u32, values: Row) {
        let mut state = self.lock();
        let tab = state.tabs.entry((book, title.to_string())).or_default();
        let idx = row.saturating_sub(1) as usize;
        if tab.len() <= idx {
            tab.resize(idx + 1, Vec::new());
        }
        tab[idx] = values;
    }

    /// Raw contents of a tab, empty if it does not exist.
    pub fn rows(&self, book: Book, title: &str) -> Vec<Row> {
        self.lock().tabs.get(&(book, title.to_string())).cloned().unwrap_or_default()
    }

    pub fn has_tab(&self, book: Book, title: &str) -> bool {
        self.lock().tabs.contains_key(&(book, title.to_string()))
    }

    /// Make every `op` on `book` fail until [`heal`](Self::heal).
    pub fn fail(&self, op: SheetOp, book: Book) {
        self.lock().failing.insert((op, book));
    }

    pub fn heal(&self) {
        self.lock().failing.clear();
    }

    pub fn count(&self, op: SheetOp, book: Book) -> usize {
        self.lock().counts.get(&(op, book)).copied().unwrap_or(0)
    }

    pub fn reset_counts(&self) {
        self.lock().counts.clear();
    }

    fn begin(&self, op: SheetOp, book: Book) -> Result<MutexGuard<'_, State>, SheetsError> {
        let mut state = self.lock();
        *state.counts.entry((op, book)).or_default() += 1;
        if state.failing.contains(&(op, book)) {
            return Err(SheetsError::Api { status: 503, message: format!("injected {op:?} failure") });
        }
        Ok(state)
    }
}

fn missing_tab(range: &CellRange) -> SheetsError {
    SheetsError::Api { status: 400, message: format!("Unable to parse range: {}", range.to_a1()) }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn write_into(tab: &mut Vec<Row>, range: &CellRange, rows: Vec<Row>) {
    for (r, values) in rows.into_iter().enumerate() {
        let idx = range.first_row as usize - 1 + r;
        if tab.len() <= idx {
            tab.resize(idx + 1, Vec::new());
        }
        let row = &mut tab[idx];
        for (c, value) in values.into_iter().enumerate() {
            let col = range.first_col as usize + c;
            if row.len() <= col {
                row.resize(col + 1, json!(""));
            }
            row[col] = value;
        }
    }
}

impl Spreadsheet for MemorySheets {
    async fn read(&self, book: Book, range: &CellRange) -> Result<Vec<Row>, SheetsError> {
        let state = self.begin(SheetOp::Read, book)?;
        let tab = state.tabs.get(&(book, range.sheet.clone())).ok_or_else(|| missing_tab(range))?;

        let start = range.first_row as usize - 1;
        let end = range.last_row.map(|r| r as usize).unwrap_or(tab.len()).min(tab.len());
        let mut rows: Vec<Row> = tab
            .get(start..end.max(start))
            .unwrap_or_default()
            .iter()
            .map(|row| {
                let mut cells: Row = row
                    .iter()
                    .skip(range.first_col as usize)
                    .take((range.last_col - range.first_col + 1) as usize)
                    .cloned()
                    .collect();
                while cells.last().is_some_and(is_blank) {
                    cells.pop();
                }
                cells
            })
            .collect();
        while rows.last().is_some_and(|r| r.is_empty()) {
            rows.pop();
        }
        Ok(rows)
    }

    async fn write(&self, book: Book, range: &CellRange, rows: Vec<Row>) -> Result<(), SheetsError> {
        let mut state = self.begin(SheetOp::Write, book)?;
        let tab = state.tabs.get_mut(&(book, range.sheet.clone())).ok_or_else(|| missing_tab(range))?;
        write_into(tab, range, rows);
        Ok(())
    }

    async fn append(&self, book: Book, range: &CellRange, rows: Vec<Row>) -> Result<(), SheetsError> {
        let mut state = self.begin(SheetOp::Append, book)?;
        let tab = state.tabs.get_mut(&(book, range.sheet.clone())).ok_or_else(|| missing_tab(range))?;
        while tab.last().is_some_and(|r| r.iter().all(is_blank)) {
            tab.pop();
        }
        tab.extend(rows);
        Ok(())
    }

    async fn batch_write(&self, book: Book, updates: Vec<(CellRange, Vec<Row>)>) -> Result<(), SheetsError> {
        let mut state = self.begin(SheetOp::BatchWrite, book)?;
        if let Some((range, _)) = updates.iter().find(|(r, _)| !state.tabs.contains_key(&(book, r.sheet.clone()))) {
            return Err(missing_tab(range));
        }
        for (range, rows) in updates {
            if let Some(tab) = state.tabs.get_mut(&(book, range.sheet.clone())) {
                write_into(tab, &range, rows);
            }
        }
        Ok(())
    }

    async fn sheet_exists(&self, book: Book, title: &str) -> Result<bool, SheetsError> {
        let state = self.begin(SheetOp::SheetExists, book)?;
        Ok(state.tabs.contains_key(&(book, title.to_string())))
    }

    async fn add_sheet(&self, book: Book, title: &str) -> Result<(), SheetsError> {
        let mut state = self.begin(SheetOp::AddSheet, book)?;
        let key = (book, title.to_string());
        if state.tabs.contains_key(&key) {
            return Err(SheetsError::Api {
                status: 400,
                message: format!("A sheet with the name \"{title}\" already exists"),
            });
        }
        state.tabs.insert(key, Vec::new());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_trims_like_the_api() {
        let sheets = MemorySheets::new();
        sheets.put_row(Book::Tracker, "T", 1, vec![json!("a"), json!("b"), json!("")]);
        sheets.put_row(Book::Tracker, "T", 3, vec![json!("")]);

        let rows = sheets.read(Book::Tracker, &CellRange::columns("T", 0, 25)).await.unwrap();
        assert_eq!(rows, vec![vec![json!("a"), json!("b")]]);

        let rows = sheets.read(Book::Tracker, &CellRange::columns("T", 1, 1)).await.unwrap();
        assert_eq!(rows, vec![vec![json!("b")]]);
    }

    #[tokio::test]
    async fn test_missing_tab_is_an_api_error() {
        let sheets = MemorySheets::new();
        let err = sheets.read(Book::Budget, &CellRange::columns("nope", 0, 1)).await.unwrap_err();
        assert!(matches!(err, SheetsError::Api { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_injected_failures_count_and_heal() {
        let sheets = MemorySheets::with_period("July", &[("A", 1.0)]);
        sheets.fail(SheetOp::Append, Book::Tracker);
        let range = CellRange::columns("July", 0, 3);
        assert!(sheets.append(Book::Tracker, &range, vec![vec![json!("A")]]).await.is_err());
        assert_eq!(sheets.rows(Book::Tracker, "July").len(), 1);

        sheets.heal();
        sheets.append(Book::Tracker, &range, vec![vec![json!("A")]]).await.unwrap();
        assert_eq!(sheets.rows(Book::Tracker, "July").len(), 2);
        assert_eq!(sheets.count(SheetOp::Append, Book::Tracker), 2);
    }
}
