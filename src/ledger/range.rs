//! Typed A1 ranges.

use std::fmt;

/// A rectangle on one tab. Rows are 1-based like the sheet UI; columns are
/// 0-based indices. `last_row: None` means "to the end of the tab".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellRange {
    pub sheet: String,
    pub first_row: u32,
    pub last_row: Option<u32>,
    pub first_col: u32,
    pub last_col: u32,
}

impl CellRange {
    /// Whole columns, e.g. `A:Z`.
    pub fn columns(sheet: &str, first_col: u32, last_col: u32) -> Self {
        Self { sheet: sheet.to_string(), first_row: 1, last_row: None, first_col, last_col }
    }

    /// Part of a single row.
    pub fn row(sheet: &str, row: u32, first_col: u32, last_col: u32) -> Self {
        Self { sheet: sheet.to_string(), first_row: row, last_row: Some(row), first_col, last_col }
    }

    pub fn rows(sheet: &str, first_row: u32, last_row: u32, first_col: u32, last_col: u32) -> Self {
        Self { sheet: sheet.to_string(), first_row, last_row: Some(last_row), first_col, last_col }
    }

    pub fn cell(sheet: &str, row: u32, col: u32) -> Self {
        Self::row(sheet, row, col, col)
    }

    pub fn is_single_cell(&self) -> bool {
        self.last_row == Some(self.first_row) && self.first_col == self.last_col
    }

    /// `'July'!A2:D5`, `'July'!A:Z`, `'July'!C7`. Quotes in the tab name are
    /// doubled.
    pub fn to_a1(&self) -> String {
        let sheet = format!("'{}'", self.sheet.replace('\'', "''"));
        let first = column_letter(self.first_col);
        let last = column_letter(self.last_col);

        if self.is_single_cell() {
            return format!("{sheet}!{first}{}", self.first_row);
        }
        match (self.first_row, self.last_row) {
            (1, None) => format!("{sheet}!{first}:{last}"),
            (start, None) => format!("{sheet}!{first}{start}:{last}"),
            (start, Some(end)) => format!("{sheet}!{first}{start}:{last}{end}"),
        }
    }
}

impl fmt::Display for CellRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_a1())
    }
}

/// 0 → A, 25 → Z, 26 → AA.
pub fn column_letter(index: u32) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = ((n - 1) % 26) as u8;
        letters.push((b'A' + rem) as char);
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}
