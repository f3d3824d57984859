//! Decoded spreadsheet: named sheets of text cells.
//!
//! Timing software exports `.xlsx` workbooks; the browser decodes them and
//! sends the sheets as JSON. A sheet saved as CSV can be posted as-is and is
//! read here with the `csv` reader.

use serde::{Deserialize, Serialize};
use std::io::Read;

use crate::import::ImportError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<String>>,
}

impl Sheet {
    pub fn new(name: impl Into<String>, rows: Vec<Vec<String>>) -> Self {
        Self { name: name.into(), rows }
    }

    pub fn from_csv_reader<R: Read>(name: impl Into<String>, reader: R) -> Result<Self, ImportError> {
        let name = name.into();
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut rows = Vec::new();
        for record in csv_reader.records() {
            let record = record.map_err(|e| ImportError::Malformed(format!("{name}: {e}")))?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(Self { name, rows })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
}

impl Workbook {
    pub fn new(sheets: Vec<Sheet>) -> Self {
        Self { sheets }
    }

    pub fn is_empty(&self) -> bool {
        self.sheets.iter().all(|s| s.rows.is_empty())
    }
}
