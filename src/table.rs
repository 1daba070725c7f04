//! In-memory tabular results keyed by a composite primary key.

use ahash::AHashMap;
use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;

use crate::{Error, Result};

/// A single typed cell value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Str(String),
    Number(f64),
    Integer(i64),
    Boolean(bool),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view used by fuzzy deduplication.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Rendering used for CSV cells and group keys. Null is empty.
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Str(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Boolean(b) => b.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// One tabular result: ordered columns, a composite primary key that is a
/// prefix of those columns, and positionally indexed rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    primary_key: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>, primary_key: Vec<String>) -> Self {
        Self {
            columns,
            primary_key,
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn push_row(&mut self, row: Vec<Value>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    /// Cell lookup by row index and column name.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)
    }

    /// Concatenate another result for the same table definition.
    pub fn append(&mut self, other: Table) -> Result<()> {
        if other.columns != self.columns {
            return Err(Error::Parse(format!(
                "cannot concatenate tables with mismatched columns: {:?} vs {:?}",
                self.columns, other.columns
            )));
        }
        self.rows.extend(other.rows);
        Ok(())
    }

    /// Collapse rows reported by multiple filings into one row per
    /// underlying (entity, period, axes) key.
    ///
    /// Rows are grouped on the primary key minus `filing_name` and
    /// `publication_time` (both vary per filing for the same underlying
    /// row). Within a group, rows sort by report date, then publication
    /// time, then filing name; values forward-fill from earliest to latest
    /// so columns absent in a later amendment retain the earlier value, and
    /// the final row wins. Idempotent: merging a merged table is a no-op.
    pub fn merge_filings(&self, report_dates: &AHashMap<String, NaiveDate>) -> Table {
        let Some(filing_idx) = self.column_index("filing_name") else {
            return self.clone();
        };
        if !self.primary_key.iter().any(|c| c == "filing_name") {
            return self.clone();
        }
        let publication_idx = self.column_index("publication_time");

        let group_indices: Vec<usize> = self
            .primary_key
            .iter()
            .filter(|c| c.as_str() != "filing_name" && c.as_str() != "publication_time")
            .filter_map(|c| self.column_index(c))
            .collect();

        // Group rows preserving first-appearance order.
        let mut groups: IndexMap<Vec<String>, Vec<usize>> = IndexMap::new();
        for (i, row) in self.rows.iter().enumerate() {
            let key: Vec<String> = group_indices.iter().map(|&idx| row[idx].render()).collect();
            groups.entry(key).or_default().push(i);
        }

        let mut merged = Table::new(self.columns.clone(), self.primary_key.clone());
        for (_, mut indices) in groups {
            indices.sort_by_key(|&i| {
                let row = &self.rows[i];
                let filing = row[filing_idx].render();
                let report_date = report_dates.get(&filing).copied().unwrap_or(NaiveDate::MIN);
                let publication = publication_idx.map(|p| row[p].render()).unwrap_or_default();
                (report_date, publication, filing)
            });

            let mut acc = self.rows[indices[0]].clone();
            for &i in &indices[1..] {
                for (col, value) in self.rows[i].iter().enumerate() {
                    if !value.is_null() {
                        acc[col] = value.clone();
                    }
                }
            }
            merged.push_row(acc);
        }
        merged
    }
}
