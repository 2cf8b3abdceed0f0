//! Tabular dataset flowing between pipeline steps.
//!
//! Rows are JSON records; every row carries every column, with absent cells
//! normalised to `null` so that checkpoints round-trip exactly.

use super::{Result, SieveError};
use serde_json::{Map, Value};

/// A single row keyed by column name.
pub type Record = Map<String, Value>;

/// Ordered columns over an ordered sequence of rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Record>,
}

impl Dataset {
    /// Empty dataset with the given columns.
    pub fn with_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut dataset = Self::default();
        for column in columns {
            dataset.push_column_name(column.into());
        }
        dataset
    }

    /// Build from records; columns appear in first-seen order.
    pub fn from_records(records: Vec<Record>) -> Self {
        let mut dataset = Self::default();
        for record in &records {
            for key in record.keys() {
                dataset.push_column_name(key.clone());
            }
        }
        dataset.rows = records;
        dataset.normalise_rows();
        dataset
    }

    /// Build from explicit columns and records (the checkpoint envelope).
    pub fn from_parts(columns: Vec<String>, records: Vec<Record>) -> Self {
        let mut dataset = Self::with_columns(columns);
        for record in &records {
            for key in record.keys() {
                dataset.push_column_name(key.clone());
            }
        }
        dataset.rows = records;
        dataset.normalise_rows();
        dataset
    }

    /// Build from a JSON array of objects.
    pub fn from_json_rows(value: Value) -> Result<Self> {
        let Value::Array(items) = value else {
            return Err(SieveError::InvalidInput(
                "dataset must be a JSON array of objects".to_string(),
            ));
        };

        let records = items
            .into_iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(record) => Ok(record),
                other => Err(SieveError::InvalidInput(format!(
                    "row {i} is not an object: {other}"
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::from_records(records))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<Record>) {
        (self.columns, self.rows)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// Fail with `MissingColumn` unless every name is present.
    pub fn require_columns(&self, names: &[&str]) -> Result<()> {
        match names.iter().find(|name| !self.has_column(name)) {
            Some(missing) => Err(self.missing(missing)),
            None => Ok(()),
        }
    }

    /// Borrow one column's values in row order.
    pub fn column(&self, name: &str) -> Result<Vec<&Value>> {
        self.require_columns(&[name])?;
        Ok(self
            .rows
            .iter()
            .map(|row| row.get(name).unwrap_or(&Value::Null))
            .collect())
    }

    /// Column values rendered as text; strings pass through, other values
    /// use their JSON form, nulls become empty strings.
    pub fn texts(&self, name: &str) -> Result<Vec<String>> {
        Ok(self
            .column(name)?
            .into_iter()
            .map(|value| match value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            })
            .collect())
    }

    /// Column values as numbers; any non-numeric cell is an error.
    pub fn numbers(&self, name: &str) -> Result<Vec<f64>> {
        self.column(name)?
            .into_iter()
            .enumerate()
            .map(|(i, value)| {
                value.as_f64().ok_or_else(|| {
                    SieveError::InvalidInput(format!(
                        "column '{name}' row {i}: expected a number, found {value}"
                    ))
                })
            })
            .collect()
    }

    /// Replace (or append) a whole column. The value count must match the row count.
    pub fn set_column(&mut self, name: &str, values: Vec<Value>) -> Result<()> {
        if values.len() != self.rows.len() {
            return Err(SieveError::InvalidInput(format!(
                "column '{name}' has {} values for {} rows",
                values.len(),
                self.rows.len()
            )));
        }

        self.push_column_name(name.to_string());
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.insert(name.to_string(), value);
        }
        Ok(())
    }

    /// Keep rows whose mask entry is true. Returns the number of rows removed.
    pub fn retain_rows(&mut self, mask: &[bool]) -> Result<usize> {
        if mask.len() != self.rows.len() {
            return Err(SieveError::InvalidInput(format!(
                "row mask has {} entries for {} rows",
                mask.len(),
                self.rows.len()
            )));
        }

        let before = self.rows.len();
        let mut keep = mask.iter();
        self.rows.retain(|_| keep.next().copied().unwrap_or(false));
        Ok(before - self.rows.len())
    }

    fn push_column_name(&mut self, name: String) {
        if !self.has_column(&name) {
            self.columns.push(name);
        }
    }

    fn normalise_rows(&mut self) {
        for row in &mut self.rows {
            if row.len() == self.columns.len()
                && self.columns.iter().zip(row.keys()).all(|(c, k)| c == k)
            {
                continue;
            }
            let mut ordered = Record::with_capacity(self.columns.len());
            for column in &self.columns {
                ordered.insert(column.clone(), row.remove(column).unwrap_or(Value::Null));
            }
            *row = ordered;
        }
    }

    fn missing(&self, column: &str) -> SieveError {
        SieveError::MissingColumn {
            column: column.to_string(),
            available: self.columns.clone(),
        }
    }
}
