//! On-disk dataset encodings.
//!
//! - `json`: `{"columns": [...], "rows": [...]}` envelope; round-trips empty tables
//! - `jsonl`: one record per line; an empty table reads back without columns

use crate::models::{Dataset, Record, Result, SieveError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

/// Checkpoint serialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    #[default]
    Json,
    Jsonl,
}

impl CacheType {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Jsonl => "jsonl",
        }
    }

    /// Infer from a file extension; anything but `.jsonl` is treated as JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("jsonl") => Self::Jsonl,
            _ => Self::Json,
        }
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    columns: &'a [String],
    rows: &'a [Record],
}

#[derive(Deserialize)]
struct Envelope {
    columns: Vec<String>,
    rows: Vec<Record>,
}

/// Serialize a dataset.
pub fn encode<W: Write>(dataset: &Dataset, cache_type: CacheType, mut writer: W) -> Result<()> {
    match cache_type {
        CacheType::Json => {
            let envelope = EnvelopeRef {
                columns: dataset.columns(),
                rows: dataset.rows(),
            };
            serde_json::to_writer(&mut writer, &envelope)
                .map_err(|e| SieveError::Internal(format!("Serializing dataset: {e}")))?;
        }
        CacheType::Jsonl => {
            for row in dataset.rows() {
                serde_json::to_writer(&mut writer, row)
                    .map_err(|e| SieveError::Internal(format!("Serializing row: {e}")))?;
                writer
                    .write_all(b"\n")
                    .map_err(|e| SieveError::io("writing row", e))?;
            }
        }
    }
    Ok(())
}

/// Deserialize a dataset.
///
/// JSON input may be either the envelope or a bare array of records.
pub fn decode<R: Read>(reader: R, cache_type: CacheType) -> Result<Dataset> {
    match cache_type {
        CacheType::Json => {
            let value: Value = serde_json::from_reader(BufReader::new(reader))
                .map_err(|e| SieveError::Parse(format!("Invalid JSON dataset: {e}")))?;
            match value {
                Value::Array(_) => Dataset::from_json_rows(value),
                Value::Object(ref obj) if obj.contains_key("columns") && obj.contains_key("rows") => {
                    let envelope: Envelope = serde_json::from_value(value)
                        .map_err(|e| SieveError::Parse(format!("Invalid dataset envelope: {e}")))?;
                    Ok(Dataset::from_parts(envelope.columns, envelope.rows))
                }
                _ => Err(SieveError::Parse(
                    "JSON dataset must be an array of records or a columns/rows envelope"
                        .to_string(),
                )),
            }
        }
        CacheType::Jsonl => {
            let mut records = Vec::new();
            for (line_num, line) in BufReader::new(reader).lines().enumerate() {
                let line = line.map_err(|e| SieveError::io("reading dataset line", e))?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: Record = serde_json::from_str(&line)
                    .map_err(|e| SieveError::Parse(format!("Line {}: {}", line_num + 1, e)))?;
                records.push(record);
            }
            Ok(Dataset::from_records(records))
        }
    }
}

/// Read a dataset file, choosing the encoding from its extension.
pub fn read_dataset_file(path: &Path) -> Result<Dataset> {
    let file = File::open(path).map_err(|e| SieveError::io_at("opening dataset", path, e))?;
    decode(file, CacheType::from_path(path))
}
