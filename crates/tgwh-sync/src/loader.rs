//! Staged JSON → warehouse bulk loader.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use tgwh_core::{DataLakeSummary, DetectionRecord, RawMessage};
use tgwh_storage::{DataLake, StagedFileRef};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};

use crate::report::{FileOutcome, LoadReport};
use crate::warehouse::{RawSink, WarehouseRow};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{path}: record {index}: {reason}")]
    InvalidRecord {
        path: PathBuf,
        index: usize,
        reason: String,
    },
    #[error("writing rows from {path}: {source:#}")]
    Sink {
        path: PathBuf,
        source: anyhow::Error,
    },
}

impl LoadError {
    pub fn kind(&self) -> &'static str {
        match self {
            LoadError::Read { .. } => "read",
            LoadError::Json { .. } => "json",
            LoadError::InvalidRecord { .. } => "invalid_record",
            LoadError::Sink { .. } => "sink",
        }
    }
}

/// Accepts RFC 3339 and `YYYY-MM-DD HH:MM:SS[.f][±HH:MM]`; offset-less values are UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z", "%Y-%m-%dT%H:%M:%S%.f%z"] {
        if let Ok(parsed) = DateTime::parse_from_str(raw, format) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(parsed.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

fn field<'a>(object: &'a serde_json::Map<String, Value>, name: &str) -> Option<&'a Value> {
    object.get(name).filter(|v| !v.is_null())
}

fn integer_field(object: &serde_json::Map<String, Value>, name: &str) -> Result<Option<i64>, String> {
    match field(object, name) {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .map(Some)
            .ok_or_else(|| format!("{name} is not an integer")),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| format!("{name} is not an integer")),
        Some(_) => Err(format!("{name} is not an integer")),
    }
}

fn string_field(object: &serde_json::Map<String, Value>, name: &str) -> Option<String> {
    match field(object, name)? {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn timestamp_field(
    object: &serde_json::Map<String, Value>,
    name: &str,
) -> Result<Option<DateTime<Utc>>, String> {
    match field(object, name) {
        None => Ok(None),
        Some(Value::String(s)) => parse_timestamp(s)
            .map(Some)
            .ok_or_else(|| format!("{name} {s:?} is not a timestamp")),
        Some(other) => Err(format!("{name} {other} is not a timestamp")),
    }
}

/// Coerces one staged JSON object into a warehouse row.
pub fn row_from_value(value: &Value) -> Result<WarehouseRow, String> {
    let object = value.as_object().ok_or("record is not an object")?;

    let message_id = integer_field(object, "message_id")?.ok_or("missing message_id")?;
    let channel_name = string_field(object, "channel_name").ok_or("missing channel_name")?;
    let date = timestamp_field(object, "date")?.ok_or("missing date")?;
    let has_media = match field(object, "has_media") {
        None => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        Some(other) => return Err(format!("has_media {other} is not a boolean")),
    };
    let raw_data = match field(object, "raw_data") {
        None => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(structured) => Some(structured.to_string()),
    };

    Ok(WarehouseRow {
        message_id,
        channel_name,
        date,
        text: string_field(object, "text"),
        sender_id: integer_field(object, "sender_id")?,
        has_media,
        media_type: string_field(object, "media_type"),
        image_path: string_field(object, "image_path"),
        scraped_at: timestamp_field(object, "scraped_at")?,
        raw_data,
    })
}

/// Reads staged files from the data lake and appends them to a sink.
#[derive(Clone)]
pub struct BulkLoader {
    lake: DataLake,
    sink: Arc<dyn RawSink>,
    batch_size: usize,
}

impl BulkLoader {
    pub fn new(lake: DataLake, sink: Arc<dyn RawSink>) -> Self {
        Self {
            lake,
            sink,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn lake(&self) -> &DataLake {
        &self.lake
    }

    pub fn sink_name(&self) -> &'static str {
        self.sink.name()
    }

    /// Loads every staged file, or only those under one date folder. Failing
    /// files are logged and recorded; they never stop the remaining files.
    pub async fn load_all(&self, date_folder: Option<&str>) -> Result<LoadReport> {
        let started_at = Utc::now();
        let staged = self.lake.staged_files(date_folder)?;
        info!(files = staged.len(), date_folder, sink = self.sink.name(), "loading staged files");

        let mut files = Vec::with_capacity(staged.len());
        for file in &staged {
            let span = info_span!("load_file", path = %file.path.display());
            let outcome = match self.load_file(&file.path).instrument(span).await {
                Ok(rows) => {
                    info!(path = %file.path.display(), rows, "loaded staged file");
                    FileOutcome::loaded(file, rows)
                }
                Err(err) => {
                    error!(path = %file.path.display(), kind = err.kind(), error = %err, "failed to load staged file");
                    FileOutcome::failed(file, err.kind(), err.to_string())
                }
            };
            files.push(outcome);
        }

        let report = LoadReport::new(started_at, date_folder, self.sink.name(), files);
        info!(
            total_rows = report.total_rows,
            loaded_files = report.loaded_files,
            failed_files = report.failed_files,
            "load finished"
        );
        Ok(report)
    }

    /// One staged file, in a single sink call. Returns rows appended.
    pub async fn load_file(&self, path: &Path) -> Result<u64, LoadError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| LoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let records: Vec<Value> = serde_json::from_slice(&bytes).map_err(|source| LoadError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        if records.is_empty() {
            warn!(path = %path.display(), "no data found in staged file");
            return Ok(0);
        }

        let rows = records
            .iter()
            .enumerate()
            .map(|(index, value)| {
                row_from_value(value).map_err(|reason| LoadError::InvalidRecord {
                    path: path.to_path_buf(),
                    index,
                    reason,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.sink
            .append_messages(&rows, self.batch_size)
            .await
            .map_err(|source| LoadError::Sink {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Appends an in-memory batch, as produced by a scrape.
    pub async fn load_messages(&self, messages: &[RawMessage]) -> Result<u64> {
        let rows = messages
            .iter()
            .map(WarehouseRow::from_message)
            .collect::<Result<Vec<_>>>()?;
        self.sink.append_messages(&rows, self.batch_size).await
    }

    /// Appends a JSON array of detection records produced by the detector.
    pub async fn load_detections_file(&self, path: &Path) -> Result<u64> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let records: Vec<DetectionRecord> = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", path.display()))?;
        let rows = self.sink.append_detections(&records, self.batch_size).await?;
        info!(path = %path.display(), rows, "saved detections");
        Ok(rows)
    }

    pub fn summarize(&self) -> Result<DataLakeSummary> {
        self.lake.summarize()
    }

    pub fn staged_files(&self, date_folder: Option<&str>) -> Result<Vec<StagedFileRef>> {
        self.lake.staged_files(date_folder)
    }
}
