//! Per-run outcome reports written under `reports/{run_id}/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tgwh_storage::{write_atomically, StagedFileRef};
use uuid::Uuid;

pub const RUN_REPORT_FILE: &str = "run_report.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Loaded,
    /// Scraped, but the channel returned nothing inside the window.
    Empty,
    /// Loaded what was read before the channel's history fetch failed.
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOutcome {
    pub channel: String,
    pub status: OutcomeStatus,
    pub messages: usize,
    pub media_downloaded: usize,
    pub rows_loaded: u64,
    pub rate_limit_waits: usize,
    pub staged_file: Option<String>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
}

impl ChannelOutcome {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            status: OutcomeStatus::Empty,
            messages: 0,
            media_downloaded: 0,
            rows_loaded: 0,
            rate_limit_waits: 0,
            staged_file: None,
            error_kind: None,
            error: None,
        }
    }

    pub fn fail(mut self, kind: &str, error: impl Into<String>) -> Self {
        self.status = OutcomeStatus::Failed;
        self.error_kind = Some(kind.to_string());
        self.error = Some(error.into());
        self
    }

    pub fn partial(mut self, kind: &str, error: impl Into<String>) -> Self {
        self.status = OutcomeStatus::Partial;
        self.error_kind = Some(kind.to_string());
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRunReport {
    pub run_id: Uuid,
    pub backend: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub channels: Vec<ChannelOutcome>,
    pub total_messages: usize,
    pub total_rows_loaded: u64,
    pub failed_channels: usize,
}

impl ScrapeRunReport {
    pub fn new(
        run_id: Uuid,
        backend: &str,
        started_at: DateTime<Utc>,
        channels: Vec<ChannelOutcome>,
    ) -> Self {
        Self {
            run_id,
            backend: backend.to_string(),
            started_at,
            finished_at: Utc::now(),
            total_messages: channels.iter().map(|c| c.messages).sum(),
            total_rows_loaded: channels.iter().map(|c| c.rows_loaded).sum(),
            failed_channels: channels
                .iter()
                .filter(|c| c.status == OutcomeStatus::Failed)
                .count(),
            channels,
        }
    }

    /// Channels that produced at least one message.
    pub fn scraped_channels(&self) -> usize {
        self.channels.iter().filter(|c| c.messages > 0).count()
    }

    pub fn outcome(&self, channel: &str) -> Option<&ChannelOutcome> {
        self.channels.iter().find(|c| c.channel == channel)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOutcome {
    pub path: String,
    pub date_folder: String,
    pub channel: String,
    pub status: OutcomeStatus,
    pub rows: u64,
    pub error_kind: Option<String>,
    pub error: Option<String>,
}

impl FileOutcome {
    pub fn loaded(file: &StagedFileRef, rows: u64) -> Self {
        Self {
            path: file.path.display().to_string(),
            date_folder: file.date_folder.clone(),
            channel: file.channel.clone(),
            status: if rows == 0 {
                OutcomeStatus::Empty
            } else {
                OutcomeStatus::Loaded
            },
            rows,
            error_kind: None,
            error: None,
        }
    }

    pub fn failed(file: &StagedFileRef, kind: &str, error: String) -> Self {
        Self {
            path: file.path.display().to_string(),
            date_folder: file.date_folder.clone(),
            channel: file.channel.clone(),
            status: OutcomeStatus::Failed,
            rows: 0,
            error_kind: Some(kind.to_string()),
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub run_id: Uuid,
    pub sink: String,
    pub date_folder: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files: Vec<FileOutcome>,
    pub total_rows: u64,
    pub loaded_files: usize,
    pub failed_files: usize,
}

impl LoadReport {
    pub fn new(
        started_at: DateTime<Utc>,
        date_folder: Option<&str>,
        sink: &str,
        files: Vec<FileOutcome>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            sink: sink.to_string(),
            date_folder: date_folder.map(ToString::to_string),
            started_at,
            finished_at: Utc::now(),
            total_rows: files.iter().map(|f| f.rows).sum(),
            loaded_files: files
                .iter()
                .filter(|f| f.status != OutcomeStatus::Failed)
                .count(),
            failed_files: files
                .iter()
                .filter(|f| f.status == OutcomeStatus::Failed)
                .count(),
            files,
        }
    }
}

/// Writes `{reports_dir}/{run_id}/run_report.json` and returns its path.
pub async fn write_run_report<T: Serialize>(
    reports_dir: &Path,
    run_id: Uuid,
    report: &T,
) -> Result<PathBuf> {
    let path = reports_dir.join(run_id.to_string()).join(RUN_REPORT_FILE);
    let bytes = serde_json::to_vec_pretty(report).context("serializing run report")?;
    write_atomically(&path, &bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrape_totals_are_derived_from_outcomes() {
        let mut ok = ChannelOutcome::new("chemed_et");
        ok.status = OutcomeStatus::Loaded;
        ok.messages = 12;
        ok.rows_loaded = 12;
        let failed = ChannelOutcome::new("private_one").fail("channel_unavailable", "private");
        let empty = ChannelOutcome::new("quiet");

        let report = ScrapeRunReport::new(Uuid::new_v4(), "fixtures", Utc::now(), vec![ok, failed, empty]);
        assert_eq!(report.total_messages, 12);
        assert_eq!(report.total_rows_loaded, 12);
        assert_eq!(report.failed_channels, 1);
        assert_eq!(report.scraped_channels(), 1);
        assert_eq!(
            report.outcome("private_one").and_then(|o| o.error_kind.as_deref()),
            Some("channel_unavailable")
        );
    }

    #[tokio::test]
    async fn report_is_written_under_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let report = LoadReport::new(Utc::now(), None, "memory", Vec::new());
        let path = write_run_report(dir.path(), report.run_id, &report).await.unwrap();
        assert_eq!(path, dir.path().join(report.run_id.to_string()).join("run_report.json"));
        let parsed: LoadReport = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed, report);
    }
}
