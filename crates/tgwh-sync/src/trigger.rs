//! Staging-directory change detection.
//!
//! The cursor is persisted before the run request is handed out. A request
//! lost after that point is never re-emitted for the same files: delivery is
//! at most once.

use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{Context, Result};
use tgwh_storage::write_atomically;
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info};

use crate::config::MIN_TRIGGER_POLL;

pub const CURSOR_FILE: &str = "trigger_cursor";

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerDecision {
    RunRequest { run_key: String, cursor: f64 },
    Skip { reason: String },
}

pub fn run_key_for(cursor: f64) -> String {
    format!("new_file_{cursor}")
}

/// Largest mtime strictly newer than `last`, if any.
pub fn next_cursor(last: Option<f64>, mtimes: impl IntoIterator<Item = f64>) -> Option<f64> {
    mtimes
        .into_iter()
        .filter(|m| last.map_or(true, |cursor| *m > cursor))
        .fold(None, |max: Option<f64>, m| Some(max.map_or(m, |x| x.max(m))))
}

/// Modification times (seconds since epoch) of every `*.json` under `dir`.
pub fn scan_mtimes(dir: &Path) -> Result<Vec<f64>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = std::fs::read_dir(&current)
            .with_context(|| format!("reading {}", current.display()))?;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "json") {
                let modified = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .with_context(|| format!("reading mtime of {}", path.display()))?;
                let secs = modified
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0);
                out.push(secs);
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct DirectoryTrigger {
    watch_dir: PathBuf,
    cursor_path: PathBuf,
}

impl DirectoryTrigger {
    pub fn new(watch_dir: impl Into<PathBuf>, state_dir: impl AsRef<Path>) -> Self {
        Self {
            watch_dir: watch_dir.into(),
            cursor_path: state_dir.as_ref().join(CURSOR_FILE),
        }
    }

    pub fn watch_dir(&self) -> &Path {
        &self.watch_dir
    }

    pub fn load_cursor(&self) -> Result<Option<f64>> {
        match std::fs::read_to_string(&self.cursor_path) {
            Ok(text) => text
                .trim()
                .parse::<f64>()
                .map(Some)
                .with_context(|| format!("parsing cursor in {}", self.cursor_path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", self.cursor_path.display())),
        }
    }

    async fn store_cursor(&self, cursor: f64) -> Result<()> {
        write_atomically(&self.cursor_path, cursor.to_string().as_bytes()).await
    }

    pub async fn poll(&self) -> Result<TriggerDecision> {
        let last = self.load_cursor()?;
        let mtimes = scan_mtimes(&self.watch_dir)?;
        match next_cursor(last, mtimes) {
            Some(cursor) => {
                self.store_cursor(cursor).await?;
                let run_key = run_key_for(cursor);
                info!(run_key, "new staged data detected");
                Ok(TriggerDecision::RunRequest { run_key, cursor })
            }
            None => {
                debug!(cursor = ?last, "no new data");
                Ok(TriggerDecision::Skip {
                    reason: "No new data".to_string(),
                })
            }
        }
    }
}

/// Consumer-side dedup of run requests. Cursors only grow, so the last
/// admitted one is enough to reject repeats and stale requests.
#[derive(Debug, Default)]
pub struct RunLedger {
    last: Option<f64>,
}

impl RunLedger {
    /// True when `cursor` is newer than every cursor admitted so far.
    pub fn admit(&mut self, cursor: f64) -> bool {
        if self.last.is_some_and(|last| cursor <= last) {
            return false;
        }
        self.last = Some(cursor);
        true
    }

    pub fn last_run_key(&self) -> Option<String> {
        self.last.map(run_key_for)
    }
}

/// Starts a repeated poll job; run requests arrive on the returned channel.
/// Intervals under a minute are raised to one minute.
pub async fn spawn_watch(
    trigger: DirectoryTrigger,
    interval: Duration,
) -> Result<(JobScheduler, mpsc::Receiver<TriggerDecision>)> {
    let interval = interval.max(MIN_TRIGGER_POLL);
    let (tx, rx) = mpsc::channel(16);

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_repeated_async(interval, move |_uuid, _l| {
        let trigger = trigger.clone();
        let tx = tx.clone();
        Box::pin(async move {
            match trigger.poll().await {
                Ok(decision @ TriggerDecision::RunRequest { .. }) => {
                    if tx.send(decision).await.is_err() {
                        error!("run request dropped: watch consumer has stopped");
                    }
                }
                Ok(TriggerDecision::Skip { .. }) => {}
                Err(err) => error!(error = %format!("{err:#}"), "trigger poll failed"),
            }
        })
    })
    .with_context(|| format!("creating poll job every {interval:?}"))?;
    sched.add(job).await.context("adding poll job")?;
    sched.start().await.context("starting scheduler")?;
    info!(?interval, "directory watch started");
    Ok((sched, rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::SystemTime;
    use tempfile::tempdir;

    #[test]
    fn exactly_one_signal_for_newer_maximum() {
        assert_eq!(next_cursor(Some(12.0), [10.0, 20.0, 15.0]), Some(20.0));
        assert_eq!(run_key_for(20.0), "new_file_20");
        assert_eq!(next_cursor(Some(20.0), [10.0, 20.0, 15.0]), None);
        assert_eq!(next_cursor(None, [10.0, 20.0, 15.0]), Some(20.0));
        assert_eq!(next_cursor(None, []), None);
    }

    fn touch(path: &Path, secs: u64) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let file = File::create(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    #[tokio::test]
    async fn poll_advances_cursor_once_per_new_maximum() {
        let dir = tempdir().unwrap();
        let watch = dir.path().join("telegram_messages");
        let state = dir.path().join("state");
        touch(&watch.join("2025-01-01/a.json"), 1_000);
        touch(&watch.join("2025-01-02/b.json"), 2_000);
        touch(&watch.join("2025-01-02/notes.txt"), 9_000);
        std::fs::create_dir_all(&state).unwrap();
        std::fs::write(state.join(CURSOR_FILE), "1200").unwrap();

        let trigger = DirectoryTrigger::new(&watch, &state);
        assert_eq!(
            trigger.poll().await.unwrap(),
            TriggerDecision::RunRequest {
                run_key: "new_file_2000".into(),
                cursor: 2000.0
            }
        );
        assert_eq!(trigger.load_cursor().unwrap(), Some(2000.0));
        assert!(matches!(trigger.poll().await.unwrap(), TriggerDecision::Skip { .. }));

        touch(&watch.join("2025-01-03/c.json"), 3_000);
        assert!(matches!(
            trigger.poll().await.unwrap(),
            TriggerDecision::RunRequest { cursor, .. } if cursor == 3000.0
        ));
    }

    #[tokio::test]
    async fn missing_directory_is_no_new_data() {
        let dir = tempdir().unwrap();
        let trigger = DirectoryTrigger::new(dir.path().join("absent"), dir.path());
        assert!(matches!(trigger.poll().await.unwrap(), TriggerDecision::Skip { .. }));
        assert_eq!(trigger.load_cursor().unwrap(), None);
    }

    #[test]
    fn ledger_admits_only_newer_cursors() {
        let mut ledger = RunLedger::default();
        assert!(ledger.admit(20.0));
        assert!(!ledger.admit(20.0));
        assert!(!ledger.admit(15.0));
        assert!(ledger.admit(30.0));
        assert_eq!(ledger.last_run_key().as_deref(), Some("new_file_30"));
    }
}
