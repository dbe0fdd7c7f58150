//! Data lake storage + HTTP fetch utilities for the channel warehouse.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tgwh_core::{
    DataLakeSummary, DateRange, ImageRecord, RawMessage, StagedFileId, DATE_FOLDER_FORMAT,
    IMAGES_DIR, MESSAGES_DIR,
};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tgwh-storage";

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

/// Result of writing one staged (date, channel) snapshot.
#[derive(Debug, Clone)]
pub struct StagedWrite {
    pub id: StagedFileId,
    pub absolute_path: PathBuf,
    pub message_count: usize,
    pub byte_size: usize,
}

/// A staged file found on disk. Names only; contents are not read.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StagedFileRef {
    pub date_folder: String,
    pub channel: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StoredMedia {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

impl StoredMedia {
    /// Root-relative path with forward slashes, as recorded in `image_path`.
    pub fn relative_path_string(&self) -> String {
        to_slash_path(&self.relative_path)
    }
}

/// File-based staging area: `telegram_messages/{date}/{channel}.json` plus
/// `images/{channel}/{date}/...`.
#[derive(Debug, Clone)]
pub struct DataLake {
    root: PathBuf,
}

impl DataLake {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn messages_dir(&self) -> PathBuf {
        self.root.join(MESSAGES_DIR)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join(IMAGES_DIR)
    }

    pub fn staged_path(&self, id: &StagedFileId) -> PathBuf {
        self.root.join(id.relative_path())
    }

    /// Replace the (date, channel) snapshot with `messages` as one JSON array.
    pub async fn write_channel_batch(
        &self,
        channel: &str,
        date: NaiveDate,
        messages: &[RawMessage],
    ) -> anyhow::Result<StagedWrite> {
        let id = StagedFileId::new(date, channel);
        let absolute_path = self.staged_path(&id);
        let bytes = serde_json::to_vec_pretty(messages)
            .with_context(|| format!("serializing {} messages for {channel}", messages.len()))?;
        write_atomically(&absolute_path, &bytes).await?;
        info!(
            channel,
            path = %absolute_path.display(),
            messages = messages.len(),
            "staged channel batch"
        );
        Ok(StagedWrite {
            id,
            absolute_path,
            message_count: messages.len(),
            byte_size: bytes.len(),
        })
    }

    pub fn media_relative_path(
        &self,
        channel: &str,
        date: NaiveDate,
        message_id: i64,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        let short_hash = &content_hash[..content_hash.len().min(12)];
        PathBuf::from(IMAGES_DIR)
            .join(channel)
            .join(date.format(DATE_FOLDER_FORMAT).to_string())
            .join(format!("{message_id}_{short_hash}.{ext}"))
    }

    /// Store media bytes under a hash-suffixed name; identical payloads reuse the file.
    pub async fn store_media(
        &self,
        channel: &str,
        date: NaiveDate,
        message_id: i64,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredMedia> {
        let content_hash = sha256_hex(bytes);
        let relative_path =
            self.media_relative_path(channel, date, message_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking media path {}", absolute_path.display()))?
        {
            return Ok(StoredMedia {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        write_atomically(&absolute_path, bytes).await?;
        debug!(path = %absolute_path.display(), bytes = bytes.len(), "stored media");
        Ok(StoredMedia {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }

    /// Staged files across all date folders, or within `date_folder` only.
    pub fn staged_files(&self, date_folder: Option<&str>) -> anyhow::Result<Vec<StagedFileRef>> {
        let messages_dir = self.messages_dir();
        if !messages_dir.exists() {
            warn!(path = %messages_dir.display(), "data lake path does not exist");
            return Ok(Vec::new());
        }

        let folders = match date_folder {
            Some(name) => vec![messages_dir.join(name)],
            None => list_subdirs(&messages_dir)?,
        };

        let mut out = Vec::new();
        for folder in folders {
            if !folder.is_dir() {
                warn!(path = %folder.display(), "date folder does not exist");
                continue;
            }
            let date_folder = file_name_string(&folder);
            for path in list_files_with_extension(&folder, &["json"])? {
                out.push(StagedFileRef {
                    date_folder: date_folder.clone(),
                    channel: file_stem_string(&path),
                    path,
                });
            }
        }
        out.sort();
        Ok(out)
    }

    /// Inventory by folder and file names. Files inside folders whose names are
    /// not `YYYY-MM-DD` dates are not counted.
    pub fn summarize(&self) -> anyhow::Result<DataLakeSummary> {
        let mut summary = DataLakeSummary::default();
        let messages_dir = self.messages_dir();
        if !messages_dir.exists() {
            return Ok(summary);
        }

        let folders = list_subdirs(&messages_dir)?;
        summary.total_date_folders = folders.len();

        let mut channels = BTreeSet::new();
        let mut dates = Vec::new();
        for folder in &folders {
            let name = file_name_string(folder);
            summary.date_folders.push(name.clone());
            let Ok(date) = NaiveDate::parse_from_str(&name, DATE_FOLDER_FORMAT) else {
                continue;
            };
            dates.push(date);

            let files = list_files_with_extension(folder, &["json"])?;
            summary.total_json_files += files.len();
            channels.extend(files.iter().map(|p| file_stem_string(p)));
        }

        summary.channels = channels.into_iter().collect();
        summary.date_range = DateRange {
            earliest: dates
                .iter()
                .min()
                .map(|d| d.format(DATE_FOLDER_FORMAT).to_string()),
            latest: dates
                .iter()
                .max()
                .map(|d| d.format(DATE_FOLDER_FORMAT).to_string()),
        };
        Ok(summary)
    }

    /// Images under `images/{channel}/{date}/`, optionally limited to one date folder.
    pub fn scan_images(&self, date_folder: Option<&str>) -> anyhow::Result<Vec<ImageRecord>> {
        let images_dir = self.images_dir();
        if !images_dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for channel_dir in list_subdirs(&images_dir)? {
            let channel_name = file_name_string(&channel_dir);
            for date_dir in list_subdirs(&channel_dir)? {
                let date = file_name_string(&date_dir);
                if date_folder.is_some_and(|wanted| wanted != date) {
                    continue;
                }
                for image_path in list_files_with_extension(&date_dir, &IMAGE_EXTENSIONS)? {
                    records.push(ImageRecord {
                        channel_name: channel_name.clone(),
                        date: date.clone(),
                        image_path,
                    });
                }
            }
        }
        info!(images = records.len(), "scanned data lake images");
        Ok(records)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn to_slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Write through a temp file in the target directory, then rename over the target.
pub async fn write_atomically(target: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = target
        .parent()
        .with_context(|| format!("{} has no parent directory", target.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp file {} -> {}",
                temp_path.display(),
                target.display()
            )
        });
    }
    Ok(())
}

fn list_subdirs(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut dirs = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect::<Vec<_>>();
    dirs.sort();
    Ok(dirs)
}

fn list_files_with_extension(dir: &Path, extensions: &[&str]) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| extensions.iter().any(|want| e.eq_ignore_ascii_case(want)))
        })
        .collect::<Vec<_>>();
    files.sort();
    Ok(files)
}

fn file_name_string(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn file_stem_string(path: &Path) -> String {
    path.file_stem()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Applied when a throttling response carries no usable `Retry-After`.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    Throttled,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Throttled
    } else if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn parse_retry_after(headers: &HeaderMap) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

/// Doubling delay between retries of a failed page or media request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    /// Retries after the first attempt; 0 disables retrying.
    pub retries: u32,
    pub first_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            retries: 3,
            first_delay: Duration::from_millis(250),
            ceiling: Duration::from_secs(5),
        }
    }
}

impl RetryBackoff {
    pub fn none() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    /// Wait before retry number `retry` (0-based).
    pub fn delay_before(&self, retry: u32) -> Duration {
        let doubled = 2u32
            .checked_pow(retry)
            .map_or(self.ceiling, |factor| self.first_delay.saturating_mul(factor));
        doubled.min(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryBackoff,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryBackoff::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("rate limited by {url}; retry after {retry_after:?}")]
    RateLimited { url: String, retry_after: Duration },
}

/// Retrying GET client. Server errors and connect failures back off and retry;
/// throttling is surfaced as [`FetchError::RateLimited`] for the caller to honor.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryBackoff,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub async fn fetch_bytes(&self, label: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = tracing::info_span!("http_fetch", label, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let content_type = resp
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(ToString::to_string);
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            content_type,
                            body,
                        });
                    }

                    match classify_status(status) {
                        RetryDisposition::Throttled => {
                            return Err(FetchError::RateLimited {
                                url: final_url,
                                retry_after: parse_retry_after(resp.headers()),
                            });
                        }
                        RetryDisposition::Retryable if attempt < self.retry.retries => {
                            debug!(attempt, %status, "retrying server error");
                            tokio::time::sleep(self.retry.delay_before(attempt)).await;
                            attempt += 1;
                        }
                        _ => {
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                            });
                        }
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.retry.retries
                    {
                        debug!(attempt, error = %err, "retrying request");
                        tokio::time::sleep(self.retry.delay_before(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

/// Today's date folder in UTC.
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::header::HeaderValue;
    use tempfile::tempdir;
    use tgwh_core::{MediaType, RawData};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn message(id: i64, text: &str) -> RawMessage {
        let at = Utc.with_ymd_and_hms(2025, 2, 3, 8, 0, 0).single().unwrap();
        RawMessage {
            message_id: id,
            channel_name: "lobelia4cosmetics".into(),
            date: at,
            text: text.into(),
            sender_id: Some(7),
            has_media: true,
            media_type: Some(MediaType::Photo),
            image_path: Some("images/lobelia4cosmetics/2025-02-03/1_abc.jpg".into()),
            scraped_at: at,
            raw_data: RawData {
                views: Some(120),
                ..Default::default()
            },
        }
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FOLDER_FORMAT).unwrap()
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn rewriting_a_channel_day_replaces_the_snapshot() {
        let dir = tempdir().expect("tempdir");
        let lake = DataLake::new(dir.path());

        let first = lake
            .write_channel_batch("lobelia4cosmetics", date("2025-02-03"), &[message(1, "a"), message(2, "b")])
            .await
            .expect("first write");
        let second = lake
            .write_channel_batch("lobelia4cosmetics", date("2025-02-03"), &[message(3, "c")])
            .await
            .expect("second write");

        assert_eq!(first.absolute_path, second.absolute_path);
        let text = std::fs::read_to_string(&second.absolute_path).unwrap();
        let parsed: Vec<RawMessage> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].message_id, 3);

        let leftovers = std::fs::read_dir(second.absolute_path.parent().unwrap())
            .unwrap()
            .count();
        assert_eq!(leftovers, 1, "temp files must not remain");
    }

    #[tokio::test]
    async fn non_ascii_text_is_written_literally() {
        let dir = tempdir().expect("tempdir");
        let lake = DataLake::new(dir.path());
        let write = lake
            .write_channel_batch("tikvahpharma", date("2025-02-03"), &[message(1, "መድሃኒት 💊")])
            .await
            .unwrap();
        let text = std::fs::read_to_string(write.absolute_path).unwrap();
        assert!(text.contains("መድሃኒት 💊"));
        assert!(!text.contains("\\u"));
    }

    #[tokio::test]
    async fn media_with_identical_bytes_is_deduplicated() {
        let dir = tempdir().expect("tempdir");
        let lake = DataLake::new(dir.path());
        let first = lake
            .store_media("chemed_et", date("2025-02-03"), 10, "jpg", b"\xff\xd8jpeg")
            .await
            .unwrap();
        let second = lake
            .store_media("chemed_et", date("2025-02-03"), 10, ".jpg", b"\xff\xd8jpeg")
            .await
            .unwrap();

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert!(first.absolute_path.exists());
        assert!(first
            .relative_path_string()
            .starts_with("images/chemed_et/2025-02-03/10_"));
        assert!(first.relative_path_string().ends_with(".jpg"));
    }

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"[]").unwrap();
    }

    #[test]
    fn staged_files_can_be_filtered_to_one_date_folder() {
        let dir = tempdir().unwrap();
        let lake = DataLake::new(dir.path());
        touch(&lake.messages_dir().join("2025-01-01/chemed_et.json"));
        touch(&lake.messages_dir().join("2025-01-02/chemed_et.json"));
        touch(&lake.messages_dir().join("2025-01-02/tikvahpharma.json"));
        touch(&lake.messages_dir().join("2025-01-02/notes.txt"));

        let all = lake.staged_files(None).unwrap();
        assert_eq!(all.len(), 3);

        let one = lake.staged_files(Some("2025-01-02")).unwrap();
        assert_eq!(
            one.iter().map(|f| f.channel.as_str()).collect::<Vec<_>>(),
            vec!["chemed_et", "tikvahpharma"]
        );
        assert!(lake.staged_files(Some("1999-01-01")).unwrap().is_empty());
    }

    #[test]
    fn summary_reads_names_only() {
        let dir = tempdir().unwrap();
        let lake = DataLake::new(dir.path());
        let messages = lake.messages_dir();
        std::fs::create_dir_all(messages.join("2025-01-03")).unwrap();
        std::fs::write(messages.join("2025-01-03/chemed_et.json"), b"not json at all").unwrap();
        touch(&messages.join("2025-01-01/tikvahpharma.json"));
        touch(&messages.join("2025-01-01/chemed_et.json"));
        touch(&messages.join("scratch/ignored.json"));

        let summary = lake.summarize().unwrap();
        assert_eq!(summary.total_date_folders, 3);
        assert_eq!(summary.total_json_files, 3);
        assert_eq!(summary.channels, vec!["chemed_et", "tikvahpharma"]);
        assert_eq!(summary.date_range.earliest.as_deref(), Some("2025-01-01"));
        assert_eq!(summary.date_range.latest.as_deref(), Some("2025-01-03"));
    }

    #[test]
    fn summary_of_missing_lake_is_empty() {
        let dir = tempdir().unwrap();
        let summary = DataLake::new(dir.path().join("absent")).summarize().unwrap();
        assert_eq!(summary, DataLakeSummary::default());
    }

    #[test]
    fn image_scan_lists_images_per_channel_and_date() {
        let dir = tempdir().unwrap();
        let lake = DataLake::new(dir.path());
        touch(&lake.images_dir().join("chemed_et/2025-01-01/1_a.jpg"));
        touch(&lake.images_dir().join("chemed_et/2025-01-02/2_b.png"));
        touch(&lake.images_dir().join("chemed_et/2025-01-02/readme.md"));

        let all = lake.scan_images(None).unwrap();
        assert_eq!(all.len(), 2);
        let one = lake.scan_images(Some("2025-01-02")).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].channel_name, "chemed_et");
        assert_eq!(one[0].date, "2025-01-02");
    }

    #[test]
    fn retry_delay_doubles_up_to_the_ceiling() {
        let retry = RetryBackoff {
            retries: 4,
            first_delay: Duration::from_millis(40),
            ceiling: Duration::from_millis(100),
        };
        let delays: Vec<_> = (0..4).map(|n| retry.delay_before(n)).collect();
        assert_eq!(
            delays,
            [40, 80, 100, 100].map(Duration::from_millis).to_vec()
        );
        assert_eq!(retry.delay_before(40), Duration::from_millis(100));
    }

    fn quick_retries(retries: u32) -> HttpClientConfig {
        HttpClientConfig {
            retry: RetryBackoff {
                retries,
                first_delay: Duration::from_millis(1),
                ceiling: Duration::from_millis(5),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn media_fetch_retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file/1042.jpg"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/file/1042.jpg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(b"\xff\xd8jpeg".to_vec()),
            )
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(quick_retries(3)).unwrap();
        let fetched = fetcher
            .fetch_bytes("media", &format!("{}/file/1042.jpg", server.uri()))
            .await
            .unwrap();
        assert_eq!(fetched.body, b"\xff\xd8jpeg");
        assert_eq!(fetched.content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn media_fetch_gives_up_after_configured_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(quick_retries(1)).unwrap();
        let err = fetcher
            .fetch_bytes("media", &format!("{}/file/7.png", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 502, .. }));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);

        let no_retry = HttpFetcher::new(HttpClientConfig {
            retry: RetryBackoff::none(),
            ..Default::default()
        })
        .unwrap();
        assert!(no_retry
            .fetch_bytes("media", &format!("{}/file/8.png", server.uri()))
            .await
            .is_err());
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[test]
    fn throttling_is_not_retried_in_place() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Throttled);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn retry_after_header_falls_back_to_default() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), DEFAULT_RETRY_AFTER);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("17"));
        assert_eq!(parse_retry_after(&headers), Duration::from_secs(17));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&headers), DEFAULT_RETRY_AFTER);
    }
}
