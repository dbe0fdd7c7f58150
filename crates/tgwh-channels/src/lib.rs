//! Channel client contracts, message extraction and media download.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tgwh_core::{MediaType, RawData, RawMessage};
use tgwh_storage::DataLake;
use thiserror::Error;
use tracing::{debug, warn};

mod fixture;
mod web;

pub use fixture::{FixtureChannelClient, DEFAULT_FIXTURE_PAGE_SIZE};
pub use web::{parse_count, parse_preview_page, PreviewPage, WebPreviewClient, DEFAULT_PREVIEW_BASE_URL};

pub const CRATE_NAME: &str = "tgwh-channels";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSender {
    pub id: i64,
}

/// Attachment as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlatformMedia {
    Photo {
        url: Option<String>,
    },
    Document {
        mime_type: Option<String>,
        file_name: Option<String>,
        url: Option<String>,
    },
    /// Web page previews, polls, stickers without a document body, etc.
    Unsupported {
        label: Option<String>,
    },
}

/// Message object as delivered by a channel backend, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformMessage {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub text: Option<String>,
    pub sender: Option<PlatformSender>,
    pub views: Option<i64>,
    pub forwards: Option<i64>,
    pub replies: Option<i64>,
    pub edit_date: Option<DateTime<Utc>>,
    pub grouped_id: Option<i64>,
    pub media: Option<PlatformMedia>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPayload {
    pub bytes: Vec<u8>,
    pub extension: String,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel {channel} is not accessible: {reason}")]
    ChannelUnavailable { channel: String, reason: String },
    #[error("rate limited; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("media for message {message_id} unavailable: {reason}")]
    MediaUnavailable { message_id: i64, reason: String },
    #[error("unreadable response for channel {channel}: {reason}")]
    Parse { channel: String, reason: String },
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl ChannelError {
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelError::ChannelUnavailable { .. } => "channel_unavailable",
            ChannelError::RateLimited { .. } => "rate_limited",
            ChannelError::MediaUnavailable { .. } => "media_unavailable",
            ChannelError::Parse { .. } => "parse",
            ChannelError::Transport(_) => "transport",
        }
    }
}

/// One platform session. Callers own the handle and pass it explicitly.
#[async_trait]
pub trait ChannelClient: Send + Sync {
    fn backend(&self) -> &'static str;

    fn is_started(&self) -> bool;

    /// Open the session; calling it on a started session is a no-op.
    async fn start(&mut self) -> Result<(), ChannelError>;

    /// One page of history strictly older than `before_id` (newest page when `None`).
    async fn fetch_history(
        &self,
        channel: &str,
        before_id: Option<i64>,
    ) -> Result<Vec<PlatformMessage>, ChannelError>;

    async fn download_media(
        &self,
        channel: &str,
        message: &PlatformMessage,
    ) -> Result<MediaPayload, ChannelError>;

    async fn disconnect(&mut self) -> Result<(), ChannelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryBounds {
    pub limit: usize,
    pub window_start: DateTime<Utc>,
}

impl HistoryBounds {
    pub fn lookback(limit: usize, days_back: i64, now: DateTime<Utc>) -> Self {
        Self {
            limit,
            window_start: now - chrono::Duration::days(days_back),
        }
    }
}

/// Lazy newest-first cursor over a channel's history.
///
/// Pages are requested only when the buffer runs dry. Iteration stops after
/// `limit` messages or at the first message older than the window start. A
/// failed page fetch leaves the cursor untouched, so `next` can be retried
/// after a rate-limit wait.
pub struct ChannelHistory<'a, C: ChannelClient + ?Sized> {
    client: &'a C,
    channel: String,
    bounds: HistoryBounds,
    buffer: VecDeque<PlatformMessage>,
    before_id: Option<i64>,
    yielded: usize,
    finished: bool,
}

impl<'a, C: ChannelClient + ?Sized> ChannelHistory<'a, C> {
    pub fn new(client: &'a C, channel: impl Into<String>, bounds: HistoryBounds) -> Self {
        Self {
            client,
            channel: channel.into(),
            bounds,
            buffer: VecDeque::new(),
            before_id: None,
            yielded: 0,
            finished: false,
        }
    }

    pub fn yielded(&self) -> usize {
        self.yielded
    }

    pub async fn next(&mut self) -> Result<Option<PlatformMessage>, ChannelError> {
        loop {
            if self.finished || self.yielded >= self.bounds.limit {
                self.finished = true;
                return Ok(None);
            }

            if let Some(message) = self.buffer.pop_front() {
                if message.date < self.bounds.window_start {
                    debug!(channel = %self.channel, message_id = message.id, "reached lookback window start");
                    self.finished = true;
                    return Ok(None);
                }
                self.yielded += 1;
                return Ok(Some(message));
            }

            let mut page = self
                .client
                .fetch_history(&self.channel, self.before_id)
                .await?;
            if let Some(before) = self.before_id {
                page.retain(|m| m.id < before);
            }
            if page.is_empty() {
                self.finished = true;
                return Ok(None);
            }
            page.sort_by(|a, b| b.date.cmp(&a.date).then(b.id.cmp(&a.id)));
            self.before_id = page.iter().map(|m| m.id).min();
            self.buffer.extend(page);
        }
    }
}

pub fn classify_media(media: &PlatformMedia) -> Option<MediaType> {
    match media {
        PlatformMedia::Photo { .. } => Some(MediaType::Photo),
        PlatformMedia::Document { mime_type, .. } => {
            let is_image = mime_type
                .as_deref()
                .is_some_and(|m| m.to_ascii_lowercase().starts_with("image/"));
            Some(if is_image {
                MediaType::Image
            } else {
                MediaType::Document
            })
        }
        PlatformMedia::Unsupported { .. } => None,
    }
}

/// Normalize a platform message. `image_path` is left empty for the downloader.
pub fn extract_message(
    message: &PlatformMessage,
    channel_name: &str,
    scraped_at: DateTime<Utc>,
) -> RawMessage {
    let media_type = message.media.as_ref().and_then(classify_media);
    RawMessage {
        message_id: message.id,
        channel_name: channel_name.to_string(),
        date: message.date,
        text: message.text.clone().unwrap_or_default(),
        sender_id: message.sender.as_ref().map(|s| s.id),
        has_media: media_type.is_some(),
        media_type,
        image_path: None,
        scraped_at,
        raw_data: RawData {
            views: message.views,
            forwards: message.forwards,
            replies: message.replies,
            edit_date: message.edit_date,
            grouped_id: message.grouped_id,
        },
    }
}

/// Persists photo/image attachments into the data lake's image tree.
#[derive(Debug, Clone)]
pub struct MediaDownloader {
    lake: DataLake,
}

impl MediaDownloader {
    pub fn new(lake: DataLake) -> Self {
        Self { lake }
    }

    /// Root-relative path of the stored file, or `None` when anything fails.
    pub async fn download<C: ChannelClient + ?Sized>(
        &self,
        client: &C,
        channel: &str,
        message: &PlatformMessage,
    ) -> Option<String> {
        let payload = match client.download_media(channel, message).await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(channel, message_id = message.id, error = %err, "failed to download media");
                return None;
            }
        };

        match self
            .lake
            .store_media(
                channel,
                message.date.date_naive(),
                message.id,
                &payload.extension,
                &payload.bytes,
            )
            .await
        {
            Ok(stored) => {
                debug!(channel, message_id = message.id, path = %stored.relative_path.display(), "downloaded media");
                Some(stored.relative_path_string())
            }
            Err(err) => {
                warn!(channel, message_id = message.id, error = %err, "failed to store media");
                None
            }
        }
    }
}

/// Best-effort MIME type from a document's file name.
pub fn mime_from_file_name(file_name: &str) -> Option<&'static str> {
    let ext = file_name.rsplit_once('.')?.1.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "zip" => "application/zip",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        "txt" => "text/plain",
        _ => return None,
    };
    Some(mime)
}

/// File extension for stored media, from the URL path or the content type.
pub fn media_extension(url: Option<&str>, content_type: Option<&str>) -> String {
    let from_url = url
        .map(|u| u.split(['?', '#']).next().unwrap_or(u))
        .and_then(|u| u.rsplit('/').next())
        .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()))
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()));
    if let Some(ext) = from_url {
        return ext;
    }
    match content_type.map(|c| c.split(';').next().unwrap_or(c).trim()) {
        Some("image/jpeg") => "jpg".into(),
        Some("image/png") => "png".into(),
        Some("image/webp") => "webp".into(),
        Some("image/gif") => "gif".into(),
        _ => "bin".into(),
    }
}
