//! Offline backend replaying recorded channel history from disk.
//!
//! Layout: `{root}/{channel}/history.json` holds a JSON array of
//! [`PlatformMessage`]; media urls are paths relative to the channel folder.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;

use crate::{media_extension, ChannelClient, ChannelError, MediaPayload, PlatformMedia, PlatformMessage};

pub const DEFAULT_FIXTURE_PAGE_SIZE: usize = 20;

#[derive(Debug, Clone)]
pub struct FixtureChannelClient {
    root: PathBuf,
    page_size: usize,
    started: bool,
}

impl FixtureChannelClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            page_size: DEFAULT_FIXTURE_PAGE_SIZE,
            started: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn channel_dir(&self, channel: &str) -> PathBuf {
        self.root.join(channel)
    }

    async fn load_history(&self, channel: &str) -> Result<Vec<PlatformMessage>, ChannelError> {
        let path = self.channel_dir(channel).join("history.json");
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ChannelError::ChannelUnavailable {
                    channel: channel.to_string(),
                    reason: format!("no recorded history at {}", path.display()),
                })
            }
            Err(err) => {
                return Err(ChannelError::Transport(
                    anyhow::Error::new(err).context(format!("reading {}", path.display())),
                ))
            }
        };
        serde_json::from_slice(&bytes).map_err(|e| ChannelError::Parse {
            channel: channel.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl ChannelClient for FixtureChannelClient {
    fn backend(&self) -> &'static str {
        "fixtures"
    }

    fn is_started(&self) -> bool {
        self.started
    }

    async fn start(&mut self) -> Result<(), ChannelError> {
        if !self.root.is_dir() {
            return Err(ChannelError::Transport(anyhow::anyhow!(
                "fixture directory {} does not exist",
                self.root.display()
            )));
        }
        self.started = true;
        Ok(())
    }

    async fn fetch_history(
        &self,
        channel: &str,
        before_id: Option<i64>,
    ) -> Result<Vec<PlatformMessage>, ChannelError> {
        if !self.started {
            return Err(ChannelError::Transport(anyhow::anyhow!("fixture session not started")));
        }
        let mut messages = self.load_history(channel).await?;
        messages.retain(|m| before_id.map_or(true, |before| m.id < before));
        messages.sort_by(|a, b| b.id.cmp(&a.id));
        messages.truncate(self.page_size);
        Ok(messages)
    }

    async fn download_media(
        &self,
        channel: &str,
        message: &PlatformMessage,
    ) -> Result<MediaPayload, ChannelError> {
        let url = match &message.media {
            Some(PlatformMedia::Photo { url: Some(url) })
            | Some(PlatformMedia::Document { url: Some(url), .. }) => url,
            _ => {
                return Err(ChannelError::MediaUnavailable {
                    message_id: message.id,
                    reason: "no recorded media file".into(),
                })
            }
        };
        let path = self.channel_dir(channel).join(url);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading media {}", path.display()))
            .map_err(|e| ChannelError::MediaUnavailable {
                message_id: message.id,
                reason: format!("{e:#}"),
            })?;
        Ok(MediaPayload {
            bytes,
            extension: media_extension(Some(url), None),
        })
    }

    async fn disconnect(&mut self) -> Result<(), ChannelError> {
        self.started = false;
        Ok(())
    }
}
