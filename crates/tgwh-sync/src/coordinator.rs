//! Sequential channel scrape: history → extract → media → stage → load.

use chrono::{NaiveDate, Utc};
use tgwh_channels::{
    extract_message, ChannelClient, ChannelError, ChannelHistory, HistoryBounds, MediaDownloader,
};
use tgwh_core::RawMessage;
use tgwh_storage::DataLake;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ScrapePacing;
use crate::loader::BulkLoader;
use crate::report::{ChannelOutcome, OutcomeStatus, ScrapeRunReport};

/// Messages gathered before the history ran out or a fetch failed. An
/// `interrupted` scrape still carries what was read up to the failure.
struct ScrapedChannel {
    messages: Vec<RawMessage>,
    media_downloaded: usize,
    rate_limit_waits: usize,
    interrupted: Option<ChannelError>,
}

pub struct ScrapeCoordinator {
    lake: DataLake,
    downloader: MediaDownloader,
    loader: BulkLoader,
    pacing: ScrapePacing,
}

impl ScrapeCoordinator {
    pub fn new(loader: BulkLoader, pacing: ScrapePacing) -> Self {
        let lake = loader.lake().clone();
        Self {
            downloader: MediaDownloader::new(lake.clone()),
            lake,
            loader,
            pacing,
        }
    }

    pub fn pacing(&self) -> &ScrapePacing {
        &self.pacing
    }

    /// Scrapes `channels` one after another over a single session, staging
    /// under today's date folder. Per-channel failures end up in the report.
    pub async fn run<C: ChannelClient + ?Sized>(
        &self,
        client: &mut C,
        channels: &[String],
    ) -> ScrapeRunReport {
        self.run_for_date(client, channels, tgwh_storage::today()).await
    }

    pub async fn run_for_date<C: ChannelClient + ?Sized>(
        &self,
        client: &mut C,
        channels: &[String],
        stage_date: NaiveDate,
    ) -> ScrapeRunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, backend = client.backend(), channels = channels.len(), "starting scrape run");

        let mut outcomes = Vec::with_capacity(channels.len());
        for channel in channels {
            let span = info_span!("scrape_channel", channel = %channel);
            let outcome = self
                .process_channel(client, channel, stage_date)
                .instrument(span)
                .await;
            outcomes.push(outcome);
            tokio::time::sleep(self.pacing.channel_pause).await;
        }

        if let Err(err) = client.disconnect().await {
            warn!(error = %err, "failed to disconnect channel session");
        }

        let report = ScrapeRunReport::new(run_id, client.backend(), started_at, outcomes);
        info!(
            %run_id,
            total_messages = report.total_messages,
            total_rows_loaded = report.total_rows_loaded,
            scraped_channels = report.scraped_channels(),
            failed_channels = report.failed_channels,
            "finished scraping all channels"
        );
        report
    }

    async fn process_channel<C: ChannelClient + ?Sized>(
        &self,
        client: &mut C,
        channel: &str,
        stage_date: NaiveDate,
    ) -> ChannelOutcome {
        let mut outcome = ChannelOutcome::new(channel);

        if let Err(err) = client.start().await {
            error!(channel, error = %err, "failed to start channel session");
            return outcome.fail(err.kind(), err.to_string());
        }

        let scraped = self.scrape_channel(&*client, channel).await;
        outcome.messages = scraped.messages.len();
        outcome.media_downloaded = scraped.media_downloaded;
        outcome.rate_limit_waits = scraped.rate_limit_waits;

        if let Some(err) = &scraped.interrupted {
            match err {
                ChannelError::ChannelUnavailable { .. } => {
                    error!(channel, error = %err, "channel not accessible")
                }
                _ => error!(channel, error = %err, kept = outcome.messages, "error scraping channel"),
            }
            if scraped.messages.is_empty() {
                return outcome.fail(err.kind(), err.to_string());
            }
        }
        info!(channel, messages = outcome.messages, "scraped channel");
        if scraped.messages.is_empty() {
            return outcome;
        }

        let staged = match self
            .lake
            .write_channel_batch(channel, stage_date, &scraped.messages)
            .await
        {
            Ok(staged) => staged,
            Err(err) => {
                error!(channel, error = %format!("{err:#}"), "failed to stage channel batch");
                return outcome.fail("staging", format!("{err:#}"));
            }
        };
        outcome.staged_file = Some(staged.absolute_path.display().to_string());

        let loaded = self.loader.load_messages(&scraped.messages).await;
        match loaded {
            Ok(rows) => {
                outcome.rows_loaded = rows;
                outcome.status = OutcomeStatus::Loaded;
                info!(channel, rows, "loaded channel batch");
                match scraped.interrupted {
                    Some(err) => outcome.partial(err.kind(), err.to_string()),
                    None => outcome,
                }
            }
            Err(err) => {
                error!(channel, error = %format!("{err:#}"), "failed to load channel batch");
                outcome.fail("load", format!("{err:#}"))
            }
        }
    }

    async fn scrape_channel<C: ChannelClient + ?Sized>(
        &self,
        client: &C,
        channel: &str,
    ) -> ScrapedChannel {
        let bounds = HistoryBounds::lookback(
            self.pacing.limit_per_channel,
            self.pacing.days_back,
            Utc::now(),
        );
        let mut history = ChannelHistory::new(client, channel, bounds);
        let mut scraped = ScrapedChannel {
            messages: Vec::new(),
            media_downloaded: 0,
            rate_limit_waits: 0,
            interrupted: None,
        };

        loop {
            let next = match history.next().await {
                Ok(next) => next,
                Err(ChannelError::RateLimited { retry_after }) => {
                    if scraped.rate_limit_waits >= self.pacing.max_rate_limit_waits {
                        scraped.interrupted = Some(ChannelError::RateLimited { retry_after });
                        break;
                    }
                    scraped.rate_limit_waits += 1;
                    warn!(channel, ?retry_after, attempt = scraped.rate_limit_waits, "rate limited; waiting");
                    tokio::time::sleep(retry_after).await;
                    continue;
                }
                Err(error) => {
                    scraped.interrupted = Some(error);
                    break;
                }
            };
            let Some(platform) = next else { break };

            let mut message = extract_message(&platform, channel, Utc::now());
            if message.media_type.is_some_and(|m| m.captures_file()) {
                message.image_path = self.downloader.download(client, channel, &platform).await;
                if message.image_path.is_some() {
                    scraped.media_downloaded += 1;
                }
            }
            scraped.messages.push(message);

            if self.pacing.pause_every > 0 && scraped.messages.len() % self.pacing.pause_every == 0 {
                tokio::time::sleep(self.pacing.pause_duration).await;
            }
        }

        scraped
    }
}
