//! Public web preview backend (`https://t.me/s/{channel}`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use tgwh_storage::{FetchError, HttpClientConfig, HttpFetcher};
use tracing::{debug, info};

use crate::{
    media_extension, mime_from_file_name, ChannelClient, ChannelError, MediaPayload,
    PlatformMedia, PlatformMessage,
};

pub const DEFAULT_PREVIEW_BASE_URL: &str = "https://t.me";

/// Messages and channel metadata scraped from one preview page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreviewPage {
    pub channel_title: Option<String>,
    pub has_channel_info: bool,
    pub messages: Vec<PlatformMessage>,
}

pub struct WebPreviewClient {
    base_url: String,
    http: HttpClientConfig,
    fetcher: Option<HttpFetcher>,
}

impl WebPreviewClient {
    pub fn new(http: HttpClientConfig) -> Self {
        Self::with_base_url(DEFAULT_PREVIEW_BASE_URL, http)
    }

    pub fn with_base_url(base_url: impl Into<String>, http: HttpClientConfig) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            fetcher: None,
        }
    }

    fn page_url(&self, channel: &str, before_id: Option<i64>) -> String {
        match before_id {
            Some(before) => format!("{}/s/{channel}?before={before}", self.base_url),
            None => format!("{}/s/{channel}", self.base_url),
        }
    }

    fn fetcher(&self) -> Result<&HttpFetcher, ChannelError> {
        self.fetcher
            .as_ref()
            .ok_or_else(|| ChannelError::Transport(anyhow::anyhow!("web preview session not started")))
    }
}

fn map_fetch_error(channel: &str, err: FetchError) -> ChannelError {
    match err {
        FetchError::RateLimited { retry_after, .. } => ChannelError::RateLimited { retry_after },
        FetchError::HttpStatus { status, url } if status == 404 || status == 403 => {
            ChannelError::ChannelUnavailable {
                channel: channel.to_string(),
                reason: format!("http status {status} for {url}"),
            }
        }
        other => ChannelError::Transport(anyhow::Error::new(other)),
    }
}

#[async_trait]
impl ChannelClient for WebPreviewClient {
    fn backend(&self) -> &'static str {
        "web"
    }

    fn is_started(&self) -> bool {
        self.fetcher.is_some()
    }

    async fn start(&mut self) -> Result<(), ChannelError> {
        if self.fetcher.is_none() {
            self.fetcher = Some(HttpFetcher::new(self.http.clone())?);
            info!(base_url = %self.base_url, "web preview session started");
        }
        Ok(())
    }

    async fn fetch_history(
        &self,
        channel: &str,
        before_id: Option<i64>,
    ) -> Result<Vec<PlatformMessage>, ChannelError> {
        let url = self.page_url(channel, before_id);
        let response = self
            .fetcher()?
            .fetch_bytes(channel, &url)
            .await
            .map_err(|err| map_fetch_error(channel, err))?;

        // Channels without a public preview redirect to the bare channel page.
        if !response.final_url.contains("/s/") {
            return Err(ChannelError::ChannelUnavailable {
                channel: channel.to_string(),
                reason: format!("redirected to {}", response.final_url),
            });
        }

        let html = String::from_utf8_lossy(&response.body);
        let page = parse_preview_page(&html)?;
        if page.messages.is_empty() && !page.has_channel_info && before_id.is_none() {
            return Err(ChannelError::ChannelUnavailable {
                channel: channel.to_string(),
                reason: "no public preview".into(),
            });
        }
        debug!(channel, before_id, count = page.messages.len(), "fetched preview page");
        Ok(page.messages)
    }

    async fn download_media(
        &self,
        channel: &str,
        message: &PlatformMessage,
    ) -> Result<MediaPayload, ChannelError> {
        let url = match &message.media {
            Some(PlatformMedia::Photo { url: Some(url) }) => url.clone(),
            Some(PlatformMedia::Document { url: Some(url), .. }) => url.clone(),
            _ => {
                return Err(ChannelError::MediaUnavailable {
                    message_id: message.id,
                    reason: "no downloadable url".into(),
                })
            }
        };
        let response = self
            .fetcher()?
            .fetch_bytes(channel, &url)
            .await
            .map_err(|err| match err {
                FetchError::RateLimited { retry_after, .. } => {
                    ChannelError::RateLimited { retry_after }
                }
                other => ChannelError::MediaUnavailable {
                    message_id: message.id,
                    reason: other.to_string(),
                },
            })?;
        Ok(MediaPayload {
            extension: media_extension(Some(&url), response.content_type.as_deref()),
            bytes: response.body,
        })
    }

    async fn disconnect(&mut self) -> Result<(), ChannelError> {
        self.fetcher = None;
        Ok(())
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ChannelError> {
    Selector::parse(selector).map_err(|e| ChannelError::Parse {
        channel: String::new(),
        reason: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn select_first<'a>(element: ElementRef<'a>, selector: &Selector) -> Option<ElementRef<'a>> {
    element.select(selector).next()
}

fn select_first_text(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
    select_first(element, selector).and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn select_first_attr(element: ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    select_first(element, selector)
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

/// Message text with `<br>` rendered as newlines.
fn message_text(element: ElementRef<'_>) -> Option<String> {
    let mut out = String::new();
    for node in element.descendants() {
        if let Some(text) = node.value().as_text() {
            out.push_str(text);
        } else if let Some(el) = node.value().as_element() {
            if el.name() == "br" {
                out.push('\n');
            }
        }
    }
    text_or_none(out)
}

/// `url('...')` out of an inline `background-image` style.
fn background_image_url(style: &str) -> Option<String> {
    let start = style.find("url(")? + 4;
    let rest = &style[start..];
    let end = rest.find(')')?;
    let url = rest[..end].trim().trim_matches(|c| c == '\'' || c == '"');
    text_or_none(url.to_string())
}

/// Compact view counters such as `842`, `1.2K` or `3M`.
pub fn parse_count(raw: &str) -> Option<i64> {
    let value = raw.trim().replace(',', "");
    let (number, multiplier) = match value.chars().last()? {
        'K' | 'k' => (&value[..value.len() - 1], 1_000f64),
        'M' | 'm' => (&value[..value.len() - 1], 1_000_000f64),
        _ => (value.as_str(), 1f64),
    };
    let parsed = number.trim().parse::<f64>().ok()?;
    Some((parsed * multiplier).round() as i64)
}

fn post_id(data_post: &str) -> Option<i64> {
    data_post.rsplit('/').next()?.parse().ok()
}

pub fn parse_preview_page(html: &str) -> Result<PreviewPage, ChannelError> {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let message_sel = parse_selector("div.tgme_widget_message[data-post]")?;
    let date_sel = parse_selector(".tgme_widget_message_date time[datetime]")?;
    let text_sel = parse_selector(".tgme_widget_message_text")?;
    let views_sel = parse_selector(".tgme_widget_message_views")?;
    let photo_sel = parse_selector("a.tgme_widget_message_photo_wrap")?;
    let doc_title_sel = parse_selector(".tgme_widget_message_document_title")?;
    let doc_link_sel = parse_selector("a.tgme_widget_message_document_wrap")?;
    let video_sel = parse_selector(".tgme_widget_message_video_player")?;
    let preview_sel = parse_selector(".tgme_widget_message_link_preview")?;
    let sticker_sel = parse_selector(".tgme_widget_message_sticker_wrap")?;
    let info_sel = parse_selector(".tgme_channel_info")?;
    let title_sel = parse_selector(".tgme_channel_info_header_title")?;

    let mut messages = Vec::new();
    for node in document.select(&message_sel) {
        let Some(id) = node.value().attr("data-post").and_then(post_id) else {
            continue;
        };
        let Some(date) = select_first_attr(node, &date_sel, "datetime")
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|d| d.with_timezone(&Utc))
        else {
            debug!(message_id = id, "skipping message without a parseable date");
            continue;
        };

        let media = if let Some(photo) = select_first(node, &photo_sel) {
            Some(PlatformMedia::Photo {
                url: photo.value().attr("style").and_then(background_image_url),
            })
        } else if let Some(file_name) = select_first_text(node, &doc_title_sel) {
            Some(PlatformMedia::Document {
                mime_type: mime_from_file_name(&file_name).map(ToString::to_string),
                url: select_first_attr(node, &doc_link_sel, "href"),
                file_name: Some(file_name),
            })
        } else if select_first(node, &video_sel).is_some() {
            Some(PlatformMedia::Document {
                mime_type: Some("video/mp4".into()),
                file_name: None,
                url: None,
            })
        } else if select_first(node, &sticker_sel).is_some() {
            Some(PlatformMedia::Unsupported {
                label: Some("sticker".into()),
            })
        } else if select_first(node, &preview_sel).is_some() {
            Some(PlatformMedia::Unsupported {
                label: Some("webpage".into()),
            })
        } else {
            None
        };

        messages.push(PlatformMessage {
            id,
            date,
            text: select_first(node, &text_sel).and_then(message_text),
            sender: None,
            views: select_first_text(node, &views_sel).and_then(|v| parse_count(&v)),
            forwards: None,
            replies: None,
            edit_date: None,
            grouped_id: None,
            media,
        });
    }

    Ok(PreviewPage {
        channel_title: select_first_text(root, &title_sel),
        has_channel_info: select_first(root, &info_sel).is_some(),
        messages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{extract_message, ChannelHistory, HistoryBounds};
    use chrono::TimeZone;
    use std::time::Duration;
    use tgwh_core::MediaType;
    use tgwh_storage::RetryBackoff;
    use wiremock::{
        matchers::{method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    const PAGE: &str = r#"
<html><body>
<div class="tgme_channel_info">
  <div class="tgme_channel_info_header_title"><span>CheMed</span></div>
</div>
<div class="tgme_widget_message" data-post="chemed_et/101">
  <a class="tgme_widget_message_photo_wrap" style="width:100%;background-image:url('https://cdn.example/file/abc.jpg')"></a>
  <div class="tgme_widget_message_text">Vitamin C<br/>500mg በ 350 ብር</div>
  <span class="tgme_widget_message_views">1.2K</span>
  <a class="tgme_widget_message_date"><time datetime="2025-05-06T10:00:00+00:00"></time></a>
</div>
<div class="tgme_widget_message" data-post="chemed_et/102">
  <a class="tgme_widget_message_document_wrap" href="https://cdn.example/file/catalog.pdf">
    <div class="tgme_widget_message_document_title">catalog.pdf</div>
  </a>
  <span class="tgme_widget_message_views">87</span>
  <a class="tgme_widget_message_date"><time datetime="2025-05-06T14:30:00+03:00"></time></a>
</div>
<div class="tgme_widget_message" data-post="chemed_et/103">
  <div class="tgme_widget_message_text">Open daily</div>
  <a class="tgme_widget_message_date"><time datetime="2025-05-07T08:00:00+00:00"></time></a>
</div>
</body></html>
"#;

    fn config() -> HttpClientConfig {
        HttpClientConfig {
            retry: RetryBackoff::none(),
            ..Default::default()
        }
    }

    #[test]
    fn parses_messages_media_and_counters() {
        let page = parse_preview_page(PAGE).unwrap();
        assert!(page.has_channel_info);
        assert_eq!(page.channel_title.as_deref(), Some("CheMed"));
        assert_eq!(page.messages.len(), 3);

        let photo = &page.messages[0];
        assert_eq!(photo.id, 101);
        assert_eq!(photo.text.as_deref(), Some("Vitamin C\n500mg በ 350 ብር"));
        assert_eq!(photo.views, Some(1200));
        assert_eq!(
            photo.media,
            Some(PlatformMedia::Photo {
                url: Some("https://cdn.example/file/abc.jpg".into())
            })
        );

        let doc = &page.messages[1];
        assert_eq!(doc.date, Utc.with_ymd_and_hms(2025, 5, 6, 11, 30, 0).single().unwrap());
        let raw = extract_message(doc, "chemed_et", Utc::now());
        assert_eq!(raw.media_type, Some(MediaType::Document));
        assert_eq!(raw.text, "");

        assert_eq!(page.messages[2].media, None);
    }

    #[test]
    fn parse_count_handles_suffixes() {
        assert_eq!(parse_count("842"), Some(842));
        assert_eq!(parse_count("1.2K"), Some(1200));
        assert_eq!(parse_count("3M"), Some(3_000_000));
        assert_eq!(parse_count("1,024"), Some(1024));
        assert_eq!(parse_count(""), None);
    }

    #[tokio::test]
    async fn history_pages_use_before_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/s/chemed_et"))
            .and(query_param("before", "101"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<div class="tgme_channel_info"></div>
                <div class="tgme_widget_message" data-post="chemed_et/99">
                  <a class="tgme_widget_message_date"><time datetime="2025-05-05T10:00:00+00:00"></time></a>
                </div>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/s/chemed_et"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE))
            .mount(&server)
            .await;

        let mut client = WebPreviewClient::with_base_url(server.uri(), config());
        client.start().await.unwrap();
        let now = Utc.with_ymd_and_hms(2025, 5, 8, 0, 0, 0).single().unwrap();
        let mut history = ChannelHistory::new(&client, "chemed_et", HistoryBounds::lookback(10, 7, now));

        let mut ids = Vec::new();
        while let Some(message) = history.next().await.unwrap() {
            ids.push(message.id);
        }
        assert_eq!(ids, vec![103, 102, 101, 99]);
    }

    #[tokio::test]
    async fn throttling_maps_to_rate_limited_with_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/s/lobelia4cosmetics"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "17"))
            .mount(&server)
            .await;

        let mut client = WebPreviewClient::with_base_url(server.uri(), config());
        client.start().await.unwrap();
        match client.fetch_history("lobelia4cosmetics", None).await {
            Err(ChannelError::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Duration::from_secs(17))
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_channel_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/s/no_such_channel"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let mut client = WebPreviewClient::with_base_url(server.uri(), config());
        client.start().await.unwrap();
        let err = client.fetch_history("no_such_channel", None).await.unwrap_err();
        assert_eq!(err.kind(), "channel_unavailable");
    }

    #[tokio::test]
    async fn requests_before_start_fail() {
        let client = WebPreviewClient::with_base_url("http://127.0.0.1:9", config());
        assert!(!client.is_started());
        let err = client.fetch_history("chemed_et", None).await.unwrap_err();
        assert_eq!(err.kind(), "transport");
    }

    #[tokio::test]
    async fn photo_download_uses_url_extension() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file/abc.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"\xff\xd8jpeg".to_vec()))
            .mount(&server)
            .await;

        let mut client = WebPreviewClient::with_base_url(server.uri(), config());
        client.start().await.unwrap();
        let mut message = crate::tests::platform(101, Utc::now());
        message.media = Some(PlatformMedia::Photo {
            url: Some(format!("{}/file/abc.jpg", server.uri())),
        });
        let payload = client.download_media("chemed_et", &message).await.unwrap();
        assert_eq!(payload.extension, "jpg");
        assert_eq!(payload.bytes, b"\xff\xd8jpeg".to_vec());
    }
}
