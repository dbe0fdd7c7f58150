//! Core domain model for the channel warehouse pipeline.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tgwh-core";

/// Data lake subdirectory holding staged message files.
pub const MESSAGES_DIR: &str = "telegram_messages";
/// Data lake subdirectory holding downloaded media.
pub const IMAGES_DIR: &str = "images";
/// Folder naming used for both staged files and media.
pub const DATE_FOLDER_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Photo,
    Image,
    Document,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaType::Photo => "photo",
            MediaType::Image => "image",
            MediaType::Document => "document",
        }
    }

    /// Photo and image-document attachments are downloaded; other documents are not.
    pub fn captures_file(self) -> bool {
        matches!(self, MediaType::Photo | MediaType::Image)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engagement and threading metadata carried alongside a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawData {
    pub views: Option<i64>,
    pub forwards: Option<i64>,
    pub replies: Option<i64>,
    pub edit_date: Option<DateTime<Utc>>,
    pub grouped_id: Option<i64>,
}

/// Normalized message record, the unit staged to the data lake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub message_id: i64,
    pub channel_name: String,
    pub date: DateTime<Utc>,
    pub text: String,
    pub sender_id: Option<i64>,
    pub has_media: bool,
    pub media_type: Option<MediaType>,
    pub image_path: Option<String>,
    pub scraped_at: DateTime<Utc>,
    pub raw_data: RawData,
}

impl RawMessage {
    /// `has_media` mirrors `media_type`, and only photo/image media may carry a path.
    pub fn media_invariant_holds(&self) -> bool {
        let media_consistent = self.has_media == self.media_type.is_some();
        let path_consistent = match (&self.image_path, self.media_type) {
            (None, _) => true,
            (Some(_), Some(kind)) => kind.captures_file(),
            (Some(_), None) => false,
        };
        media_consistent && path_consistent
    }

    pub fn date_folder(&self) -> String {
        self.date.format(DATE_FOLDER_FORMAT).to_string()
    }
}

/// Object detection produced by the external enrichment step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub channel_name: String,
    pub date: NaiveDate,
    pub image_path: String,
    pub detected_object_class: String,
    pub confidence_score: f64,
    pub bbox_xmin: f64,
    pub bbox_ymin: f64,
    pub bbox_xmax: f64,
    pub bbox_ymax: f64,
    pub detected_at: DateTime<Utc>,
}

/// Identity of a staged file: one per (date, channel).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StagedFileId {
    pub date: NaiveDate,
    pub channel: String,
}

impl StagedFileId {
    pub fn new(date: NaiveDate, channel: impl Into<String>) -> Self {
        Self {
            date,
            channel: channel.into(),
        }
    }

    pub fn date_folder(&self) -> String {
        self.date.format(DATE_FOLDER_FORMAT).to_string()
    }

    /// Path relative to the data lake root.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(MESSAGES_DIR)
            .join(self.date_folder())
            .join(format!("{}.json", self.channel))
    }
}

/// Date range of the data lake's date folders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub earliest: Option<String>,
    pub latest: Option<String>,
}

/// Name-only inventory of the data lake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLakeSummary {
    pub total_date_folders: usize,
    pub total_json_files: usize,
    pub date_folders: Vec<String>,
    pub channels: Vec<String>,
    pub date_range: DateRange,
}

/// An image on disk awaiting object detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub channel_name: String,
    pub date: String,
    pub image_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(media_type: Option<MediaType>, image_path: Option<&str>) -> RawMessage {
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 30, 0).single().unwrap();
        RawMessage {
            message_id: 42,
            channel_name: "tikvahpharma".into(),
            date: at,
            text: "Paracetamol በቅናሽ".into(),
            sender_id: None,
            has_media: media_type.is_some(),
            media_type,
            image_path: image_path.map(ToString::to_string),
            scraped_at: at,
            raw_data: RawData::default(),
        }
    }

    #[test]
    fn media_invariant_rejects_paths_on_documents() {
        assert!(sample(None, None).media_invariant_holds());
        assert!(sample(Some(MediaType::Photo), Some("images/a/b.jpg")).media_invariant_holds());
        assert!(sample(Some(MediaType::Document), None).media_invariant_holds());
        assert!(!sample(Some(MediaType::Document), Some("x.pdf")).media_invariant_holds());
        assert!(!sample(None, Some("x.jpg")).media_invariant_holds());
    }

    #[test]
    fn media_type_serializes_lowercase() {
        let json = serde_json::to_string(&sample(Some(MediaType::Image), None)).unwrap();
        assert!(json.contains("\"media_type\":\"image\""));
        assert!(json.contains("Paracetamol በቅናሽ"));
    }

    #[test]
    fn staged_file_path_encodes_date_and_channel() {
        let id = StagedFileId::new(NaiveDate::from_ymd_opt(2025, 1, 9).unwrap(), "chemed_et");
        assert_eq!(
            id.relative_path(),
            PathBuf::from("telegram_messages").join("2025-01-09").join("chemed_et.json")
        );
    }
}
