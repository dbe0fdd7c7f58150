//! Warehouse sinks for the `raw` schema.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tgwh_core::{DetectionRecord, RawMessage};
use tracing::{debug, info};

/// Base pool size plus overflow.
pub const MAX_POOL_CONNECTIONS: u32 = 15;

/// Row shape of `raw.telegram_messages`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarehouseRow {
    pub message_id: i64,
    pub channel_name: String,
    pub date: DateTime<Utc>,
    pub text: Option<String>,
    pub sender_id: Option<i64>,
    pub has_media: bool,
    pub media_type: Option<String>,
    pub image_path: Option<String>,
    pub scraped_at: Option<DateTime<Utc>>,
    /// Serialized JSON, cast to `jsonb` on insert.
    pub raw_data: Option<String>,
}

impl WarehouseRow {
    pub fn from_message(message: &RawMessage) -> Result<Self> {
        Ok(Self {
            message_id: message.message_id,
            channel_name: message.channel_name.clone(),
            date: message.date,
            text: Some(message.text.clone()),
            sender_id: message.sender_id,
            has_media: message.has_media,
            media_type: message.media_type.map(|m| m.as_str().to_string()),
            image_path: message.image_path.clone(),
            scraped_at: Some(message.scraped_at),
            raw_data: Some(
                serde_json::to_string(&message.raw_data).context("serializing raw_data")?,
            ),
        })
    }
}

/// Append-only destination for loaded rows. Implementations apply all rows of
/// one call atomically.
#[async_trait]
pub trait RawSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn append_messages(&self, rows: &[WarehouseRow], chunk_size: usize) -> Result<u64>;

    async fn append_detections(&self, rows: &[DetectionRecord], chunk_size: usize) -> Result<u64>;
}

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_POOL_CONNECTIONS)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to warehouse")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("warehouse connectivity check")?;
        Ok(())
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running warehouse migrations")?;
        info!("warehouse migrations applied");
        Ok(())
    }
}

#[async_trait]
impl RawSink for PgWarehouse {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn append_messages(&self, rows: &[WarehouseRow], chunk_size: usize) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let mut inserted = 0u64;

        for (chunk_idx, chunk) in rows.chunks(chunk_size.max(1)).enumerate() {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
                r#"
                INSERT INTO raw.telegram_messages (
                    message_id, channel_name, date, text, sender_id,
                    has_media, media_type, image_path, scraped_at, raw_data
                )
                "#,
            );
            query_builder.push_values(chunk.iter(), |mut b, row| {
                b.push_bind(row.message_id)
                    .push_bind(row.channel_name.as_str())
                    .push_bind(row.date)
                    .push_bind(row.text.as_deref())
                    .push_bind(row.sender_id)
                    .push_bind(row.has_media)
                    .push_bind(row.media_type.as_deref())
                    .push_bind(row.image_path.as_deref())
                    .push_bind(row.scraped_at)
                    .push_bind(row.raw_data.as_deref())
                    .push_unseparated("::jsonb");
            });
            let result = query_builder
                .build()
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to insert message chunk {}", chunk_idx + 1))?;
            inserted += result.rows_affected();
            debug!(chunk = chunk_idx + 1, rows = chunk.len(), "inserted message chunk");
        }

        tx.commit().await.context("Failed to commit transaction")?;
        Ok(inserted)
    }

    async fn append_detections(&self, rows: &[DetectionRecord], chunk_size: usize) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let mut inserted = 0u64;

        for chunk in rows.chunks(chunk_size.max(1)) {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
                r#"
                INSERT INTO raw.image_detections (
                    channel_name, date, image_path, detected_object_class, confidence_score,
                    bbox_xmin, bbox_ymin, bbox_xmax, bbox_ymax, detected_at
                )
                "#,
            );
            query_builder.push_values(chunk.iter(), |mut b, row| {
                b.push_bind(row.channel_name.as_str())
                    .push_bind(row.date)
                    .push_bind(row.image_path.as_str())
                    .push_bind(row.detected_object_class.as_str())
                    .push_bind(row.confidence_score)
                    .push_bind(row.bbox_xmin)
                    .push_bind(row.bbox_ymin)
                    .push_bind(row.bbox_xmax)
                    .push_bind(row.bbox_ymax)
                    .push_bind(row.detected_at);
            });
            let result = query_builder
                .build()
                .execute(&mut *tx)
                .await
                .context("Failed to insert detection chunk")?;
            inserted += result.rows_affected();
        }

        tx.commit().await.context("Failed to commit transaction")?;
        Ok(inserted)
    }
}

/// In-process sink for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    messages: Mutex<Vec<WarehouseRow>>,
    detections: Mutex<Vec<DetectionRecord>>,
    chunk_sizes: Mutex<Vec<usize>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<WarehouseRow> {
        self.messages.lock().map(|rows| rows.clone()).unwrap_or_default()
    }

    pub fn detections(&self) -> Vec<DetectionRecord> {
        self.detections.lock().map(|rows| rows.clone()).unwrap_or_default()
    }

    /// Sizes of every chunk appended so far, in order.
    pub fn chunk_sizes(&self) -> Vec<usize> {
        self.chunk_sizes.lock().map(|sizes| sizes.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RawSink for MemoryWarehouse {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn append_messages(&self, rows: &[WarehouseRow], chunk_size: usize) -> Result<u64> {
        let mut sizes = self.chunk_sizes.lock().map_err(|_| anyhow!("warehouse lock poisoned"))?;
        let mut messages = self.messages.lock().map_err(|_| anyhow!("warehouse lock poisoned"))?;
        for chunk in rows.chunks(chunk_size.max(1)) {
            sizes.push(chunk.len());
        }
        messages.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }

    async fn append_detections(&self, rows: &[DetectionRecord], _chunk_size: usize) -> Result<u64> {
        let mut detections = self.detections.lock().map_err(|_| anyhow!("warehouse lock poisoned"))?;
        detections.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tgwh_core::{MediaType, RawData};

    #[test]
    fn row_from_message_serializes_raw_data() {
        let at = Utc.with_ymd_and_hms(2025, 4, 1, 6, 0, 0).single().unwrap();
        let message = RawMessage {
            message_id: 5,
            channel_name: "chemed_et".into(),
            date: at,
            text: "ሰላም".into(),
            sender_id: Some(9),
            has_media: true,
            media_type: Some(MediaType::Photo),
            image_path: Some("images/chemed_et/2025-04-01/5_ab.jpg".into()),
            scraped_at: at,
            raw_data: RawData {
                views: Some(10),
                ..RawData::default()
            },
        };
        let row = WarehouseRow::from_message(&message).unwrap();
        assert_eq!(row.media_type.as_deref(), Some("photo"));
        assert_eq!(row.text.as_deref(), Some("ሰላም"));
        let raw: serde_json::Value = serde_json::from_str(row.raw_data.as_deref().unwrap()).unwrap();
        assert_eq!(raw["views"], 10);
        assert!(raw["forwards"].is_null());
    }

    #[tokio::test]
    async fn memory_sink_records_chunks() {
        let sink = MemoryWarehouse::new();
        let at = Utc.with_ymd_and_hms(2025, 4, 1, 6, 0, 0).single().unwrap();
        let rows = (0..2500)
            .map(|i| WarehouseRow {
                message_id: i,
                channel_name: "c".into(),
                date: at,
                text: None,
                sender_id: None,
                has_media: false,
                media_type: None,
                image_path: None,
                scraped_at: None,
                raw_data: None,
            })
            .collect::<Vec<_>>();
        assert_eq!(sink.append_messages(&rows, 1000).await.unwrap(), 2500);
        assert_eq!(sink.chunk_sizes(), vec![1000, 1000, 500]);
        assert_eq!(sink.messages().len(), 2500);
    }
}
