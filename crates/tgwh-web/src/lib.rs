//! Read-only analytics API over the raw warehouse and the data lake.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, QueryBuilder, Row};
use tgwh_core::DataLakeSummary;
use tgwh_storage::DataLake;
use tgwh_sync::PipelineConfig;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "tgwh-web";

pub const DEFAULT_PAGE_LIMIT: i64 = 100;
pub const MAX_PAGE_LIMIT: i64 = 1000;
pub const DEFAULT_SEARCH_LIMIT: i64 = 50;
pub const DEFAULT_TOP_DETECTIONS: i64 = 10;

#[derive(Clone)]
pub struct AppState {
    pub data_lake_root: PathBuf,
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn new(data_lake_root: impl Into<PathBuf>, pool: Option<PgPool>) -> Self {
        Self {
            data_lake_root: data_lake_root.into(),
            pool,
        }
    }

    fn pool(&self) -> Result<&PgPool, ApiError> {
        self.pool.as_ref().ok_or(ApiError::NoDatabase)
    }
}

#[derive(Debug)]
pub enum ApiError {
    NoDatabase,
    NotFound(String),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal(err.into())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::NoDatabase => (
                StatusCode::SERVICE_UNAVAILABLE,
                "warehouse is not configured".to_string(),
            ),
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
            ApiError::Internal(err) => {
                warn!(error = %format!("{err:#}"), "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {err}"))
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelSummary {
    pub channel_name: String,
    pub total_messages: i64,
    pub media_messages: i64,
    pub last_message_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelDetail {
    #[serde(flatten)]
    pub summary: ChannelSummary,
    pub first_message_date: Option<DateTime<Utc>>,
    pub avg_views: Option<f64>,
    pub image_messages: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRow {
    pub message_id: i64,
    pub channel_name: String,
    pub date: DateTime<Utc>,
    pub text: Option<String>,
    pub has_media: bool,
    pub media_type: Option<String>,
    pub image_path: Option<String>,
    pub views: Option<i64>,
    pub forwards: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectionSummary {
    pub detected_object_class: String,
    pub detection_count: i64,
    pub avg_confidence: f64,
    pub channels: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MessagesQuery {
    pub channel_name: Option<String>,
    pub has_media: Option<bool>,
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    pub query: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TopQuery {
    pub limit: Option<i64>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/data-lake/summary", get(summary_handler))
        .route("/api/channels", get(channels_handler))
        .route("/api/channels/{name}", get(channel_detail_handler))
        .route("/api/messages", get(messages_handler))
        .route("/api/messages/search", get(search_handler))
        .route("/api/detections/top", get(top_detections_handler))
        .with_state(Arc::new(state))
}

/// Opens a pool when the database settings validate. An unreachable database
/// leaves the API up with warehouse routes answering 503.
pub async fn connect_pool(config: &PipelineConfig) -> Option<PgPool> {
    if let Err(err) = config.validate_database() {
        warn!(error = %err, "warehouse routes disabled");
        return None;
    }
    match PgPoolOptions::new()
        .max_connections(tgwh_sync::warehouse::MAX_POOL_CONNECTIONS)
        .connect(&config.database.url())
        .await
    {
        Ok(pool) => Some(pool),
        Err(err) => {
            warn!(database = %config.database.redacted_url(), error = %err, "warehouse unreachable");
            None
        }
    }
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env()?;
    let pool = connect_pool(&config).await;
    let state = AppState::new(&config.data_lake_path, pool);
    let listener = TcpListener::bind((config.api_host.as_str(), config.api_port))
        .await
        .with_context(|| format!("binding {}:{}", config.api_host, config.api_port))?;
    info!(host = %config.api_host, port = config.api_port, "analytics API listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn page_limit(limit: Option<i64>, default: i64) -> Result<i64, ApiError> {
    let limit = limit.unwrap_or(default);
    if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {MAX_PAGE_LIMIT}"
        )));
    }
    Ok(limit)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let database = match &state.pool {
        Some(pool) => match sqlx::query("SELECT 1").execute(pool).await {
            Ok(_) => "connected",
            Err(_) => "unreachable",
        },
        None => "unconfigured",
    };
    Json(json!({ "status": "ok", "database": database }))
}

async fn summary_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DataLakeSummary>, ApiError> {
    let summary = DataLake::new(&state.data_lake_root).summarize()?;
    Ok(Json(summary))
}

async fn channels_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ChannelSummary>>, ApiError> {
    let pool = state.pool()?;
    let rows = sqlx::query(
        r#"
        SELECT channel_name,
               COUNT(*) AS total_messages,
               COUNT(*) FILTER (WHERE has_media) AS media_messages,
               MAX(date) AS last_message_date
          FROM raw.telegram_messages
         GROUP BY channel_name
         ORDER BY total_messages DESC, channel_name
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(ChannelSummary {
            channel_name: row.try_get("channel_name")?,
            total_messages: row.try_get("total_messages")?,
            media_messages: row.try_get("media_messages")?,
            last_message_date: row.try_get("last_message_date")?,
        });
    }
    Ok(Json(out))
}

async fn channel_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<ChannelDetail>, ApiError> {
    let pool = state.pool()?;
    let row = sqlx::query(
        r#"
        SELECT channel_name,
               COUNT(*) AS total_messages,
               COUNT(*) FILTER (WHERE has_media) AS media_messages,
               COUNT(*) FILTER (WHERE image_path IS NOT NULL) AS image_messages,
               MIN(date) AS first_message_date,
               MAX(date) AS last_message_date,
               AVG((raw_data->>'views')::BIGINT)::FLOAT8 AS avg_views
          FROM raw.telegram_messages
         WHERE channel_name = $1
         GROUP BY channel_name
        "#,
    )
    .bind(&name)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("Channel not found: {name}")))?;

    Ok(Json(ChannelDetail {
        summary: ChannelSummary {
            channel_name: row.try_get("channel_name")?,
            total_messages: row.try_get("total_messages")?,
            media_messages: row.try_get("media_messages")?,
            last_message_date: row.try_get("last_message_date")?,
        },
        first_message_date: row.try_get("first_message_date")?,
        avg_views: row.try_get("avg_views")?,
        image_messages: row.try_get("image_messages")?,
    }))
}

const MESSAGE_COLUMNS: &str = r#"
    SELECT message_id, channel_name, date, text, has_media, media_type, image_path,
           (raw_data->>'views')::BIGINT AS views,
           (raw_data->>'forwards')::BIGINT AS forwards
      FROM raw.telegram_messages
     WHERE TRUE"#;

fn message_from_row(row: &sqlx::postgres::PgRow) -> Result<MessageRow, sqlx::Error> {
    Ok(MessageRow {
        message_id: row.try_get("message_id")?,
        channel_name: row.try_get("channel_name")?,
        date: row.try_get("date")?,
        text: row.try_get("text")?,
        has_media: row.try_get("has_media")?,
        media_type: row.try_get("media_type")?,
        image_path: row.try_get("image_path")?,
        views: row.try_get("views")?,
        forwards: row.try_get("forwards")?,
    })
}

async fn messages_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<MessageRow>>, ApiError> {
    let limit = page_limit(query.limit, DEFAULT_PAGE_LIMIT)?;
    let skip = query.skip.unwrap_or(0);
    if skip < 0 {
        return Err(ApiError::BadRequest("skip must not be negative".into()));
    }
    let pool = state.pool()?;

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(MESSAGE_COLUMNS);
    if let Some(channel) = &query.channel_name {
        qb.push(" AND channel_name = ").push_bind(channel);
    }
    if let Some(has_media) = query.has_media {
        qb.push(" AND has_media = ").push_bind(has_media);
    }
    qb.push(" ORDER BY date DESC, message_id DESC OFFSET ")
        .push_bind(skip)
        .push(" LIMIT ")
        .push_bind(limit);

    let rows = qb.build().fetch_all(pool).await?;
    let messages = rows
        .iter()
        .map(message_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(messages))
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<MessageRow>>, ApiError> {
    let needle = query
        .query
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::BadRequest("query must not be empty".into()))?;
    let limit = page_limit(query.limit, DEFAULT_SEARCH_LIMIT)?;
    let pool = state.pool()?;

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(MESSAGE_COLUMNS);
    qb.push(" AND text ILIKE ")
        .push_bind(format!("%{needle}%"))
        .push(" ORDER BY date DESC LIMIT ")
        .push_bind(limit);

    let rows = qb.build().fetch_all(pool).await?;
    let messages = rows
        .iter()
        .map(message_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(messages))
}

async fn top_detections_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TopQuery>,
) -> Result<Json<Vec<DetectionSummary>>, ApiError> {
    let limit = page_limit(query.limit, DEFAULT_TOP_DETECTIONS)?;
    let pool = state.pool()?;
    let rows = sqlx::query(
        r#"
        SELECT detected_object_class,
               COUNT(*) AS detection_count,
               AVG(confidence_score)::FLOAT8 AS avg_confidence,
               ARRAY_AGG(DISTINCT channel_name)::TEXT[] AS channels
          FROM raw.image_detections
         GROUP BY detected_object_class
         ORDER BY detection_count DESC, detected_object_class
         LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(DetectionSummary {
            detected_object_class: row.try_get("detected_object_class")?,
            detection_count: row.try_get("detection_count")?,
            avg_confidence: row.try_get("avg_confidence")?,
            channels: row.try_get("channels")?,
        });
    }
    Ok(Json(out))
}
