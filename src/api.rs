use crate::config::Config;
use crate::db::{parse_sqlite_utc, Database, StoredMessage};
use crate::error::ApiError;
use axum::{
    extract::State,
    http::{HeaderValue, Method},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ApiState {
    pub db: Database,
}

/// One message as served by `GET /messages`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: i64,
    pub source_message_id: i64,
    pub text: Option<String>,
    pub media_type: Option<String>,
    pub media_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_urls: Option<Vec<String>>,
    pub is_media_group: bool,
    pub timestamp: String,
}

/// Outcome of decoding a JSON-encoded media column.
#[derive(Debug, PartialEq)]
pub enum MediaList {
    Decoded(Vec<String>),
    /// Not JSON at all: a scalar written before grouping existed.
    Fallback(Vec<String>),
    /// Valid JSON of the wrong shape; the row cannot be rebuilt.
    Skip(String),
}

impl MediaList {
    fn into_result(self) -> Result<Vec<String>, String> {
        match self {
            MediaList::Decoded(items) | MediaList::Fallback(items) => Ok(items),
            MediaList::Skip(reason) => Err(reason),
        }
    }
}

pub fn decode_media_list(raw: Option<&str>) -> MediaList {
    let Some(raw) = raw else {
        return MediaList::Decoded(Vec::new());
    };

    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => {
            let mut decoded = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => decoded.push(s),
                    other => return MediaList::Skip(format!("non-string list item {}", other)),
                }
            }
            MediaList::Decoded(decoded)
        }
        Ok(other) => MediaList::Skip(format!("expected a JSON list, found {}", other)),
        Err(_) => MediaList::Fallback(vec![raw.to_string()]),
    }
}

/// Rebuilds the client view of a row. `media_group_id` decides between singular and list fields.
pub fn reconstruct(row: StoredMessage) -> Result<MessageView, String> {
    let timestamp = match row.timestamp.as_deref() {
        Some(raw) => parse_sqlite_utc(raw)
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| raw.to_string()),
        None => String::new(),
    };

    if row.media_group_id.is_none() {
        return Ok(MessageView {
            id: row.id,
            source_message_id: row.message_id,
            text: row.text,
            media_type: row.media_type,
            media_url: row.media_url,
            media_types: None,
            media_urls: None,
            is_media_group: false,
            timestamp,
        });
    }

    let media_types = decode_media_list(row.media_type.as_deref())
        .into_result()
        .map_err(|e| format!("media_type: {}", e))?;
    let media_urls = decode_media_list(row.media_url.as_deref())
        .into_result()
        .map_err(|e| format!("media_url: {}", e))?;
    if media_types.len() != media_urls.len() {
        return Err(format!(
            "{} media types for {} media urls",
            media_types.len(),
            media_urls.len()
        ));
    }

    Ok(MessageView {
        id: row.id,
        source_message_id: row.message_id,
        text: row.text,
        media_type: None,
        media_url: None,
        media_types: Some(media_types),
        media_urls: Some(media_urls),
        is_media_group: true,
        timestamp,
    })
}

/// Rows that cannot be rebuilt are logged and left out.
pub fn reconstruct_all(rows: Vec<StoredMessage>) -> Vec<MessageView> {
    rows.into_iter()
        .filter_map(|row| {
            let id = row.id;
            match reconstruct(row) {
                Ok(view) => Some(view),
                Err(reason) => {
                    warn!("Skipping message row {}: {}", id, reason);
                    None
                }
            }
        })
        .collect()
}

pub fn router(state: ApiState, config: &Config) -> Router {
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::OPTIONS])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/health", get(health_check))
        .route("/messages", get(list_messages))
        .nest_service("/media", ServeDir::new(&config.media_dir))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn list_messages(State(state): State<ApiState>) -> Result<Json<Vec<MessageView>>, ApiError> {
    let rows = state.db.run_blocking(|db| db.list_messages()).await?;
    let total = rows.len();
    let views = reconstruct_all(rows);
    debug!("Serving {} of {} messages", views.len(), total);
    Ok(Json(views))
}
