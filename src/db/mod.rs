use crate::config::Config;
use crate::media::MediaKind;
use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

#[cfg(test)]
pub(crate) mod recording;

const SCHEMA: &str = include_str!("schema.sql");

/// An ungrouped post, written with scalar media columns.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub source_message_id: i64,
    pub text: String,
    pub media_kind: Option<MediaKind>,
    pub media_url: Option<String>,
}

/// A flushed media group, written with JSON-encoded media lists.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMediaGroup {
    pub source_message_id: i64,
    pub text: Option<String>,
    pub media_kinds: Vec<MediaKind>,
    pub media_urls: Vec<String>,
    pub group_id: String,
}

/// A raw `messages` row. `media_type`/`media_url` hold JSON lists when `media_group_id` is set.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub message_id: i64,
    pub text: Option<String>,
    pub media_type: Option<String>,
    pub media_url: Option<String>,
    pub media_group_id: Option<String>,
    pub timestamp: Option<String>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert_single(&self, message: NewMessage) -> anyhow::Result<i64>;
    async fn insert_group(&self, group: NewMediaGroup) -> anyhow::Result<i64>;
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        if let Some(parent) = Path::new(&config.database_url).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {:?}", parent)
                })?;
            }
        }
        Self::open(&config.database_url)
    }

    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Database connection mutex poisoned"))
    }

    /// Runs a synchronous database call on the blocking pool.
    pub async fn run_blocking<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    pub fn execute_init(&self) -> anyhow::Result<()> {
        info!("Database: Initializing schema...");
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    pub fn save_message(&self, message: &NewMessage) -> anyhow::Result<i64> {
        debug!(
            "Database: Saving message {} (media: {:?})",
            message.source_message_id, message.media_kind
        );
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (message_id, text, media_type, media_url)
             VALUES (?1, ?2, ?3, ?4)",
            (
                message.source_message_id,
                &message.text,
                message.media_kind.map(|k| k.as_str()),
                &message.media_url,
            ),
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn save_media_group(&self, group: &NewMediaGroup) -> anyhow::Result<i64> {
        debug!(
            "Database: Saving media group {} from message {} with {} item(s)",
            group.group_id,
            group.source_message_id,
            group.media_urls.len()
        );
        let media_types = serde_json::to_string(&group.media_kinds)?;
        let media_urls = serde_json::to_string(&group.media_urls)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (message_id, text, media_type, media_url, media_group_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            (
                group.source_message_id,
                &group.text,
                media_types,
                media_urls,
                &group.group_id,
            ),
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest first. Rows written within the same second fall back to insertion order.
    pub fn list_messages(&self) -> anyhow::Result<Vec<StoredMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, message_id, text, media_type, media_url, media_group_id, timestamp
             FROM messages
             ORDER BY timestamp DESC, id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(StoredMessage {
                id: row.get(0)?,
                message_id: row.get(1)?,
                text: row.get(2)?,
                media_type: row.get(3)?,
                media_url: row.get(4)?,
                media_group_id: row.get(5)?,
                timestamp: row.get(6)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }

        debug!("Database: Listing returned {} messages", results.len());
        Ok(results)
    }

    #[cfg(test)]
    pub(crate) fn count_messages(&self) -> anyhow::Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(usize::try_from(count)?)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> anyhow::Result<usize> {
        Ok(self.conn()?.execute(sql, [])?)
    }
}

#[async_trait]
impl MessageStore for Database {
    async fn insert_single(&self, message: NewMessage) -> anyhow::Result<i64> {
        self.run_blocking(move |db| db.save_message(&message)).await
    }

    async fn insert_group(&self, group: NewMediaGroup) -> anyhow::Result<i64> {
        self.run_blocking(move |db| db.save_media_group(&group)).await
    }
}

/// SQLite `CURRENT_TIMESTAMP` is UTC without an offset.
pub fn parse_sqlite_utc(ts: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S").ok()?;
    Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}
