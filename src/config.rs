use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone)]
pub struct Config {
    pub telegram_token: String,
    pub channel_id: i64,
    pub telegram_api_url: String,
    pub database_url: String,
    pub media_dir: String,
    pub public_base_url: String,
    pub api_host: String,
    pub api_port: u16,
    pub cors_origins: Vec<String>,
    /// Quiet period after the last fragment of a media group before it is flushed.
    pub media_group_debounce: Duration,
    pub poll_timeout_secs: u64,
    pub poll_retry_secs: u64,
    pub max_download_bytes: u64,
}

/// Bot API refuses `getFile` downloads above 20 MB.
pub const TELEGRAM_DOWNLOAD_LIMIT: u64 = 20 * 1024 * 1024;

const DEFAULT_DEBOUNCE: &str = "2s";

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        let debounce = env::var("MEDIA_GROUP_DEBOUNCE").unwrap_or_else(|_| DEFAULT_DEBOUNCE.to_string());
        let media_group_debounce = humantime::parse_duration(&debounce).map_err(|e| {
            anyhow::anyhow!("MEDIA_GROUP_DEBOUNCE must be a duration like '2s' or '1500ms': {}", e)
        })?;

        Ok(Config {
            telegram_token: env::var("TELEGRAM_BOT_TOKEN")
                .map_err(|_| anyhow::anyhow!("TELEGRAM_BOT_TOKEN must be set"))?,
            channel_id: env::var("TELEGRAM_CHANNEL_ID")
                .map_err(|_| anyhow::anyhow!("TELEGRAM_CHANNEL_ID must be set"))?
                .parse()
                .map_err(|_| anyhow::anyhow!("TELEGRAM_CHANNEL_ID must be a valid i64"))?,
            telegram_api_url: env::var("TELEGRAM_API_URL")
                .unwrap_or_else(|_| "https://api.telegram.org".to_string()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "data/postmirror.db".to_string()),
            media_dir: env::var("MEDIA_DIR").unwrap_or_else(|_| "media".to_string()),
            public_base_url: env::var("PUBLIC_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            api_host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            api_port: parse_var("API_PORT", 8000)?,
            cors_origins: env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000".to_string())
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect(),
            media_group_debounce,
            poll_timeout_secs: parse_var("POLL_TIMEOUT_SECS", 30)?,
            poll_retry_secs: parse_var("POLL_RETRY_SECS", 5)?,
            max_download_bytes: parse_var("MAX_DOWNLOAD_BYTES", TELEGRAM_DOWNLOAD_LIMIT)?,
        })
    }

    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}

/// Reads a numeric variable. Unset falls back to `default`; a value that does not parse is an error.
fn parse_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} has invalid value '{}': {}", name, raw, e)),
        Err(_) => Ok(default),
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("telegram_token", &"[REDACTED]")
            .field("channel_id", &self.channel_id)
            .field("telegram_api_url", &self.telegram_api_url)
            .field("database_url", &self.database_url)
            .field("media_dir", &self.media_dir)
            .field("public_base_url", &self.public_base_url)
            .field("api_host", &self.api_host)
            .field("api_port", &self.api_port)
            .field("cors_origins", &self.cors_origins)
            .field("media_group_debounce", &self.media_group_debounce)
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .field("poll_retry_secs", &self.poll_retry_secs)
            .field("max_download_bytes", &self.max_download_bytes)
            .finish()
    }
}
