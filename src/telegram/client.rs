use super::{ApiResponse, File, Update, User};
use crate::config::Config;
use crate::error::{MediaError, TelegramError};
use crate::media::{Attachment, FetchedMedia, MediaFetcher};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Extra time on top of the long-poll timeout before the HTTP request is abandoned.
const POLL_GRACE: Duration = Duration::from_secs(10);
/// Upper bound for `getFile`.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound for one file download. A media group waits on its slowest download.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Serialize)]
struct GetUpdatesParams<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<i64>,
    timeout: u64,
    allowed_updates: &'a [&'a str],
}

#[derive(Serialize)]
struct GetFileParams<'a> {
    file_id: &'a str,
}

pub struct TelegramClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
    max_download_bytes: u64,
}

impl TelegramClient {
    pub fn new(config: &Config) -> Self {
        Self::with_api_url(
            &config.telegram_api_url,
            &config.telegram_token,
            config.max_download_bytes,
        )
    }

    pub fn with_api_url(api_url: &str, token: &str, max_download_bytes: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            max_download_bytes,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.api_url, self.token, file_path)
    }

    async fn call<P, T>(
        &self,
        method: &str,
        params: &P,
        timeout: Option<Duration>,
    ) -> Result<T, TelegramError>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = self.http.post(self.method_url(method)).json(params);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        // Failed calls still answer with a JSON body carrying `ok: false`.
        let response: ApiResponse<T> = request.send().await?.json().await?;
        match response.result {
            Some(result) if response.ok => Ok(result),
            _ => Err(TelegramError::Api {
                method: method.to_string(),
                description: response
                    .description
                    .unwrap_or_else(|| "no description".to_string()),
            }),
        }
    }

    pub async fn get_me(&self) -> Result<User, TelegramError> {
        self.call("getMe", &serde_json::json!({}), None).await
    }

    /// Long-polls for channel posts only.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TelegramError> {
        let params = GetUpdatesParams {
            offset,
            timeout: timeout_secs,
            allowed_updates: &["channel_post"],
        };
        let timeout = Duration::from_secs(timeout_secs) + POLL_GRACE;
        self.call("getUpdates", &params, Some(timeout)).await
    }

    pub async fn get_file(&self, file_id: &str) -> Result<File, TelegramError> {
        self.call("getFile", &GetFileParams { file_id }, Some(REQUEST_TIMEOUT))
            .await
    }

    pub async fn download_file(&self, file_path: &str) -> Result<Vec<u8>, TelegramError> {
        let bytes = self
            .http
            .get(self.file_url(file_path))
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }

    fn check_size(&self, size: Option<u64>) -> Result<(), MediaError> {
        match size {
            Some(size) if size > self.max_download_bytes => Err(MediaError::Oversized {
                size,
                limit: self.max_download_bytes,
            }),
            _ => Ok(()),
        }
    }
}

fn is_file_too_big(err: &TelegramError) -> bool {
    matches!(err, TelegramError::Api { description, .. } if description.to_lowercase().contains("too big"))
}

#[async_trait]
impl MediaFetcher for TelegramClient {
    async fn fetch_media(&self, attachment: &Attachment) -> Result<FetchedMedia, MediaError> {
        self.check_size(attachment.file_size)?;

        let file = match self.get_file(&attachment.file_id).await {
            Ok(file) => file,
            Err(e) if is_file_too_big(&e) => {
                return Err(MediaError::Oversized {
                    size: attachment.file_size.unwrap_or(0),
                    limit: self.max_download_bytes,
                });
            }
            Err(e) => return Err(e.into()),
        };
        self.check_size(file.file_size)?;

        let file_path = file
            .file_path
            .ok_or_else(|| MediaError::MissingPath(attachment.file_id.clone()))?;
        debug!("Downloading {} {} from {}", attachment.kind, attachment.file_id, file_path);

        let bytes = self.download_file(&file_path).await?;
        let extension = Path::new(&file_path)
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned());

        Ok(FetchedMedia { bytes, extension })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;

    const TOKEN: &str = "123-test";

    fn attachment(file_id: &str, file_size: Option<u64>) -> Attachment {
        Attachment {
            kind: MediaKind::Document,
            file_id: file_id.to_string(),
            file_size,
        }
    }

    #[tokio::test]
    async fn test_fetch_media_downloads_file() {
        let mut server = mockito::Server::new_async().await;
        let get_file = server
            .mock("POST", "/bot123-test/getFile")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":true,"result":{"file_id":"f1","file_size":4,"file_path":"documents/report.pdf"}}"#)
            .create_async()
            .await;
        let download = server
            .mock("GET", "/file/bot123-test/documents/report.pdf")
            .with_status(200)
            .with_body("%PDF")
            .create_async()
            .await;

        let client = TelegramClient::with_api_url(&server.url(), TOKEN, 1024);
        let fetched = client.fetch_media(&attachment("f1", Some(4))).await.unwrap();

        assert_eq!(fetched.bytes, b"%PDF");
        assert_eq!(fetched.extension.as_deref(), Some("pdf"));
        get_file.assert_async().await;
        download.assert_async().await;
    }

    #[tokio::test]
    async fn test_declared_oversized_file_is_refused_without_request() {
        let mut server = mockito::Server::new_async().await;
        let get_file = server
            .mock("POST", "/bot123-test/getFile")
            .expect(0)
            .create_async()
            .await;

        let client = TelegramClient::with_api_url(&server.url(), TOKEN, 1024);
        let err = client
            .fetch_media(&attachment("huge", Some(4096)))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, MediaError::Oversized { size: 4096, limit: 1024 }));
        get_file.assert_async().await;
    }

    #[tokio::test]
    async fn test_too_big_api_error_maps_to_oversized() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/bot123-test/getFile")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":false,"error_code":400,"description":"Bad Request: file is too big"}"#)
            .create_async()
            .await;

        let client = TelegramClient::with_api_url(&server.url(), TOKEN, 1024);
        let err = client.fetch_media(&attachment("f2", None)).await.err().unwrap();
        assert!(matches!(err, MediaError::Oversized { .. }));
    }

    #[tokio::test]
    async fn test_other_api_errors_surface() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/bot123-test/getFile")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":false,"error_code":400,"description":"Bad Request: invalid file_id"}"#)
            .create_async()
            .await;

        let client = TelegramClient::with_api_url(&server.url(), TOKEN, 1024);
        let err = client.fetch_media(&attachment("nope", None)).await.err().unwrap();
        assert!(matches!(err, MediaError::Telegram(TelegramError::Api { .. })));
        assert!(err.to_string().contains("invalid file_id"));
    }

    #[tokio::test]
    async fn test_get_updates_parses_channel_posts() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/bot123-test/getUpdates")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "offset": 11,
                "allowed_updates": ["channel_post"]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":true,"result":[{"update_id":11,"channel_post":{"message_id":5,"chat":{"id":-100},"text":"hi"}}]}"#)
            .create_async()
            .await;

        let client = TelegramClient::with_api_url(&server.url(), TOKEN, 1024);
        let updates = client.get_updates(Some(11), 0).await.unwrap();

        assert_eq!(updates.len(), 1);
        let post = updates[0].channel_post.as_ref().unwrap();
        assert_eq!(post.text.as_deref(), Some("hi"));
    }
}
