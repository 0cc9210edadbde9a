use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum TelegramError {
    #[error("Telegram API call {method} failed: {description}")]
    Api { method: String, description: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("File of {size} bytes exceeds the {limit} byte download limit")]
    Oversized { size: u64, limit: u64 },

    #[error("File {0} has no download path")]
    MissingPath(String),

    #[error(transparent)]
    Telegram(#[from] TelegramError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error("Message {0} carries no media group id")]
    MissingGroupId(i64),
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error!("API request failed: {}", self);

        (status, self.to_string()).into_response()
    }
}
