use crate::error::MediaError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
    Animation,
    Audio,
    Voice,
    Document,
}

impl MediaKind {
    pub const ALL: [MediaKind; 6] = [
        MediaKind::Photo,
        MediaKind::Video,
        MediaKind::Animation,
        MediaKind::Audio,
        MediaKind::Voice,
        MediaKind::Document,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Animation => "animation",
            MediaKind::Audio => "audio",
            MediaKind::Voice => "voice",
            MediaKind::Document => "document",
        }
    }

    /// Subdirectory of the media root this kind is stored under.
    pub fn directory(&self) -> &'static str {
        match self {
            MediaKind::Photo => "img",
            MediaKind::Video | MediaKind::Animation => "video",
            MediaKind::Audio | MediaKind::Voice => "audio",
            MediaKind::Document => "documents",
        }
    }

    pub fn default_extension(&self) -> &'static str {
        match self {
            MediaKind::Photo => "jpg",
            MediaKind::Video | MediaKind::Animation => "mp4",
            MediaKind::Audio => "mp3",
            MediaKind::Voice => "ogg",
            MediaKind::Document => "file",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One downloadable attachment picked out of a channel post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub kind: MediaKind,
    pub file_id: String,
    /// Size declared by the sender, if any. Used to refuse oversized files up front.
    pub file_size: Option<u64>,
}

pub struct FetchedMedia {
    pub bytes: Vec<u8>,
    pub extension: Option<String>,
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch_media(&self, attachment: &Attachment) -> Result<FetchedMedia, MediaError>;
}

/// Local media directory served under `/media`.
///
/// Layout:
/// ```text
/// <root>/
///   img/        photos
///   video/      videos and animations
///   audio/      audio and voice notes
///   documents/  everything else
/// ```
#[derive(Clone)]
pub struct MediaStore {
    root: PathBuf,
    public_base_url: String,
}

impl MediaStore {
    /// Creates the media root and every kind subdirectory.
    pub fn new(root: impl AsRef<Path>, public_base_url: &str) -> Result<Self, MediaError> {
        let root = root.as_ref().to_path_buf();
        for kind in MediaKind::ALL {
            std::fs::create_dir_all(root.join(kind.directory()))?;
        }

        Ok(Self {
            root,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// `{source_message_id}_{kind}.{ext}`. Only documents keep the upstream extension.
    pub fn file_name(kind: MediaKind, source_message_id: i64, extension: Option<&str>) -> String {
        let extension = match (kind, extension.and_then(sanitize_extension)) {
            (MediaKind::Document, Some(ext)) => ext,
            _ => kind.default_extension().to_string(),
        };
        format!("{}_{}.{}", source_message_id, kind, extension)
    }

    /// Writes the bytes atomically and returns the public URL of the file.
    pub async fn store_media(
        &self,
        bytes: &[u8],
        kind: MediaKind,
        source_message_id: i64,
        extension: Option<&str>,
    ) -> Result<String, MediaError> {
        let file_name = Self::file_name(kind, source_message_id, extension);
        let dir = self.root.join(kind.directory());
        if !dir.exists() {
            fs::create_dir_all(&dir).await?;
        }

        let file_path = dir.join(&file_name);
        let temp_path = dir.join(format!(".{}.tmp", file_name));
        fs::write(&temp_path, bytes).await?;
        fs::rename(&temp_path, &file_path).await?;

        let url = format!(
            "{}/media/{}/{}",
            self.public_base_url,
            kind.directory(),
            file_name
        );
        info!("Saved media file {:?} ({} bytes), URL: {}", file_path, bytes.len(), url);
        Ok(url)
    }
}

fn sanitize_extension(ext: &str) -> Option<String> {
    let ext = ext.trim().trim_start_matches('.');
    if ext.is_empty() || ext.len() > 10 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
