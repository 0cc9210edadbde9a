use crate::aggregator::{GroupAggregator, PostFragment, Slot};
use crate::db::{MessageStore, NewMessage};
use crate::error::AggregatorError;
use crate::media::{Attachment, MediaFetcher, MediaKind, MediaStore};
use crate::telegram::{FileRef, Message};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, PartialEq)]
pub enum Ingested {
    /// Ungrouped post written immediately under this row id.
    Stored(i64),
    /// Handed to the aggregator; the row is written once the group goes quiet.
    Buffered { group_id: String },
}

/// A post that has been routed but whose media is not fetched yet.
#[derive(Debug)]
pub struct Admission {
    message_id: i64,
    text: String,
    attachment: Option<Attachment>,
    route: Route,
}

#[derive(Debug)]
enum Route {
    Single,
    Group(Slot),
}

pub struct IngestionHandler {
    fetcher: Arc<dyn MediaFetcher>,
    media: MediaStore,
    store: Arc<dyn MessageStore>,
    aggregator: GroupAggregator,
}

impl IngestionHandler {
    pub fn new(
        fetcher: Arc<dyn MediaFetcher>,
        media: MediaStore,
        store: Arc<dyn MessageStore>,
        aggregator: GroupAggregator,
    ) -> Self {
        Self {
            fetcher,
            media,
            store,
            aggregator,
        }
    }

    /// Classifies a post without waiting on anything. Grouped posts take their
    /// place in the group here, so posts admitted in delivery order are stored in
    /// that order however long their downloads take.
    pub fn admit(&self, post: &Message) -> Result<Admission, AggregatorError> {
        let text = extract_text(post);
        let attachment = select_attachment(post);

        let route = match &post.media_group_id {
            None => Route::Single,
            Some(group_id) => Route::Group(self.aggregator.reserve(PostFragment {
                group_id: Some(group_id.clone()),
                source_message_id: post.message_id,
                text: Some(text.clone()),
                media_kind: attachment.as_ref().map(|a| a.kind),
                media_url: None,
            })?),
        };

        Ok(Admission {
            message_id: post.message_id,
            text,
            attachment,
            route,
        })
    }

    /// Fetches the media, then stores the post or fills in its group slot.
    pub async fn complete(&self, admission: Admission) -> anyhow::Result<Ingested> {
        let Admission {
            message_id,
            text,
            attachment,
            route,
        } = admission;

        let media_kind = attachment.as_ref().map(|a| a.kind);
        let media_url = match &attachment {
            Some(attachment) => self.download(message_id, attachment).await,
            None => None,
        };

        match route {
            Route::Single => {
                let id = self
                    .store
                    .insert_single(NewMessage {
                        source_message_id: message_id,
                        text,
                        media_kind,
                        media_url,
                    })
                    .await?;
                debug!("Stored message {} as row {}", message_id, id);
                Ok(Ingested::Stored(id))
            }
            Route::Group(slot) => {
                let group_id = slot.group_id().to_string();
                self.aggregator.complete(slot, media_url);
                Ok(Ingested::Buffered { group_id })
            }
        }
    }

    pub async fn handle_post(&self, post: &Message) -> anyhow::Result<Ingested> {
        let admission = self.admit(post)?;
        self.complete(admission).await
    }

    /// Failed downloads degrade to a post without media.
    async fn download(&self, message_id: i64, attachment: &Attachment) -> Option<String> {
        let fetched = match self.fetcher.fetch_media(attachment).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(
                    "Skipping {} of message {}: {}",
                    attachment.kind, message_id, e
                );
                return None;
            }
        };

        match self
            .media
            .store_media(
                &fetched.bytes,
                attachment.kind,
                message_id,
                fetched.extension.as_deref(),
            )
            .await
        {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(
                    "Failed to save {} of message {}: {}",
                    attachment.kind, message_id, e
                );
                None
            }
        }
    }
}

/// Text, then caption, then the empty string.
pub fn extract_text(post: &Message) -> String {
    post.text
        .as_deref()
        .filter(|t| !t.is_empty())
        .or(post.caption.as_deref())
        .unwrap_or_default()
        .to_string()
}

/// Picks the single attachment to mirror. Photos use the largest resolution offered.
pub fn select_attachment(post: &Message) -> Option<Attachment> {
    if let Some(best) = post.photo.as_deref().and_then(|sizes| {
        sizes
            .iter()
            .max_by_key(|p| (u64::from(p.width) * u64::from(p.height), p.file_size.unwrap_or(0)))
    }) {
        return Some(Attachment {
            kind: MediaKind::Photo,
            file_id: best.file_id.clone(),
            file_size: best.file_size,
        });
    }

    // Animations also carry a `document`, so they are checked first.
    let candidates: [(MediaKind, &Option<FileRef>); 5] = [
        (MediaKind::Video, &post.video),
        (MediaKind::Animation, &post.animation),
        (MediaKind::Document, &post.document),
        (MediaKind::Audio, &post.audio),
        (MediaKind::Voice, &post.voice),
    ];
    candidates.into_iter().find_map(|(kind, file)| {
        file.as_ref().map(|f| Attachment {
            kind,
            file_id: f.file_id.clone(),
            file_size: f.file_size,
        })
    })
}
