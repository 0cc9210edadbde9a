use super::{TelegramClient, Update};
use crate::config::Config;
use crate::error::TelegramError;
use crate::ingest::{IngestionHandler, Ingested};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

pub struct UpdatePoller {
    client: Arc<TelegramClient>,
    handler: Arc<IngestionHandler>,
    channel_id: i64,
    poll_timeout_secs: u64,
    retry_delay: Duration,
    /// In-flight post handlers.
    tasks: TaskTracker,
}

impl UpdatePoller {
    pub fn new(client: Arc<TelegramClient>, handler: Arc<IngestionHandler>, config: &Config) -> Self {
        Self {
            client,
            handler,
            channel_id: config.channel_id,
            poll_timeout_secs: config.poll_timeout_secs,
            retry_delay: Duration::from_secs(config.poll_retry_secs),
            tasks: TaskTracker::new(),
        }
    }

    pub async fn run(&self) {
        info!("Polling channel {} for posts...", self.channel_id);
        let mut offset: Option<i64> = None;
        loop {
            match self.poll_once(offset).await {
                Ok(next) => offset = next,
                Err(e) => {
                    error!("getUpdates failed: {}", e);
                    sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Fetches one batch of updates, dispatches them and returns the next offset.
    pub async fn poll_once(&self, offset: Option<i64>) -> Result<Option<i64>, TelegramError> {
        let updates = self
            .client
            .get_updates(offset, self.poll_timeout_secs)
            .await?;

        let mut next = offset;
        for update in updates {
            next = Some(update.update_id + 1);
            self.dispatch(update);
        }
        Ok(next)
    }

    /// Waits for every dispatched post to finish. Call once polling has stopped.
    pub async fn drain(&self) {
        self.tasks.close();
        if !self.tasks.is_empty() {
            info!("Waiting for {} post(s) still being ingested", self.tasks.len());
        }
        self.tasks.wait().await;
    }

    /// Admission runs here in delivery order; each download then gets its own task
    /// so a slow file does not hold up other posts.
    fn dispatch(&self, update: Update) -> bool {
        let Some(post) = update.channel_post else {
            return false;
        };
        if post.chat_id() != Some(self.channel_id) {
            debug!(
                "Ignoring post {} from chat {:?}",
                post.message_id,
                post.chat_id()
            );
            return false;
        }

        info!(
            "Received channel post {} (group: {:?})",
            post.message_id, post.media_group_id
        );
        let admission = match self.handler.admit(&post) {
            Ok(admission) => admission,
            Err(e) => {
                error!("Failed to ingest post {}: {}", post.message_id, e);
                return false;
            }
        };

        let handler = self.handler.clone();
        let message_id = post.message_id;
        self.tasks.spawn(async move {
            match handler.complete(admission).await {
                Ok(Ingested::Stored(id)) => {
                    debug!("Post {} stored as row {}", message_id, id)
                }
                Ok(Ingested::Buffered { group_id }) => {
                    debug!("Post {} buffered in media group {}", message_id, group_id)
                }
                Err(e) => error!("Failed to ingest post {}: {}", message_id, e),
            }
        });
        true
    }
}
