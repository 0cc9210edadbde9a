//! Debounced assembly of Telegram media groups.
//!
//! A post with several attachments reaches the bot as one channel post per
//! attachment, all sharing a `media_group_id`. Fragments are buffered per group
//! in the order they were reserved, and a timer is (re)armed whenever the group
//! has no downloads outstanding. When the timer survives a full quiet window the
//! group is written as a single record.

use crate::db::{MessageStore, NewMediaGroup};
use crate::error::AggregatorError;
use crate::media::MediaKind;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// One channel post as seen by the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub struct PostFragment {
    pub group_id: Option<String>,
    pub source_message_id: i64,
    pub text: Option<String>,
    pub media_kind: Option<MediaKind>,
    /// `None` when the download failed or the post had no media.
    pub media_url: Option<String>,
}

struct PendingGroup {
    fragments: Vec<PostFragment>,
    /// Reserved fragments whose media is still being fetched.
    outstanding: usize,
    /// Tells this buffer apart from a later one under the same group id.
    epoch: u64,
    /// Identifies the only timer allowed to flush this group.
    generation: u64,
    /// Armed only while nothing is outstanding.
    timer: Option<AbortHandle>,
}

/// A fragment's place in its group, held while its media downloads.
#[derive(Debug)]
pub struct Slot {
    group_id: String,
    epoch: u64,
    index: usize,
}

impl Slot {
    pub fn group_id(&self) -> &str {
        &self.group_id
    }
}

struct Inner {
    store: Arc<dyn MessageStore>,
    window: Duration,
    pending: Mutex<HashMap<String, PendingGroup>>,
    sequence: AtomicU64,
    /// Timer and flush tasks, awaited on shutdown.
    tasks: TaskTracker,
}

#[derive(Clone)]
pub struct GroupAggregator {
    inner: Arc<Inner>,
}

impl GroupAggregator {
    pub fn new(store: Arc<dyn MessageStore>, window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                window,
                pending: Mutex::new(HashMap::new()),
                sequence: AtomicU64::new(0),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn pending_groups(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingGroup>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn next_sequence(&self) -> u64 {
        self.inner.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Buffers a fragment whose media is already known and restarts its group's quiet window.
    ///
    /// Must be called from within a tokio runtime. Never waits on the timer.
    pub fn add_fragment(&self, mut fragment: PostFragment) -> Result<(), AggregatorError> {
        let media_url = fragment.media_url.take();
        let slot = self.reserve(fragment)?;
        self.complete(slot, media_url);
        Ok(())
    }

    /// Appends a fragment before its media is fetched, fixing its position in the group.
    ///
    /// The group's timer is disarmed until every reserved slot is completed.
    pub fn reserve(&self, fragment: PostFragment) -> Result<Slot, AggregatorError> {
        let group_id = fragment
            .group_id
            .clone()
            .ok_or(AggregatorError::MissingGroupId(fragment.source_message_id))?;
        let message_id = fragment.source_message_id;

        let mut pending = self.lock();
        let group = pending.entry(group_id.clone()).or_insert_with(|| PendingGroup {
            fragments: Vec::new(),
            outstanding: 0,
            epoch: self.next_sequence(),
            generation: 0,
            timer: None,
        });
        if let Some(timer) = group.timer.take() {
            timer.abort();
        }
        group.fragments.push(fragment);
        group.outstanding += 1;
        let slot = Slot {
            group_id,
            epoch: group.epoch,
            index: group.fragments.len() - 1,
        };
        drop(pending);

        debug!(
            "Media group {}: reserved slot {} for message {}",
            slot.group_id, slot.index, message_id
        );
        Ok(slot)
    }

    /// Fills in a reserved fragment's media. The quiet window restarts once the
    /// group has no outstanding slots. Returns `false` if the group was already
    /// flushed or cancelled, in which case the media is dropped.
    pub fn complete(&self, slot: Slot, media_url: Option<String>) -> bool {
        let generation = self.next_sequence();

        // Cancel and reschedule under one lock so a group never has two live timers.
        let mut pending = self.lock();
        let Some(group) = pending
            .get_mut(&slot.group_id)
            .filter(|group| group.epoch == slot.epoch)
        else {
            warn!(
                "Media group {}: slot {} completed after the group was flushed",
                slot.group_id, slot.index
            );
            return false;
        };

        if let Some(fragment) = group.fragments.get_mut(slot.index) {
            fragment.media_url = media_url;
        }
        group.outstanding = group.outstanding.saturating_sub(1);
        let buffered = group.fragments.len();
        if group.outstanding == 0 {
            if let Some(timer) = group.timer.take() {
                timer.abort();
            }
            group.generation = generation;
            group.timer = Some(self.schedule_expiry(slot.group_id.clone(), generation));
        }
        drop(pending);

        debug!(
            "Media group {}: slot {} ready ({} fragment(s))",
            slot.group_id, slot.index, buffered
        );
        true
    }

    fn schedule_expiry(&self, group_id: String, generation: u64) -> AbortHandle {
        let aggregator = self.clone();
        let window = self.inner.window;
        self.inner
            .tasks
            .spawn(async move {
                tokio::time::sleep(window).await;
                aggregator.expire(&group_id, generation).await;
            })
            .abort_handle()
    }

    /// Timer callback. Only the most recent schedule for a group may flush it.
    async fn expire(&self, group_id: &str, generation: u64) {
        let fragments = {
            let mut pending = self.lock();
            let current = pending
                .get(group_id)
                .is_some_and(|group| group.outstanding == 0 && group.generation == generation);
            if current {
                pending.remove(group_id).map(|group| group.fragments)
            } else {
                None
            }
        };

        let Some(fragments) = fragments else {
            debug!("Media group {}: stale timer ignored", group_id);
            return;
        };

        if let Err(e) = self.persist(group_id, fragments).await {
            error!("Failed to store media group {}: {}", group_id, e);
        }
    }

    /// Flushes a group now. Returns `Ok(None)` when there is nothing buffered under `group_id`.
    pub async fn flush(&self, group_id: &str) -> anyhow::Result<Option<i64>> {
        let Some(fragments) = self.take(group_id) else {
            return Ok(None);
        };
        self.persist(group_id, fragments).await.map(Some)
    }

    /// Drops a buffered group without storing it.
    pub fn cancel(&self, group_id: &str) -> Option<Vec<PostFragment>> {
        let fragments = self.take(group_id);
        if fragments.is_some() {
            info!("Media group {}: cancelled", group_id);
        }
        fragments
    }

    /// Flushes every buffered group immediately.
    pub async fn flush_all(&self) -> usize {
        let group_ids: Vec<String> = self.lock().keys().cloned().collect();
        let mut flushed = 0;
        for group_id in group_ids {
            match self.flush(&group_id).await {
                Ok(Some(_)) => flushed += 1,
                Ok(None) => {}
                Err(e) => error!("Failed to store media group {}: {}", group_id, e),
            }
        }
        flushed
    }

    /// Flushes every buffered group, then waits for timer flushes already writing.
    pub async fn shutdown(&self) -> usize {
        let flushed = self.flush_all().await;
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        flushed
    }

    /// Removes the entry and kills its timer in one step.
    fn take(&self, group_id: &str) -> Option<Vec<PostFragment>> {
        let group = self.lock().remove(group_id)?;
        if let Some(timer) = group.timer {
            timer.abort();
        }
        if group.outstanding > 0 {
            warn!(
                "Media group {}: flushed with {} download(s) still running",
                group_id, group.outstanding
            );
        }
        Some(group.fragments)
    }

    async fn persist(&self, group_id: &str, fragments: Vec<PostFragment>) -> anyhow::Result<i64> {
        let Some(record) = assemble(group_id, fragments) else {
            anyhow::bail!("media group {} has no fragments", group_id);
        };
        let items = record.media_urls.len();
        let id = self.inner.store.insert_group(record).await?;
        info!(
            "Media group {}: stored as message {} with {} media item(s)",
            group_id, id, items
        );
        Ok(id)
    }
}

/// Builds the grouped record: the first fragment supplies the message id and text,
/// and every fragment with a downloaded file contributes its media in arrival order.
pub fn assemble(group_id: &str, fragments: Vec<PostFragment>) -> Option<NewMediaGroup> {
    let first = fragments.first()?;
    let source_message_id = first.source_message_id;
    let text = first.text.clone();

    let (media_kinds, media_urls): (Vec<MediaKind>, Vec<String>) = fragments
        .into_iter()
        .filter_map(|f| match (f.media_kind, f.media_url) {
            (Some(kind), Some(url)) => Some((kind, url)),
            _ => None,
        })
        .unzip();

    Some(NewMediaGroup {
        source_message_id,
        text,
        media_kinds,
        media_urls,
        group_id: group_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::recording::RecordingStore;

    const WINDOW: Duration = Duration::from_secs(2);

    fn fragment(group: &str, id: i64, text: &str, url: Option<&str>) -> PostFragment {
        PostFragment {
            group_id: Some(group.to_string()),
            source_message_id: id,
            text: Some(text.to_string()),
            media_kind: Some(MediaKind::Photo),
            media_url: url.map(str::to_string),
        }
    }

    fn setup() -> (Arc<RecordingStore>, GroupAggregator) {
        let store = Arc::new(RecordingStore::default());
        let aggregator = GroupAggregator::new(store.clone(), WINDOW);
        (store, aggregator)
    }

    async fn wait(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_within_window_flushes_once_in_arrival_order() {
        let (store, aggregator) = setup();

        aggregator.add_fragment(fragment("G1", 1, "cap", Some("u1"))).unwrap();
        wait(300).await;
        let mut video = fragment("G1", 2, "", Some("u2"));
        video.media_kind = Some(MediaKind::Video);
        aggregator.add_fragment(video).unwrap();
        wait(300).await;
        aggregator.add_fragment(fragment("G1", 3, "", None)).unwrap();

        // Not yet: the window restarted with the last fragment
        wait(1900).await;
        assert!(store.groups().is_empty());
        assert_eq!(aggregator.pending_groups(), 1);

        wait(200).await;
        let groups = store.groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].source_message_id, 1);
        assert_eq!(groups[0].text.as_deref(), Some("cap"));
        assert_eq!(groups[0].media_urls, vec!["u1".to_string(), "u2".to_string()]);
        assert_eq!(groups[0].media_kinds, vec![MediaKind::Photo, MediaKind::Video]);
        assert_eq!(groups[0].group_id, "G1");
        assert_eq!(aggregator.pending_groups(), 0);

        // Superseded timers never produce a second record
        wait(5000).await;
        assert_eq!(store.groups().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_longer_than_window_flushes_each_quiet_period() {
        let (store, aggregator) = setup();

        aggregator.add_fragment(fragment("G1", 1, "first", Some("a"))).unwrap();
        wait(2500).await;
        aggregator.add_fragment(fragment("G1", 2, "second", Some("b"))).unwrap();
        wait(2500).await;

        let groups = store.groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].media_urls, vec!["a".to_string()]);
        assert_eq!(groups[1].media_urls, vec!["b".to_string()]);
        assert_eq!(groups[1].text.as_deref(), Some("second"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_groups_are_independent() {
        let (store, aggregator) = setup();

        aggregator.add_fragment(fragment("A", 1, "a", Some("a1"))).unwrap();
        wait(1000).await;
        aggregator.add_fragment(fragment("B", 2, "b", Some("b1"))).unwrap();
        wait(1100).await;

        // A expired, B still waiting
        let groups = store.groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group_id, "A");

        wait(1000).await;
        assert_eq!(store.groups().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_is_idempotent() {
        let (store, aggregator) = setup();

        assert_eq!(aggregator.flush("missing").await.unwrap(), None);

        aggregator.add_fragment(fragment("G1", 1, "x", Some("u"))).unwrap();
        assert!(aggregator.flush("G1").await.unwrap().is_some());
        assert_eq!(aggregator.flush("G1").await.unwrap(), None);

        // The cancelled timer must not flush again
        wait(3000).await;
        assert_eq!(store.groups().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_downloads_failed_still_flushes_text() {
        let (store, aggregator) = setup();

        aggregator.add_fragment(fragment("G1", 7, "caption only", None)).unwrap();
        aggregator.add_fragment(fragment("G1", 8, "", None)).unwrap();
        wait(2100).await;

        let groups = store.groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].text.as_deref(), Some("caption only"));
        assert!(groups[0].media_urls.is_empty());
        assert!(groups[0].media_kinds.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_group() {
        let (store, aggregator) = setup();

        aggregator.add_fragment(fragment("G1", 1, "x", Some("u"))).unwrap();
        let dropped = aggregator.cancel("G1").unwrap();
        assert_eq!(dropped.len(), 1);
        assert!(aggregator.cancel("G1").is_none());

        wait(3000).await;
        assert!(store.groups().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_all_drains_pending_groups() {
        let (store, aggregator) = setup();

        aggregator.add_fragment(fragment("A", 1, "a", Some("a1"))).unwrap();
        aggregator.add_fragment(fragment("B", 2, "b", Some("b1"))).unwrap();
        assert_eq!(aggregator.flush_all().await, 2);
        assert_eq!(aggregator.pending_groups(), 0);

        wait(3000).await;
        assert_eq!(store.groups().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_failure_is_reported_and_group_dropped() {
        let store = Arc::new(RecordingStore::failing());
        let aggregator = GroupAggregator::new(store.clone(), WINDOW);

        aggregator.add_fragment(fragment("G1", 1, "x", Some("u"))).unwrap();
        assert!(aggregator.flush("G1").await.is_err());
        assert_eq!(aggregator.pending_groups(), 0);
    }

    #[tokio::test]
    async fn test_fragment_without_group_is_rejected() {
        let (_store, aggregator) = setup();
        let mut loose = fragment("G1", 9, "x", None);
        loose.group_id = None;

        let err = aggregator.add_fragment(loose).unwrap_err();
        assert!(matches!(err, AggregatorError::MissingGroupId(9)));
        assert_eq!(aggregator.pending_groups(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserved_order_survives_out_of_order_downloads() {
        let (store, aggregator) = setup();

        let first = aggregator.reserve(fragment("G1", 100, "cap", None)).unwrap();
        let second = aggregator.reserve(fragment("G1", 101, "", None)).unwrap();
        assert_eq!(first.group_id(), "G1");

        // The later post finishes first; the window stays closed for the slow one
        assert!(aggregator.complete(second, Some("u101".to_string())));
        wait(5000).await;
        assert!(store.groups().is_empty());

        assert!(aggregator.complete(first, Some("u100".to_string())));
        wait(1900).await;
        assert!(store.groups().is_empty());
        wait(200).await;

        let groups = store.groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].source_message_id, 100);
        assert_eq!(groups[0].text.as_deref(), Some("cap"));
        assert_eq!(groups[0].media_urls, vec!["u100".to_string(), "u101".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_disarms_running_timer() {
        let (store, aggregator) = setup();

        aggregator.add_fragment(fragment("G1", 1, "cap", Some("u1"))).unwrap();
        wait(1500).await;
        let slot = aggregator.reserve(fragment("G1", 2, "", None)).unwrap();
        wait(3000).await;
        assert!(store.groups().is_empty());

        aggregator.complete(slot, None);
        wait(2100).await;
        assert_eq!(store.groups().len(), 1);
        assert_eq!(store.groups()[0].media_urls, vec!["u1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_after_flush_is_dropped() {
        let (store, aggregator) = setup();

        let stale = aggregator.reserve(fragment("G1", 1, "cap", None)).unwrap();
        assert!(aggregator.flush("G1").await.unwrap().is_some());

        // A new buffer under the same id must not receive the old slot
        aggregator.add_fragment(fragment("G1", 2, "next", Some("u2"))).unwrap();
        assert!(!aggregator.complete(stale, Some("u1".to_string())));

        wait(2100).await;
        let groups = store.groups();
        assert_eq!(groups.len(), 2);
        assert!(groups[0].media_urls.is_empty());
        assert_eq!(groups[1].media_urls, vec!["u2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_flush_in_progress() {
        let store = Arc::new(RecordingStore::slow_groups(Duration::from_millis(500)));
        let aggregator = GroupAggregator::new(store.clone(), WINDOW);

        aggregator.add_fragment(fragment("G1", 1, "x", Some("u"))).unwrap();
        aggregator.add_fragment(fragment("G2", 2, "y", Some("v"))).unwrap();
        aggregator.cancel("G2");
        // G1's timer has fired and is writing
        wait(2100).await;
        assert_eq!(aggregator.pending_groups(), 0);
        assert!(store.groups().is_empty());

        assert_eq!(aggregator.shutdown().await, 0);
        assert_eq!(store.groups().len(), 1);
    }

    #[test]
    fn test_assemble_keeps_first_text_and_drops_missing_media() {
        let record = assemble(
            "G1",
            vec![
                fragment("G1", 1, "cap", Some("u1")),
                fragment("G1", 2, "", Some("u2")),
                fragment("G1", 3, "", None),
            ],
        )
        .unwrap();

        assert_eq!(record.source_message_id, 1);
        assert_eq!(record.text.as_deref(), Some("cap"));
        assert_eq!(record.media_urls, vec!["u1".to_string(), "u2".to_string()]);
        assert!(assemble("G1", Vec::new()).is_none());
    }
}
