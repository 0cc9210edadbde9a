use super::{MessageStore, NewMediaGroup, NewMessage};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

/// In-memory `MessageStore` that records every insert.
#[derive(Default)]
pub(crate) struct RecordingStore {
    pub singles: Mutex<Vec<NewMessage>>,
    pub groups: Mutex<Vec<NewMediaGroup>>,
    pub fail_inserts: bool,
    /// Grouped inserts sleep this long before recording.
    pub group_delay: Option<Duration>,
}

impl RecordingStore {
    pub fn failing() -> Self {
        Self {
            fail_inserts: true,
            ..Default::default()
        }
    }

    pub fn slow_groups(delay: Duration) -> Self {
        Self {
            group_delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn singles(&self) -> Vec<NewMessage> {
        self.singles.lock().unwrap().clone()
    }

    pub fn groups(&self) -> Vec<NewMediaGroup> {
        self.groups.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageStore for RecordingStore {
    async fn insert_single(&self, message: NewMessage) -> anyhow::Result<i64> {
        if self.fail_inserts {
            anyhow::bail!("insert refused");
        }
        let mut singles = self.singles.lock().unwrap();
        singles.push(message);
        Ok(singles.len() as i64)
    }

    async fn insert_group(&self, group: NewMediaGroup) -> anyhow::Result<i64> {
        if self.fail_inserts {
            anyhow::bail!("insert refused");
        }
        if let Some(delay) = self.group_delay {
            tokio::time::sleep(delay).await;
        }
        let mut groups = self.groups.lock().unwrap();
        groups.push(group);
        Ok(1000 + groups.len() as i64)
    }
}
